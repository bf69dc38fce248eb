// SPDX-FileCopyrightText: 2024-2025 The flashpack developers
// SPDX-License-Identifier: GPL-3.0-only

//! Target description: which flashes exist and which sections go into them.
//!
//! The description is a JSON document. Every section is a tagged object
//! whose `type` selects the codec; unknown or missing required fields are
//! rejected during deserialization, before any layout work starts.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::flash::FlashType;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read config: {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Deserialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub flashes: Vec<FlashConfig>,
}

impl TargetConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::Io {
            path: path.to_owned(),
            source: e,
        })?;

        serde_json::from_reader(BufReader::new(file)).map_err(|e| Error::Parse {
            path: path.to_owned(),
            source: e,
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct FlashConfig {
    pub name: String,
    pub flash_type: FlashType,
    pub size: u64,
    /// Interface number of the flash controller.
    #[serde(default)]
    pub itf: u8,
    /// Chip select on that interface.
    #[serde(default)]
    pub cs: u8,
    pub sections: Vec<SectionConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SectionConfig {
    pub name: String,
    /// Declared section size in bytes. `-1` means "rest of the flash";
    /// absent means "exactly the content size".
    #[serde(default)]
    pub size: Option<i64>,
    /// Alignment of the section's start offset.
    #[serde(default)]
    pub align: Option<u64>,
    #[serde(flatten)]
    pub kind: SectionKind,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SectionKind {
    Rom(RomConfig),
    AppBinary(AppBinaryConfig),
    PartitionTable,
    PartitionTableV2,
    VolumeTable(VolumeTableConfig),
    MetaTable(MetaTableConfig),
    Writefs(WritefsConfig),
    SecretStorage(SecretStorageConfig),
    Raw(RawConfig),
}

#[derive(Clone, Debug, Deserialize)]
pub struct RomConfig {
    #[serde(default)]
    pub binary: Option<PathBuf>,
    /// A non-bootable ROM section reserves its slot but flashes nothing.
    #[serde(default = "default_true")]
    pub boot: bool,
    /// `fsbl` or `ssbl`; anything else is an unclassified partition.
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default = "default_xip_vaddr")]
    pub xip_virtual_address: u64,
    /// Overrides the recorded flash offset of the first XIP segment.
    #[serde(default)]
    pub xip_flash_address: Option<u64>,
    /// Page size exponent: the page is `512 << n` bytes.
    #[serde(default)]
    pub xip_page_size: u32,
    /// Number of pages of the SRAM cache backing the XIP window.
    #[serde(default = "default_xip_page_number")]
    pub xip_page_number: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppBinaryConfig {
    #[serde(default)]
    pub binary: Option<PathBuf>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default = "default_true")]
    pub compress: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct VolumeTableConfig {
    /// Explicit volume list. Absent selects the default app/factory
    /// grouping.
    #[serde(default)]
    pub volumes: Option<Vec<VolumeConfig>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct VolumeConfig {
    pub name: String,
    #[serde(default)]
    pub bootable: bool,
    #[serde(default)]
    pub boot_order: u8,
    #[serde(default)]
    pub boot_count: u8,
    /// Section names, resolved against every flash of the target.
    pub partitions: Vec<String>,
    /// Zero-filled entries reserved for future partitions.
    #[serde(default)]
    pub free_entry_nb: u8,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MetaTableConfig {
    #[serde(default)]
    pub ssbl_a: Option<String>,
    #[serde(default)]
    pub ssbl_b: Option<String>,
    #[serde(default)]
    pub pt_a: Option<String>,
    #[serde(default)]
    pub pt_b: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WritefsConfig {
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// File payloads and block headers are sized up to this alignment.
    #[serde(default = "default_block_align")]
    pub block_align: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SecretStorageConfig {
    #[serde(default)]
    pub encrypted: bool,
    pub kc_list: Vec<KeyCodeConfig>,
    #[serde(default)]
    pub ac_list: Vec<AcConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct KeyCodeConfig {
    #[serde(default)]
    pub name: Option<String>,
    /// Source key size in bits.
    pub size: u64,
    /// Absent selects wrapping automatically (wrapped iff size < 1024).
    #[serde(default)]
    pub wrapped: Option<bool>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AcConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub image: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_xip_vaddr() -> u64 {
    0x2000_0000
}

fn default_xip_page_number() -> u32 {
    0x10
}

fn default_block_align() -> u64 {
    4096
}
