// SPDX-FileCopyrightText: 2024-2025 The flashpack developers
// SPDX-License-Identifier: GPL-3.0-only

//! One module per on-flash section format, plus the closed dispatch enum
//! tying them to the container's two-phase build.

pub mod app_binary;
pub mod meta_table;
pub mod padding;
pub mod partition;
pub mod raw;
pub mod rom;
pub mod secret;
pub mod volume;
pub mod writefs;

use crate::config::SectionKind;
use crate::flash::{FinalizeContext, LayoutContext, Result};

/// Every section kind an image can contain. The set is closed: adding a
/// format means adding a variant here and a config variant in
/// [`SectionKind`].
pub enum SectionCodec {
    Rom(rom::RomSection),
    AppBinary(app_binary::AppBinarySection),
    Partition(partition::PartitionTableSection),
    Volume(volume::VolumeTableSection),
    MetaTable(meta_table::MetaTableSection),
    Writefs(writefs::WritefsSection),
    Secret(secret::SecretStorageSection),
    Raw(raw::RawSection),
}

macro_rules! dispatch {
    ($self:expr, $codec:pat => $action:expr) => {
        match $self {
            SectionCodec::Rom($codec) => $action,
            SectionCodec::AppBinary($codec) => $action,
            SectionCodec::Partition($codec) => $action,
            SectionCodec::Volume($codec) => $action,
            SectionCodec::MetaTable($codec) => $action,
            SectionCodec::Writefs($codec) => $action,
            SectionCodec::Secret($codec) => $action,
            SectionCodec::Raw($codec) => $action,
        }
    };
}

impl SectionCodec {
    /// Construct the codec for a configured section, reading its input
    /// files.
    pub fn new(name: &str, kind: &SectionKind) -> Result<Self> {
        Ok(match kind {
            SectionKind::Rom(c) => Self::Rom(rom::RomSection::new(name, c)?),
            SectionKind::AppBinary(c) => {
                Self::AppBinary(app_binary::AppBinarySection::new(name, c)?)
            }
            SectionKind::PartitionTable => {
                Self::Partition(partition::PartitionTableSection::new_v1())
            }
            SectionKind::PartitionTableV2 => {
                Self::Partition(partition::PartitionTableSection::new_v2())
            }
            SectionKind::VolumeTable(c) => {
                Self::Volume(volume::VolumeTableSection::new(name, c))
            }
            SectionKind::MetaTable(c) => {
                Self::MetaTable(meta_table::MetaTableSection::new(c))
            }
            SectionKind::Writefs(c) => {
                Self::Writefs(writefs::WritefsSection::new(name, c)?)
            }
            SectionKind::SecretStorage(c) => {
                Self::Secret(secret::SecretStorageSection::new(name, c)?)
            }
            SectionKind::Raw(c) => Self::Raw(raw::RawSection::new(name, c)?),
        })
    }

    /// Partition (type, subtype) stored for this section in partition
    /// table records.
    pub fn partition_class(&self) -> (u8, u8) {
        dispatch!(self, c => c.partition_class())
    }

    /// Phase 1: compute the section's structure at its assigned offset.
    pub fn layout(
        &mut self,
        offset: u64,
        reserved: Option<u64>,
        ctx: &LayoutContext,
    ) -> Result<()> {
        dispatch!(self, c => c.layout(offset, reserved, ctx))
    }

    /// Phase 2: fill in fields that depend on other sections' placement.
    pub fn finalize(&mut self, ctx: &FinalizeContext) -> Result<()> {
        dispatch!(self, c => c.finalize(ctx))
    }

    pub fn is_empty(&self) -> bool {
        dispatch!(self, c => c.is_empty())
    }

    pub fn content_size(&self) -> u64 {
        dispatch!(self, c => c.content_size())
    }

    pub fn pack(&self) -> Vec<u8> {
        dispatch!(self, c => c.pack())
    }
}
