// SPDX-FileCopyrightText: 2024-2025 The flashpack developers
// SPDX-License-Identifier: GPL-3.0-only

//! Flash container and two-phase image build.
//!
//! A [`Target`] owns ordered [`Flash`]es, each owning ordered sections.
//! Building an image runs two passes over every section in declaration
//! order: `layout` computes each section's internal structure and assigns
//! its offset, then `finalize` patches fields that depend on the position
//! of sections placed later (next-section pointers, cross-section tables,
//! checksums over the finished payload).
//!
//! The two phases have different read-sets, enforced by the context types:
//! [`LayoutContext`] exposes the placed geometry of *prior* sections only,
//! while [`FinalizeContext`] exposes all of them.

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{FlashConfig, TargetConfig};
use crate::elf;
use crate::format::{padding, SectionCodec};
use crate::layout;

#[derive(Debug, Error)]
pub enum Error {
    #[error("section {section:?}: {message}")]
    Configuration { section: String, message: String },
    #[error(
        "section {section:?}: content ({content:#x} bytes) exceeds declared \
         size ({declared:#x} bytes)"
    )]
    SectionOverflow {
        section: String,
        content: u64,
        declared: u64,
    },
    #[error(
        "flash {flash:?}: section {section:?} ends at {end:#x}, but the \
         flash is only {size:#x} bytes"
    )]
    FlashOverflow {
        flash: String,
        section: String,
        end: u64,
        size: u64,
    },
    #[error("section {section:?}: failed to read {path:?}")]
    InputRead {
        section: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("section {section:?}: invalid binary {path:?}")]
    InvalidBinary {
        section: String,
        path: PathBuf,
        #[source]
        source: elf::Error,
    },
    #[error("section {section:?} references unknown section {target:?}")]
    CrossReference { section: String, target: String },
    #[error("layout error")]
    Layout(#[from] layout::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Flash technology. The partition record code and the XIP device code use
/// different historical numberings, so both are explicit.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FlashType {
    Mram,
    Spi,
    Hyper,
}

impl FlashType {
    /// Code stored in partition table records.
    pub fn partition_code(self) -> u8 {
        match self {
            Self::Mram => 0x0,
            Self::Spi => 0x1,
            Self::Hyper => 0x2,
        }
    }

    /// Device code stored in ROM/app-binary XIP headers.
    pub fn xip_device(self) -> u32 {
        match self {
            Self::Hyper => 0,
            Self::Spi => 1,
            Self::Mram => 2,
        }
    }
}

/// Static attributes of one flash.
#[derive(Clone, Debug)]
pub struct FlashInfo {
    pub name: String,
    pub index: u16,
    pub flash_type: FlashType,
    pub itf: u8,
    pub cs: u8,
    pub size: u64,
}

/// Static roster entry for one declared section, available to both phases.
#[derive(Clone, Debug)]
pub struct SectionDecl {
    pub name: String,
    /// Index across all flashes of the target, in declaration order. This
    /// is what partition records store as the uuid.
    pub global_index: u16,
    /// Index within the owning flash.
    pub flash_index: u16,
    /// Index of the owning flash.
    pub flash: u16,
    pub partition_type: u8,
    pub partition_subtype: u8,
}

/// Placed geometry of one section, produced by the layout phase.
#[derive(Clone, Debug)]
pub struct SectionRecord {
    pub offset: u64,
    /// Reserved extent: the declared size when one was given, else the
    /// content size.
    pub size: u64,
    pub empty: bool,
    pub flash_type_code: u8,
    pub itf: u8,
    pub cs: u8,
}

/// Read-set of the layout phase: the full static roster, but geometry for
/// already-placed sections only.
pub struct LayoutContext<'a> {
    pub flash: &'a FlashInfo,
    decls: &'a [SectionDecl],
    placed: &'a [SectionRecord],
}

impl<'a> LayoutContext<'a> {
    pub(crate) fn new(
        flash: &'a FlashInfo,
        decls: &'a [SectionDecl],
        placed: &'a [SectionRecord],
    ) -> Self {
        Self {
            flash,
            decls,
            placed,
        }
    }

    pub fn decls(&self) -> &'a [SectionDecl] {
        self.decls
    }

    /// Roster entries of the flash currently being laid out.
    pub fn flash_decls(&self) -> impl Iterator<Item = &'a SectionDecl> {
        let flash = self.flash.index;
        self.decls.iter().filter(move |d| d.flash == flash)
    }

    /// Geometry of an already-placed section, by global index.
    pub fn placed(&self, global_index: u16) -> Option<&'a SectionRecord> {
        self.placed.get(usize::from(global_index))
    }
}

/// Read-set of the finalize phase: everything is placed.
pub struct FinalizeContext<'a> {
    pub flash: &'a FlashInfo,
    pub self_index: u16,
    /// Offset of the next section in the same flash, or this section's
    /// reserved end when it is the last one.
    pub next_offset: u64,
    decls: &'a [SectionDecl],
    records: &'a [SectionRecord],
}

impl<'a> FinalizeContext<'a> {
    pub(crate) fn new(
        flash: &'a FlashInfo,
        self_index: u16,
        next_offset: u64,
        decls: &'a [SectionDecl],
        records: &'a [SectionRecord],
    ) -> Self {
        Self {
            flash,
            self_index,
            next_offset,
            decls,
            records,
        }
    }

    pub fn decls(&self) -> &'a [SectionDecl] {
        self.decls
    }

    pub fn records(&self) -> &'a [SectionRecord] {
        self.records
    }

    pub fn record(&self, global_index: u16) -> &'a SectionRecord {
        &self.records[usize::from(global_index)]
    }

    /// Look up a section of the same flash by name.
    pub fn section_in_flash(
        &self,
        name: &str,
    ) -> Option<(&'a SectionDecl, &'a SectionRecord)> {
        self.decls
            .iter()
            .find(|d| d.flash == self.flash.index && d.name == name)
            .map(|d| (d, self.record(d.global_index)))
    }

    /// Look up a section anywhere in the target by name.
    pub fn section(&self, name: &str) -> Option<(&'a SectionDecl, &'a SectionRecord)> {
        self.decls
            .iter()
            .find(|d| d.name == name)
            .map(|d| (d, self.record(d.global_index)))
    }
}

struct Section {
    name: String,
    declared_size: Option<i64>,
    align: Option<u64>,
    codec: SectionCodec,
}

pub struct Flash {
    info: FlashInfo,
    sections: Vec<Section>,
}

impl Flash {
    fn from_config(config: &FlashConfig, index: u16) -> Result<Self> {
        let mut sections = vec![];

        for section in &config.sections {
            if section.align == Some(0) {
                return Err(Error::Configuration {
                    section: section.name.clone(),
                    message: "alignment must be nonzero".to_owned(),
                });
            }
            if matches!(section.size, Some(s) if s < -1) {
                return Err(Error::Configuration {
                    section: section.name.clone(),
                    message: format!("invalid size: {}", section.size.unwrap()),
                });
            }

            sections.push(Section {
                name: section.name.clone(),
                declared_size: section.size,
                align: section.align,
                codec: SectionCodec::new(&section.name, &section.kind)?,
            });
        }

        Ok(Self {
            info: FlashInfo {
                name: config.name.clone(),
                index,
                flash_type: config.flash_type,
                itf: config.itf,
                cs: config.cs,
                size: config.size,
            },
            sections,
        })
    }
}

/// One fully-built flash image.
pub struct FlashImage {
    pub name: String,
    pub data: Vec<u8>,
    pub sections: Vec<SectionReport>,
}

impl fmt::Debug for FlashImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlashImage")
            .field("name", &self.name)
            .field("data", &format_args!("{} bytes", self.data.len()))
            .field("sections", &self.sections)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct SectionReport {
    pub name: String,
    pub offset: u64,
    pub size: u64,
    pub empty: bool,
}

pub struct Target {
    flashes: Vec<Flash>,
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("flashes", &self.flashes.len())
            .finish()
    }
}

impl Target {
    /// Construct all codecs, reading every input file. Configuration and
    /// input errors surface here, before any layout work.
    pub fn from_config(config: &TargetConfig) -> Result<Self> {
        let flashes = config
            .flashes
            .iter()
            .enumerate()
            .map(|(i, f)| Flash::from_config(f, i as u16))
            .collect::<Result<_>>()?;

        Ok(Self { flashes })
    }

    fn decls(&self) -> Vec<SectionDecl> {
        let mut decls = vec![];

        for flash in &self.flashes {
            for (flash_index, section) in flash.sections.iter().enumerate() {
                let (partition_type, partition_subtype) =
                    section.codec.partition_class();

                decls.push(SectionDecl {
                    name: section.name.clone(),
                    global_index: decls.len() as u16,
                    flash_index: flash_index as u16,
                    flash: flash.info.index,
                    partition_type,
                    partition_subtype,
                });
            }
        }

        decls
    }

    /// Run the two-phase build and serialize one image per flash.
    ///
    /// The build is a pure function of the configuration and the input
    /// file contents: running it twice yields byte-identical images.
    pub fn build(&mut self) -> Result<Vec<FlashImage>> {
        let decls = self.decls();

        // Layout phase: assign offsets in declaration order.
        let mut records: Vec<SectionRecord> = vec![];

        for flash in &mut self.flashes {
            let mut cursor = 0u64;

            for section in &mut flash.sections {
                let offset = match section.align {
                    Some(align) => padding::round(cursor, align).ok_or(
                        Error::FlashOverflow {
                            flash: flash.info.name.clone(),
                            section: section.name.clone(),
                            end: u64::MAX,
                            size: flash.info.size,
                        },
                    )?,
                    None => cursor,
                };

                let reserved = match section.declared_size {
                    Some(-1) => Some(flash.info.size.saturating_sub(offset)),
                    Some(size) => Some(size as u64),
                    None => None,
                };

                let ctx = LayoutContext::new(&flash.info, &decls, &records);
                section.codec.layout(offset, reserved, &ctx)?;

                let content = section.codec.content_size();
                if let Some(reserved) = reserved {
                    if content > reserved {
                        return Err(Error::SectionOverflow {
                            section: section.name.clone(),
                            content,
                            declared: reserved,
                        });
                    }
                }

                let extent = reserved.unwrap_or(content);
                let end = offset + extent;
                if end > flash.info.size {
                    return Err(Error::FlashOverflow {
                        flash: flash.info.name.clone(),
                        section: section.name.clone(),
                        end,
                        size: flash.info.size,
                    });
                }

                debug!(
                    flash = flash.info.name,
                    section = section.name,
                    offset = format_args!("{offset:#x}"),
                    size = format_args!("{extent:#x}"),
                    "placed section",
                );

                records.push(SectionRecord {
                    offset,
                    size: extent,
                    empty: section.codec.is_empty(),
                    flash_type_code: flash.info.flash_type.partition_code(),
                    itf: flash.info.itf,
                    cs: flash.info.cs,
                });
                cursor = end;
            }
        }

        // Finalize phase: all offsets exist now.
        let mut global = 0usize;

        for flash in &mut self.flashes {
            let count = flash.sections.len();

            for (i, section) in flash.sections.iter_mut().enumerate() {
                let record = &records[global];
                let next_offset = if i + 1 < count {
                    records[global + 1].offset
                } else {
                    record.offset + record.size
                };

                let ctx = FinalizeContext::new(
                    &flash.info,
                    global as u16,
                    next_offset,
                    &decls,
                    &records,
                );
                section.codec.finalize(&ctx)?;

                global += 1;
            }
        }

        // Serialization: zero-filled buffer per flash, sized to the end of
        // its last section's reserved extent.
        let mut images = vec![];
        let mut global = 0usize;

        for flash in &self.flashes {
            let end = records[global..global + flash.sections.len()]
                .iter()
                .map(|r| r.offset + r.size)
                .max()
                .unwrap_or(0);
            let mut data = vec![0u8; end as usize];
            let mut reports = vec![];

            for section in &flash.sections {
                let record = &records[global];
                let packed = section.codec.pack();
                let start = record.offset as usize;
                data[start..start + packed.len()].copy_from_slice(&packed);

                reports.push(SectionReport {
                    name: section.name.clone(),
                    offset: record.offset,
                    size: record.size,
                    empty: section.codec.is_empty(),
                });
                global += 1;
            }

            info!(
                flash = flash.info.name,
                size = format_args!("{end:#x}"),
                sections = reports.len(),
                "built flash image",
            );

            images.push(FlashImage {
                name: flash.info.name.clone(),
                data,
                sections: reports,
            });
        }

        Ok(images)
    }
}
