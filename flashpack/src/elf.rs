// SPDX-FileCopyrightText: 2024-2025 The flashpack developers
// SPDX-License-Identifier: GPL-3.0-only

//! Extraction of loadable content from ELF executables.
//!
//! Boot ROM sections consume a binary at load segment granularity, while
//! app binary sections consume it at section granularity so that each
//! flash segment keeps the ELF section name and can be flagged as an
//! overlay.

use goblin::elf::program_header::PT_LOAD;
use goblin::elf::section_header::{SHF_ALLOC, SHT_NOBITS};
use goblin::elf::Elf;
use thiserror::Error;

/// Physical addresses at or above this value mark a segment whose sections
/// are loaded on demand at their virtual address instead of being copied to
/// the physical address at boot.
const OVERLAY_PADDR: u64 = 0xc000_0000;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to parse ELF")]
    Parse(#[from] goblin::error::Error),
    #[error("load segment [{offset:#x}, {offset:#x}+{size:#x}) is outside the file")]
    SegmentOutOfBounds { offset: u64, size: u64 },
    #[error("section {name:?} [{offset:#x}, {offset:#x}+{size:#x}) is outside the file")]
    SectionOutOfBounds { name: String, offset: u64, size: u64 },
    #[error("allocated section {name:?} is not covered by any load segment")]
    NoLoadSegment { name: String },
}

type Result<T> = std::result::Result<T, Error>;

/// A blob to be copied to a fixed memory address at boot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub addr: u64,
    pub data: Vec<u8>,
}

/// Like [`Segment`], but at ELF section granularity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub addr: u64,
    pub overlay: bool,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct Program {
    pub entry: u64,
    pub segments: Vec<Segment>,
}

#[derive(Clone, Debug)]
pub struct SectionProgram {
    pub entry: u64,
    pub sections: Vec<Section>,
}

/// Extract all non-empty `PT_LOAD` segments, addressed by their physical
/// address, in program header order.
pub fn load_segments(data: &[u8]) -> Result<Program> {
    let elf = Elf::parse(data)?;
    let mut segments = vec![];

    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD || ph.p_filesz == 0 {
            continue;
        }

        let contents = data
            .get(ph.file_range())
            .ok_or(Error::SegmentOutOfBounds {
                offset: ph.p_offset,
                size: ph.p_filesz,
            })?;

        segments.push(Segment {
            addr: ph.p_paddr,
            data: contents.to_vec(),
        });
    }

    Ok(Program {
        entry: elf.entry,
        segments,
    })
}

/// Extract all non-empty allocated sections with file contents, in section
/// header order.
///
/// Each section is addressed by translating its virtual address into the
/// physical address range of the `PT_LOAD` segment that covers it. Segments
/// with a physical address at or above [`OVERLAY_PADDR`] are a special
/// case: their sections keep the virtual address and are marked as
/// overlays.
pub fn load_sections(data: &[u8]) -> Result<SectionProgram> {
    let elf = Elf::parse(data)?;
    let mut sections = vec![];

    for sh in &elf.section_headers {
        if sh.sh_flags & u64::from(SHF_ALLOC) == 0
            || sh.sh_type == SHT_NOBITS
            || sh.sh_size == 0
        {
            continue;
        }

        let name = elf
            .shdr_strtab
            .get_at(sh.sh_name)
            .unwrap_or_default()
            .to_owned();

        let ph = elf
            .program_headers
            .iter()
            .find(|ph| {
                ph.p_type == PT_LOAD
                    && sh.sh_addr >= ph.p_vaddr
                    && sh.sh_addr + sh.sh_size <= ph.p_vaddr + ph.p_memsz
            })
            .ok_or_else(|| Error::NoLoadSegment { name: name.clone() })?;

        let range = sh.file_range().ok_or(Error::SectionOutOfBounds {
            name: name.clone(),
            offset: sh.sh_offset,
            size: sh.sh_size,
        })?;
        let contents = data.get(range).ok_or(Error::SectionOutOfBounds {
            name: name.clone(),
            offset: sh.sh_offset,
            size: sh.sh_size,
        })?;

        let overlay = ph.p_paddr >= OVERLAY_PADDR;
        let addr = if overlay {
            sh.sh_addr
        } else {
            ph.p_paddr + (sh.sh_addr - ph.p_vaddr)
        };

        sections.push(Section {
            name,
            addr,
            overlay,
            data: contents.to_vec(),
        });
    }

    Ok(SectionProgram {
        entry: elf.entry,
        sections,
    })
}
