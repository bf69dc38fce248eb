// SPDX-FileCopyrightText: 2024-2025 The flashpack developers
// SPDX-License-Identifier: GPL-3.0-only

//! Boot ROM section ("ROM v2"): the format the mask ROM reads to load the
//! first-stage bootloader.
//!
//! After the main header comes one fixed-size header per loadable ELF
//! segment, then the segment data blocks. Segments whose load address is
//! in the XIP window are not copied to memory at boot; they are executed
//! in place through a cached flash window, which requires their data
//! blocks to sit first, contiguous, and page-aligned in the section.

use std::fs;

use crate::config::RomConfig;
use crate::crc32;
use crate::elf::{self, Program, Segment};
use crate::flash::{Error, FinalizeContext, LayoutContext, Result};
use crate::layout::{FieldWidth, Layout, RegionId};

/// Start of the SRAM area backing the XIP cache; pages are allocated
/// downwards from here.
const XIP_L2_TOP: u64 = 0x1c19_0000;

pub struct RomSection {
    boot: bool,
    subtype: Option<String>,
    xip_vaddr: u64,
    xip_flash_address: Option<u64>,
    xip_page_exp: u32,
    xip_page_number: u32,
    program: Option<Program>,
    layout: Layout,
    header: RegionId,
}

/// Split segments into XIP ones (load address inside the XIP window) and
/// statically-loaded ones, keeping the original order within each group.
fn partition_xip(segments: &[Segment], xip_vaddr: u64) -> (Vec<&Segment>, Vec<&Segment>) {
    segments.iter().partition(|s| s.addr >= xip_vaddr)
}

impl RomSection {
    pub fn new(name: &str, config: &RomConfig) -> Result<Self> {
        let program = match &config.binary {
            Some(path) => {
                let data = fs::read(path).map_err(|e| Error::InputRead {
                    section: name.to_owned(),
                    path: path.clone(),
                    source: e,
                })?;

                Some(elf::load_segments(&data).map_err(|e| Error::InvalidBinary {
                    section: name.to_owned(),
                    path: path.clone(),
                    source: e,
                })?)
            }
            None => None,
        };

        let mut layout = Layout::new(0);
        let header = layout.add_region(Layout::ROOT, "header");

        Ok(Self {
            boot: config.boot,
            subtype: config.subtype.clone(),
            xip_vaddr: config.xip_virtual_address,
            xip_flash_address: config.xip_flash_address,
            xip_page_exp: config.xip_page_size,
            xip_page_number: config.xip_page_number,
            program,
            layout,
            header,
        })
    }

    pub fn partition_class(&self) -> (u8, u8) {
        match self.subtype.as_deref() {
            Some("ssbl") => (0x2, 0xe3),
            Some("fsbl") => (0x2, 0xe2),
            _ => (0x0, 0xff),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.program.is_none() || !self.boot
    }

    pub fn layout(
        &mut self,
        offset: u64,
        _reserved: Option<u64>,
        ctx: &LayoutContext,
    ) -> Result<()> {
        let mut layout = Layout::new(offset);
        let header = layout.add_region(Layout::ROOT, "header");
        layout.add_field(header, "next_section", FieldWidth::U32);

        // A non-bootable binary still gets the full layout; `boot` only
        // decides whether the section counts as empty.
        if let Some(program) = self.program.as_ref() {
            layout.add_field(header, "nb_segments", FieldWidth::U32);
            layout.add_field(header, "entry", FieldWidth::U32);
            layout.add_field(header, "unused", FieldWidth::U32);
            layout.add_field(header, "xip_dev", FieldWidth::U32);
            layout.add_field(header, "xip_vaddr", FieldWidth::U32);
            layout.add_field(header, "xip_page_size", FieldWidth::U32);
            layout.add_field(header, "xip_flash_base", FieldWidth::U32);
            layout.add_field(header, "xip_flash_nb_pages", FieldWidth::U32);
            layout.add_field(header, "xip_l2_base", FieldWidth::U32);
            layout.add_field(header, "xip_l2_nb_pages", FieldWidth::U32);
            layout.add_field(header, "kc_length", FieldWidth::U32);
            layout.add_field(header, "key_length", FieldWidth::U32);
            layout.add_bytes(header, "ac", 1024);
            layout.add_bytes(header, "kc", 128);
            layout.add_bytes(header, "kc_write", 128);

            let (xip, stat) = partition_xip(&program.segments, self.xip_vaddr);
            let ordered: Vec<&Segment> = xip.iter().chain(&stat).copied().collect();

            layout.set_field(header, "nb_segments", ordered.len() as u64)?;
            layout.set_field(header, "entry", program.entry)?;

            let mut seg_headers = vec![];
            for (i, segment) in ordered.iter().enumerate() {
                let region = layout.add_region(Layout::ROOT, &format!("segment{i}"));
                layout.add_field(region, "flash_offset", FieldWidth::U32);
                layout.add_field(region, "mem_addr", FieldWidth::U32);
                layout.add_field(region, "size", FieldWidth::U32);
                layout.add_field(region, "crc", FieldWidth::U32);

                layout.set_field(region, "mem_addr", segment.addr)?;
                layout.set_field(region, "size", segment.data.len() as u64)?;
                layout.set_field(
                    region,
                    "crc",
                    u64::from(crc32::checksum(&segment.data)),
                )?;

                seg_headers.push(region);
            }

            let page_size = 512u64 << self.xip_page_exp;
            if !xip.is_empty() {
                layout.add_align_padding(Layout::ROOT, page_size);
            }

            let mut xip_base = None;
            for (i, segment) in ordered.iter().enumerate() {
                let region = layout.add_region(Layout::ROOT, &format!("data{i}"));
                layout.add_bytes(region, "data", segment.data.len());
                layout.set_bytes(region, "data", &segment.data)?;

                if i < xip.len() && xip_base.is_none() {
                    xip_base = Some(layout.offset(region));
                }

                layout.set_field(
                    seg_headers[i],
                    "flash_offset",
                    layout.offset(region) - offset,
                )?;
            }

            if !xip.is_empty() {
                let xip_bytes: u64 = xip.iter().map(|s| s.data.len() as u64).sum();
                let nb_pages = xip_bytes.div_ceil(page_size);
                let l2_pages = u64::from(self.xip_page_number);
                let flash_base = self
                    .xip_flash_address
                    .or(xip_base)
                    .unwrap_or(0);

                layout.set_field(
                    header,
                    "xip_dev",
                    u64::from(ctx.flash.flash_type.xip_device()),
                )?;
                layout.set_field(header, "xip_vaddr", self.xip_vaddr)?;
                layout.set_field(
                    header,
                    "xip_page_size",
                    u64::from(self.xip_page_exp),
                )?;
                layout.set_field(header, "xip_flash_base", flash_base)?;
                layout.set_field(header, "xip_flash_nb_pages", nb_pages)?;
                layout.set_field(
                    header,
                    "xip_l2_base",
                    XIP_L2_TOP - l2_pages * page_size,
                )?;
                layout.set_field(header, "xip_l2_nb_pages", l2_pages)?;
            }
        }

        self.layout = layout;
        self.header = header;

        Ok(())
    }

    pub fn finalize(&mut self, ctx: &FinalizeContext) -> Result<()> {
        self.layout
            .set_field(self.header, "next_section", ctx.next_offset)?;

        Ok(())
    }

    pub fn content_size(&self) -> u64 {
        self.layout.content_size()
    }

    pub fn pack(&self) -> Vec<u8> {
        self.layout.pack()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use crate::flash::FlashType;
    use crate::testutil::{decl, flash_info, record, ElfBuilder};

    use super::*;

    const HEADER_SIZE: usize = 13 * 4 + 1024 + 128 + 128;
    const SEG_HEADER_SIZE: usize = 16;

    fn field(data: &[u8], index: usize) -> u32 {
        u32::from_le_bytes(data[index * 4..index * 4 + 4].try_into().unwrap())
    }

    fn build_section(elf: &[u8], config: RomConfig) -> RomSection {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(elf).unwrap();

        let config = RomConfig {
            binary: Some(file.path().to_owned()),
            ..config
        };
        RomSection::new("rom", &config).unwrap()
    }

    fn default_config() -> RomConfig {
        serde_json::from_str("{}").unwrap()
    }

    #[test]
    fn single_static_segment() {
        let elf = ElfBuilder::new(0x1c00_0000)
            .segment(0x1c00_0000, 0x1c00_0000, vec![0xab; 256])
            .build();
        let mut section = build_section(&elf, default_config());

        let info = flash_info(FlashType::Mram);
        let decls = [decl("rom", 0, 0, (0x2, 0xe2))];
        section
            .layout(0, None, &LayoutContext::new(&info, &decls, &[]))
            .unwrap();

        let records = [record(0, section.content_size(), false)];
        section
            .finalize(&FinalizeContext::new(&info, 0, 0x4000, &decls, &records))
            .unwrap();

        assert!(!section.is_empty());

        let packed = section.pack();
        assert_eq!(field(&packed, 0), 0x4000); // next_section
        assert_eq!(field(&packed, 1), 1); // nb_segments
        assert_eq!(field(&packed, 2), 0x1c00_0000); // entry
        assert_eq!(field(&packed, 4), 0); // xip_dev: no XIP

        let seg = &packed[HEADER_SIZE..HEADER_SIZE + SEG_HEADER_SIZE];
        let data_offset = HEADER_SIZE + SEG_HEADER_SIZE;
        assert_eq!(field(seg, 0), data_offset as u32);
        assert_eq!(field(seg, 1), 0x1c00_0000);
        assert_eq!(field(seg, 2), 256);
        assert_eq!(field(seg, 3), crc32::checksum(&[0xab; 256]));

        assert_eq!(&packed[data_offset..data_offset + 256], &[0xab; 256][..]);
        assert_eq!(packed.len(), data_offset + 256);
    }

    #[test]
    fn xip_segments_come_first_and_page_aligned() {
        let elf = ElfBuilder::new(0x1c00_0000)
            .segment(0x1c00_0000, 0x1c00_0000, vec![1; 10])
            .segment(0x2000_0000, 0x2000_0000, vec![2; 600])
            .build();
        let mut section = build_section(&elf, default_config());

        let info = flash_info(FlashType::Mram);
        let decls = [decl("rom", 0, 0, (0x2, 0xe2))];
        section
            .layout(0, None, &LayoutContext::new(&info, &decls, &[]))
            .unwrap();

        let records = [record(0, section.content_size(), false)];
        section
            .finalize(&FinalizeContext::new(&info, 0, 0x8000, &decls, &records))
            .unwrap();

        let packed = section.pack();
        assert_eq!(field(&packed, 1), 2); // nb_segments

        // Headers: 1332 + 2 * 16 = 1364, padded to the next 512-byte page.
        let xip_data = 1536;
        assert_eq!(field(&packed, 4), 2); // xip_dev: mram
        assert_eq!(field(&packed, 5), 0x2000_0000); // xip_vaddr
        assert_eq!(field(&packed, 6), 0); // page size exponent
        assert_eq!(field(&packed, 7), xip_data); // xip_flash_base
        assert_eq!(field(&packed, 8), 2); // ceil(600 / 512) pages
        assert_eq!(field(&packed, 9), 0x1c19_0000 - 16 * 512); // xip_l2_base
        assert_eq!(field(&packed, 10), 16); // xip_l2_nb_pages

        // The XIP segment is first even though it came second in the ELF.
        let seg0 = &packed[HEADER_SIZE..];
        assert_eq!(field(seg0, 0), xip_data);
        assert_eq!(field(seg0, 1), 0x2000_0000);
        assert_eq!(field(seg0, 2), 600);

        let seg1 = &packed[HEADER_SIZE + SEG_HEADER_SIZE..];
        assert_eq!(field(seg1, 0), xip_data + 600);
        assert_eq!(field(seg1, 1), 0x1c00_0000);

        let xip_data = xip_data as usize;
        assert_eq!(&packed[xip_data..xip_data + 600], &[2; 600][..]);
        assert_eq!(&packed[xip_data + 600..xip_data + 610], &[1; 10][..]);
    }

    #[test]
    fn no_binary_emits_minimal_header() {
        let mut section = RomSection::new("rom", &default_config()).unwrap();

        let info = flash_info(FlashType::Mram);
        let decls = [decl("rom", 0, 0, (0x0, 0xff))];
        section
            .layout(0x1000, None, &LayoutContext::new(&info, &decls, &[]))
            .unwrap();

        assert!(section.is_empty());
        assert_eq!(section.content_size(), 4);

        let records = [record(0x1000, 4, true)];
        section
            .finalize(&FinalizeContext::new(&info, 0, 0x1004, &decls, &records))
            .unwrap();

        assert_eq!(section.pack(), 0x1004u32.to_le_bytes());
    }

    #[test]
    fn non_boot_section_is_empty_but_fully_laid_out() {
        let elf = ElfBuilder::new(0)
            .segment(0x1c00_0000, 0x1c00_0000, vec![9; 8])
            .build();
        let config = RomConfig {
            boot: false,
            ..default_config()
        };
        let mut section = build_section(&elf, config);

        assert!(section.is_empty());

        let info = flash_info(FlashType::Mram);
        let decls = [decl("rom", 0, 0, (0x0, 0xff))];
        section
            .layout(0, None, &LayoutContext::new(&info, &decls, &[]))
            .unwrap();

        // Skipped by auto-mode flashing, but sized like a bootable section
        // so offsets and partition records stay put.
        assert_eq!(
            section.content_size() as usize,
            HEADER_SIZE + SEG_HEADER_SIZE + 8,
        );
    }

    #[test]
    fn subtype_classification() {
        let config = RomConfig {
            subtype: Some("ssbl".to_owned()),
            ..default_config()
        };
        let section = RomSection::new("rom", &config).unwrap();
        assert_eq!(section.partition_class(), (0x2, 0xe3));

        let config = RomConfig {
            subtype: Some("fsbl".to_owned()),
            ..default_config()
        };
        let section = RomSection::new("rom", &config).unwrap();
        assert_eq!(section.partition_class(), (0x2, 0xe2));

        let section = RomSection::new("rom", &default_config()).unwrap();
        assert_eq!(section.partition_class(), (0x0, 0xff));
    }
}
