// SPDX-FileCopyrightText: 2024-2025 The flashpack developers
// SPDX-License-Identifier: GPL-3.0-only

//! Write-once filesystem: a singly-linked chain of file blocks.
//!
//! Each file is a header padded to the block alignment followed by the
//! payload rounded up to the same alignment. `next` pointers are relative
//! to the section base. When the declared section size leaves enough room,
//! a trailing block flagged both valid and empty covers the leftover space
//! so a mounting runtime can claim it for new files.

use std::fs;

use bitflags::bitflags;

use crate::config::WritefsConfig;
use crate::flash::{Error, FinalizeContext, LayoutContext, Result};
use crate::format::padding;
use crate::layout::{FieldWidth, Layout, RegionId};

const MAGIC: u16 = 0x3f9b;

/// Unpadded block header size.
const HEADER_SIZE: u64 = 48;

/// No free block is emitted when the leftover space is at or below this.
const FREE_BLOCK_THRESHOLD: u64 = 128;

/// End-of-chain marker for the `next` field.
const END_OF_CHAIN: u64 = 0xffff_ffff;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BlockFlags: u16 {
        const VALID = 1 << 0;
        const EMPTY = 1 << 1;
    }
}

struct FileEntry {
    name: String,
    data: Vec<u8>,
}

pub struct WritefsSection {
    files: Vec<FileEntry>,
    align: u64,
    layout: Layout,
}

impl WritefsSection {
    pub fn new(name: &str, config: &WritefsConfig) -> Result<Self> {
        let mut files = vec![];

        for path in &config.files {
            let basename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| Error::Configuration {
                    section: name.to_owned(),
                    message: format!("not a file path: {path:?}"),
                })?;

            let data = fs::read(path).map_err(|e| Error::InputRead {
                section: name.to_owned(),
                path: path.clone(),
                source: e,
            })?;

            files.push(FileEntry {
                name: basename,
                data,
            });
        }

        if config.block_align == 0 {
            return Err(Error::Configuration {
                section: name.to_owned(),
                message: "block_align must be nonzero".to_owned(),
            });
        }

        Ok(Self {
            files,
            align: config.block_align,
            layout: Layout::new(0),
        })
    }

    pub fn partition_class(&self) -> (u8, u8) {
        (0x1, 0x83)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn add_block(
        layout: &mut Layout,
        name: &str,
        align: u64,
        payload_size: u64,
    ) -> Result<RegionId> {
        let region = layout.add_region(Layout::ROOT, name);

        layout.add_field(region, "magic", FieldWidth::U16);
        layout.add_field(region, "flags", FieldWidth::U16);
        layout.add_field(region, "crc", FieldWidth::U32);
        layout.add_field(region, "size", FieldWidth::U32);
        layout.add_field(region, "next", FieldWidth::U32);
        layout.add_bytes(region, "name", 24);
        layout.add_bytes(region, "timestamp", 8);
        let header_size = padding::round(HEADER_SIZE, align).unwrap_or(HEADER_SIZE);
        layout.add_bytes(region, "padding", (header_size - HEADER_SIZE) as usize);
        layout.add_bytes(region, "payload", payload_size as usize);

        layout.set_field(region, "magic", u64::from(MAGIC))?;
        layout.set_field(region, "size", payload_size)?;

        Ok(region)
    }

    pub fn layout(
        &mut self,
        offset: u64,
        reserved: Option<u64>,
        _ctx: &LayoutContext,
    ) -> Result<()> {
        let mut layout = Layout::new(offset);

        if !self.files.is_empty() {
            let align = self.align;
            let mut blocks = vec![];

            for (i, file) in self.files.iter().enumerate() {
                let payload_size = padding::round(file.data.len() as u64, align)
                    .unwrap_or(file.data.len() as u64);
                let region =
                    Self::add_block(&mut layout, &format!("file{i}"), align, payload_size)?;

                layout.set_field(region, "flags", u64::from(BlockFlags::VALID.bits()))?;

                let mut name = file.name.as_bytes();
                if name.len() > 23 {
                    name = &name[..23];
                }
                layout.set_bytes(region, "name", name)?;
                layout.set_bytes(region, "timestamp", &(i as u64).to_le_bytes())?;
                layout.set_bytes(region, "payload", &file.data)?;

                blocks.push(region);
            }

            // Chain each header to the next one, relative to the section
            // base.
            for pair in blocks.windows(2) {
                layout.set_field(
                    pair[0],
                    "next",
                    layout.offset(pair[1]) - offset,
                )?;
            }

            let mut last_next = END_OF_CHAIN;

            if let Some(reserved) = reserved {
                let used = layout.content_size();
                let free = reserved.saturating_sub(used);

                if free > FREE_BLOCK_THRESHOLD {
                    let header_size =
                        padding::round(HEADER_SIZE, align).unwrap_or(HEADER_SIZE);
                    let region = Self::add_block(
                        &mut layout,
                        "free",
                        align,
                        free - header_size,
                    )?;

                    layout.set_field(
                        region,
                        "flags",
                        u64::from((BlockFlags::VALID | BlockFlags::EMPTY).bits()),
                    )?;
                    layout.set_field(region, "next", END_OF_CHAIN)?;

                    last_next = layout.offset(region) - offset;
                }
            }

            if let Some(last) = blocks.last() {
                layout.set_field(*last, "next", last_next)?;
            }
        }

        self.layout = layout;

        Ok(())
    }

    pub fn finalize(&mut self, _ctx: &FinalizeContext) -> Result<()> {
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

    use tempfile::TempDir;

    use crate::flash::FlashType;
    use crate::testutil::{decl, flash_info};

    use super::*;

    fn write_file(dir: &TempDir, name: &str, size: usize) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(&vec![0xaa; size]).unwrap();
        path
    }

    fn build(
        files: Vec<std::path::PathBuf>,
        align: u64,
        reserved: Option<u64>,
    ) -> WritefsSection {
        let config = WritefsConfig {
            files,
            block_align: align,
        };
        let mut section = WritefsSection::new("fs", &config).unwrap();

        let info = flash_info(FlashType::Mram);
        let decls = [decl("fs", 0, 0, (0x1, 0x83))];
        section
            .layout(0, reserved, &LayoutContext::new(&info, &decls, &[]))
            .unwrap();

        section
    }

    fn header_u32(packed: &[u8], block: usize, field: usize) -> u32 {
        let base = block + field;
        u32::from_le_bytes(packed[base..base + 4].try_into().unwrap())
    }

    #[test]
    fn two_files_with_free_block() {
        let dir = TempDir::new().unwrap();
        let files = vec![
            write_file(&dir, "small.bin", 10),
            write_file(&dir, "large.bin", 4100),
        ];
        let section = build(files, 4096, Some(0x10000));

        assert!(!section.is_empty());
        // Everything up to the declared size is covered by the free block.
        assert_eq!(section.content_size(), 0x10000);

        let packed = section.pack();

        // file 0: 4096-byte header + one 4096-byte payload block.
        assert_eq!(u16::from_le_bytes([packed[0], packed[1]]), MAGIC);
        assert_eq!(u16::from_le_bytes([packed[2], packed[3]]), 1); // VALID
        assert_eq!(header_u32(&packed, 0, 8), 4096); // size
        assert_eq!(header_u32(&packed, 0, 12), 8192); // next -> file 1
        assert_eq!(&packed[16..26], b"small.bin\x00");
        assert_eq!(packed[40], 0); // timestamp: index 0
        assert_eq!(&packed[4096..4106], &[0xaa; 10][..]);

        // file 1: two payload blocks.
        assert_eq!(header_u32(&packed, 8192, 8), 8192); // size
        assert_eq!(packed[8192 + 40], 1); // timestamp: index 1
        assert_eq!(header_u32(&packed, 8192, 12), 20480); // next -> free

        // Free block spans the rest of the declared size.
        let free = 20480;
        assert_eq!(u16::from_le_bytes([packed[free + 2], packed[free + 3]]), 3);
        assert_eq!(header_u32(&packed, free, 8), 0x10000 - free as u32 - 4096);
        assert_eq!(header_u32(&packed, free, 12), 0xffff_ffff);
    }

    #[test]
    fn last_file_terminates_chain_without_free_block() {
        let dir = TempDir::new().unwrap();
        let files = vec![write_file(&dir, "only.bin", 100)];
        let section = build(files, 4, None);

        let packed = section.pack();
        // Unpadded 48-byte header at alignment 4.
        assert_eq!(section.content_size(), 48 + 100);
        assert_eq!(header_u32(&packed, 0, 8), 100);
        assert_eq!(header_u32(&packed, 0, 12), 0xffff_ffff);
    }

    #[test]
    fn leftover_below_threshold_skips_free_block() {
        let dir = TempDir::new().unwrap();
        let files = vec![write_file(&dir, "a.bin", 4)];
        // 48 + 4 = 52 used; 100 leftover is under the threshold.
        let section = build(files, 4, Some(152));

        assert_eq!(section.content_size(), 52);
        let packed = section.pack();
        assert_eq!(header_u32(&packed, 0, 12), 0xffff_ffff);
    }

    #[test]
    fn no_files_is_empty() {
        let section = build(vec![], 4096, Some(0x1000));

        assert!(section.is_empty());
        assert_eq!(section.content_size(), 0);
        assert!(section.pack().is_empty());
    }

    #[test]
    fn header_alignment_invariant() {
        let dir = TempDir::new().unwrap();
        let files = vec![
            write_file(&dir, "a.bin", 1),
            write_file(&dir, "b.bin", 513),
            write_file(&dir, "c.bin", 512),
        ];
        let section = build(files, 512, None);

        let packed = section.pack();
        let mut offset = 0usize;
        for expected_size in [512u32, 1024, 512] {
            assert_eq!(
                u16::from_le_bytes([packed[offset], packed[offset + 1]]),
                MAGIC,
            );
            assert_eq!(offset % 512, 0);
            let size = header_u32(&packed, offset, 8);
            assert_eq!(size, expected_size);
            assert_eq!(size % 512, 0);
            offset += 512 + size as usize;
        }
    }
}
