// SPDX-FileCopyrightText: 2024-2025 The flashpack developers
// SPDX-License-Identifier: GPL-3.0-only

//! App binary section: the format the second-stage loader reads.
//!
//! Same overall shape as the boot ROM section, with three differences: the
//! binary is split at ELF *section* granularity so non-loadable content is
//! excluded and names survive, segment payloads may be LZ4-compressed in
//! independent blocks, and the main header starts with a magic number that
//! is only written once the section holds a valid binary.

use std::fs;

use crate::config::AppBinaryConfig;
use crate::crc32;
use crate::elf::{self, Section, SectionProgram};
use crate::flash::{Error, FinalizeContext, LayoutContext, Result};
use crate::layout::{FieldWidth, Layout, RegionId};

const MAGIC: u32 = 0xc001_b001;

/// Fixed XIP geometry; unlike the boot ROM section this format does not
/// expose it as configuration.
const XIP_VADDR: u64 = 0x2000_0000;
const XIP_PAGE_SIZE: u64 = 512;
const XIP_L2_TOP: u64 = 0x1c19_0000;
const XIP_L2_PAGES: u64 = 0x10;

/// Maximum uncompressed bytes per compression block. Block lengths are
/// stored minus one in a u16.
const BLOCK_SIZE: usize = 64 * 1024;

/// Encode `data` as a chain of independently-decompressible blocks. Each
/// block is `(raw_len - 1):u16, (stored_len - 1):u16, payload`, where the
/// payload is the LZ4 block compression of the chunk if that is strictly
/// smaller, else the raw chunk (`stored_len == raw_len` signals the skip).
fn encode_blocks(data: &[u8]) -> (Vec<u8>, u32) {
    let mut out = vec![];
    let mut nb_blocks = 0u32;

    for chunk in data.chunks(BLOCK_SIZE) {
        let compressed = lz4_flex::block::compress(chunk);
        let stored = if compressed.len() < chunk.len() {
            &compressed
        } else {
            chunk
        };

        out.extend_from_slice(&((chunk.len() - 1) as u16).to_le_bytes());
        out.extend_from_slice(&((stored.len() - 1) as u16).to_le_bytes());
        out.extend_from_slice(stored);
        nb_blocks += 1;
    }

    (out, nb_blocks)
}

pub struct AppBinarySection {
    subtype: Option<String>,
    compress: bool,
    program: Option<SectionProgram>,
    layout: Layout,
    header: RegionId,
}

impl AppBinarySection {
    pub fn new(name: &str, config: &AppBinaryConfig) -> Result<Self> {
        let program = match &config.binary {
            Some(path) => {
                let data = fs::read(path).map_err(|e| Error::InputRead {
                    section: name.to_owned(),
                    path: path.clone(),
                    source: e,
                })?;

                Some(elf::load_sections(&data).map_err(|e| Error::InvalidBinary {
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
            subtype: config.subtype.clone(),
            compress: config.compress,
            program,
            layout,
            header,
        })
    }

    pub fn partition_class(&self) -> (u8, u8) {
        match self.subtype.as_deref() {
            Some("ssbl") => (0x2, 0x72),
            _ => (0x0, 0x71),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.program.is_none()
    }

    pub fn layout(
        &mut self,
        offset: u64,
        _reserved: Option<u64>,
        ctx: &LayoutContext,
    ) -> Result<()> {
        let mut layout = Layout::new(offset);
        let header = layout.add_region(Layout::ROOT, "header");
        layout.add_field(header, "magic", FieldWidth::U32);

        if let Some(program) = &self.program {
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

            let (xip, stat): (Vec<&Section>, Vec<&Section>) =
                program.sections.iter().partition(|s| s.addr >= XIP_VADDR);
            let ordered: Vec<&Section> = xip.iter().chain(&stat).copied().collect();

            layout.set_field(header, "nb_segments", ordered.len() as u64)?;
            layout.set_field(header, "entry", program.entry)?;

            let mut seg_headers = vec![];
            let mut payloads = vec![];
            for (i, section) in ordered.iter().enumerate() {
                let region = layout.add_region(Layout::ROOT, &format!("segment{i}"));
                layout.add_field(region, "flash_offset", FieldWidth::U32);
                layout.add_field(region, "mem_addr", FieldWidth::U32);
                layout.add_field(region, "size", FieldWidth::U32);
                layout.add_field(region, "crc", FieldWidth::U32);
                layout.add_field(region, "flags", FieldWidth::U32);
                layout.add_bytes(region, "name", 32);

                let (payload, nb_blocks) = if self.compress {
                    encode_blocks(&section.data)
                } else {
                    (section.data.clone(), 0)
                };

                let flags = u64::from(section.overlay)
                    | u64::from(self.compress) << 1
                    | u64::from(nb_blocks) << 24;

                layout.set_field(region, "mem_addr", section.addr)?;
                layout.set_field(region, "size", section.data.len() as u64)?;
                layout.set_field(
                    region,
                    "crc",
                    u64::from(crc32::checksum(&section.data)),
                )?;
                layout.set_field(region, "flags", flags)?;

                let mut name = section.name.as_bytes();
                if name.len() > 31 {
                    name = &name[..31];
                }
                layout.set_bytes(region, "name", name)?;

                seg_headers.push(region);
                payloads.push(payload);
            }

            if !xip.is_empty() {
                layout.add_align_padding(Layout::ROOT, XIP_PAGE_SIZE);
            }

            let mut xip_base = None;
            let mut xip_bytes = 0u64;
            for (i, payload) in payloads.iter().enumerate() {
                let region = layout.add_region(Layout::ROOT, &format!("data{i}"));
                layout.add_bytes(region, "data", payload.len());
                layout.set_bytes(region, "data", payload)?;

                if i < xip.len() {
                    xip_base.get_or_insert(layout.offset(region));
                    // Pages cover the mapped (uncompressed) bytes, not the
                    // stored payload.
                    xip_bytes += ordered[i].data.len() as u64;
                }

                layout.set_field(
                    seg_headers[i],
                    "flash_offset",
                    layout.offset(region) - offset,
                )?;
            }

            if let Some(xip_base) = xip_base {
                layout.set_field(
                    header,
                    "xip_dev",
                    u64::from(ctx.flash.flash_type.xip_device()),
                )?;
                layout.set_field(header, "xip_vaddr", XIP_VADDR)?;
                layout.set_field(header, "xip_page_size", 0)?;
                layout.set_field(header, "xip_flash_base", xip_base)?;
                layout.set_field(
                    header,
                    "xip_flash_nb_pages",
                    xip_bytes.div_ceil(XIP_PAGE_SIZE),
                )?;
                layout.set_field(
                    header,
                    "xip_l2_base",
                    XIP_L2_TOP - XIP_L2_PAGES * XIP_PAGE_SIZE,
                )?;
                layout.set_field(header, "xip_l2_nb_pages", XIP_L2_PAGES)?;
            }
        }

        self.layout = layout;
        self.header = header;

        Ok(())
    }

    pub fn finalize(&mut self, _ctx: &FinalizeContext) -> Result<()> {
        if !self.is_empty() {
            self.layout
                .set_field(self.header, "magic", u64::from(MAGIC))?;
        }

        Ok(())
    }

    pub fn content_size(&self) -> u64 {
        self.layout.content_size()
    }

    pub fn pack(&self) -> Vec<u8> {
        self.layout.pack()
    }
}
