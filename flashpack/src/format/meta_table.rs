// SPDX-FileCopyrightText: 2024-2025 The flashpack developers
// SPDX-License-Identifier: GPL-3.0-only

//! Recovery meta-table: redundant A/B pointers to the second-stage
//! bootloader and the partition table, each protected by its own CRC, so
//! a corrupted primary copy can be recovered from the secondary.
//!
//! Pointers are resolved by section name within the owning flash during
//! finalize. A name that stays unresolved keeps the sentinel value; the
//! section is still emitted, since dropping it would defeat the recovery
//! mechanism.

use crate::config::MetaTableConfig;
use crate::crc32;
use crate::flash::{FinalizeContext, LayoutContext, Result};
use crate::layout::{FieldWidth, Layout, RegionId};

/// Marks a pointer slot whose section was not found.
const UNRESOLVED: u64 = 0xdead_beef;

pub struct MetaTableSection {
    config: MetaTableConfig,
    layout: Layout,
    next: RegionId,
    ssbl: RegionId,
    pt: RegionId,
}

impl MetaTableSection {
    pub fn new(config: &MetaTableConfig) -> Self {
        let mut layout = Layout::new(0);
        let next = layout.add_region(Layout::ROOT, "next");
        let ssbl = layout.add_region(Layout::ROOT, "ssbl");
        let pt = layout.add_region(Layout::ROOT, "pt");

        Self {
            config: config.clone(),
            layout,
            next,
            ssbl,
            pt,
        }
    }

    pub fn partition_class(&self) -> (u8, u8) {
        (0x2, 0xe4)
    }

    /// The meta-table is always flashed.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn layout(
        &mut self,
        offset: u64,
        _reserved: Option<u64>,
        _ctx: &LayoutContext,
    ) -> Result<()> {
        let mut layout = Layout::new(offset);

        let next = layout.add_region(Layout::ROOT, "next");
        layout.add_field(next, "next_section", FieldWidth::U32);
        layout.add_bytes(next, "padding", 12);

        let ssbl = layout.add_region(Layout::ROOT, "ssbl");
        // Row 0 selects copy A; all zeros by default.
        layout.add_bytes(ssbl, "ssbl_a_not_b", 16);
        layout.add_field(ssbl, "ssbl_a_crc", FieldWidth::U32);
        layout.add_field(ssbl, "ssbl_a_addr", FieldWidth::U32);
        layout.add_bytes(ssbl, "padding_a", 8);
        layout.add_field(ssbl, "ssbl_b_crc", FieldWidth::U32);
        layout.add_field(ssbl, "ssbl_b_addr", FieldWidth::U32);
        layout.add_bytes(ssbl, "padding_b", 8);

        let pt = layout.add_region(Layout::ROOT, "pt");
        layout.add_field(pt, "pt_a_crc", FieldWidth::U32);
        layout.add_field(pt, "pt_a_addr", FieldWidth::U32);
        layout.add_bytes(pt, "padding_a", 8);
        layout.add_field(pt, "pt_b_crc", FieldWidth::U32);
        layout.add_field(pt, "pt_b_addr", FieldWidth::U32);
        layout.add_bytes(pt, "padding_b", 8);

        layout.set_field(ssbl, "ssbl_a_addr", UNRESOLVED)?;
        layout.set_field(ssbl, "ssbl_b_addr", UNRESOLVED)?;
        layout.set_field(pt, "pt_a_addr", UNRESOLVED)?;
        layout.set_field(pt, "pt_b_addr", UNRESOLVED)?;

        self.layout = layout;
        self.next = next;
        self.ssbl = ssbl;
        self.pt = pt;

        Ok(())
    }

    fn resolve(
        &mut self,
        ctx: &FinalizeContext,
        region: RegionId,
        addr_field: &str,
        crc_field: &str,
        name: Option<&str>,
    ) -> Result<()> {
        if let Some(name) = name {
            if let Some((_, record)) = ctx.section_in_flash(name) {
                self.layout.set_field(region, addr_field, record.offset)?;
            }
        }

        // The CRC covers the stored pointer, sentinel included, so the
        // recovery code can always validate the slot.
        let addr = self.layout.field_bytes(region, addr_field)?.to_vec();
        let crc = crc32::update(crc32::INIT, &addr);
        self.layout.set_field(region, crc_field, u64::from(crc))?;

        Ok(())
    }

    pub fn finalize(&mut self, ctx: &FinalizeContext) -> Result<()> {
        self.layout
            .set_field(self.next, "next_section", ctx.next_offset)?;

        let config = self.config.clone();
        let ssbl = self.ssbl;
        let pt = self.pt;

        self.resolve(ctx, ssbl, "ssbl_a_addr", "ssbl_a_crc", config.ssbl_a.as_deref())?;
        self.resolve(ctx, ssbl, "ssbl_b_addr", "ssbl_b_crc", config.ssbl_b.as_deref())?;
        self.resolve(ctx, pt, "pt_a_addr", "pt_a_crc", config.pt_a.as_deref())?;
        self.resolve(ctx, pt, "pt_b_addr", "pt_b_crc", config.pt_b.as_deref())?;

        Ok(())
    }

    pub fn content_size(&self) -> u64 {
        self.layout.content_size()
    }

    pub fn pack(&self) -> Vec<u8> {
        self.layout.pack()
    }
}
