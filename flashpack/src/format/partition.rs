// SPDX-FileCopyrightText: 2024-2025 The flashpack developers
// SPDX-License-Identifier: GPL-3.0-only

//! Partition table: one record per section across every flash of the
//! target.
//!
//! v1 is the bare historical format. v2 adds reserved placeholder slots
//! (so partitions can be added later without relocating the table) and two
//! checksums: `crc_table` over all records and `crc_header` over the
//! header fields preceding it. Both CRCs are the raw (non-XORed) register.
//!
//! The module also parses v2 tables back, verifying both checksums; the
//! CLI uses this to inspect images.

use std::mem::size_of;

use thiserror::Error;
use zerocopy::byteorder::little_endian;
use zerocopy::FromBytes as _;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::crc32;
use crate::flash::{FinalizeContext, LayoutContext, Result};
use crate::layout::{FieldWidth, Layout, RegionId};

const MAGIC_V1: u16 = 0x00ba;
const MAGIC_V2: u16 = 0x02ba;

const RECORD_SIZE_V1: u64 = 20;
const RECORD_SIZE_V2: u64 = 32;

/// Bytes of the v2 header covered by `crc_header` (`magic..=crc_table`,
/// 2 + 1 + 1 + 1 + 2 + 4).
const HEADER_CRC_SPAN: usize = 11;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Version {
    V1,
    V2,
}

pub struct PartitionTableSection {
    version: Version,
    layout: Layout,
    header: RegionId,
    records: RegionId,
    record_regions: Vec<RegionId>,
    empty: bool,
}

impl PartitionTableSection {
    pub fn new_v1() -> Self {
        Self::new(Version::V1)
    }

    pub fn new_v2() -> Self {
        Self::new(Version::V2)
    }

    fn new(version: Version) -> Self {
        let mut layout = Layout::new(0);
        let header = layout.add_region(Layout::ROOT, "header");
        let records = layout.add_region(Layout::ROOT, "records");

        Self {
            version,
            layout,
            header,
            records,
            record_regions: vec![],
            empty: true,
        }
    }

    pub fn partition_class(&self) -> (u8, u8) {
        (0x2, 0xe0)
    }

    /// The table is empty iff every section it covers is empty; known only
    /// after finalize.
    pub fn is_empty(&self) -> bool {
        self.empty
    }

    pub fn layout(
        &mut self,
        offset: u64,
        reserved: Option<u64>,
        ctx: &LayoutContext,
    ) -> Result<()> {
        let mut layout = Layout::new(offset);
        let header = layout.add_region(Layout::ROOT, "header");

        layout.add_field(header, "magic", FieldWidth::U16);
        layout.add_field(header, "version", FieldWidth::U8);
        layout.add_field(header, "nb_entries", FieldWidth::U8);
        if self.version == Version::V2 {
            layout.add_field(header, "nb_entries_max", FieldWidth::U8);
            layout.add_field(header, "flags", FieldWidth::U16);
            layout.add_field(header, "crc_table", FieldWidth::U32);
            layout.add_field(header, "crc_header", FieldWidth::U32);
            layout.add_field(header, "padding", FieldWidth::U8);
        }

        let records = layout.add_region(Layout::ROOT, "records");
        let mut record_regions = vec![];

        for d in ctx.decls() {
            let region = layout.add_region(records, &format!("record{}", d.global_index));

            layout.add_field(region, "uuid", FieldWidth::U16);
            layout.add_field(region, "type", FieldWidth::U8);
            layout.add_field(region, "subtype", FieldWidth::U8);
            layout.add_field(region, "flags", FieldWidth::U16);
            layout.add_field(region, "flash_type", FieldWidth::U8);
            layout.add_field(region, "itf", FieldWidth::U8);
            layout.add_field(region, "cs", FieldWidth::U8);
            layout.add_field(region, "offset", FieldWidth::U32);
            layout.add_field(region, "size", FieldWidth::U32);
            match self.version {
                Version::V1 => layout.add_bytes(region, "padding", 3),
                Version::V2 => {
                    layout.add_field(region, "max_size", FieldWidth::U32);
                    layout.add_field(region, "crc_payload", FieldWidth::U32);
                    layout.add_bytes(region, "padding", 7);
                }
            }

            layout.set_field(region, "uuid", u64::from(d.global_index))?;
            layout.set_field(region, "type", u64::from(d.partition_type))?;
            layout.set_field(region, "subtype", u64::from(d.partition_subtype))?;

            record_regions.push(region);
        }

        let nb_entries = ctx.decls().len() as u64;
        let mut nb_entries_max = nb_entries;

        if self.version == Version::V2 {
            // Turn leftover declared space into zero-filled placeholder
            // slots that a future re-flash can claim.
            if let Some(reserved) = reserved {
                let used = layout.content_size();
                if reserved > used {
                    let nb_placeholders = (reserved - used) / RECORD_SIZE_V2;
                    nb_entries_max = nb_entries + nb_placeholders;

                    for i in 0..nb_placeholders {
                        let region =
                            layout.add_region(records, &format!("placeholder{i}"));
                        layout.add_bytes(region, "raw", RECORD_SIZE_V2 as usize);
                    }
                }
            }
        }

        let magic = match self.version {
            Version::V1 => MAGIC_V1,
            Version::V2 => MAGIC_V2,
        };
        let version = match self.version {
            Version::V1 => 1,
            Version::V2 => 2,
        };
        layout.set_field(header, "magic", u64::from(magic))?;
        layout.set_field(header, "version", version)?;
        layout.set_field(header, "nb_entries", nb_entries)?;
        if self.version == Version::V2 {
            layout.set_field(header, "nb_entries_max", nb_entries_max)?;
        }

        self.layout = layout;
        self.header = header;
        self.records = records;
        self.record_regions = record_regions;
        self.empty = true;

        Ok(())
    }

    pub fn finalize(&mut self, ctx: &FinalizeContext) -> Result<()> {
        for (d, region) in ctx.decls().iter().zip(&self.record_regions) {
            let record = ctx.record(d.global_index);

            self.layout.set_field(*region, "offset", record.offset)?;
            self.layout.set_field(*region, "size", record.size)?;
            self.layout
                .set_field(*region, "flash_type", u64::from(record.flash_type_code))?;
            self.layout.set_field(*region, "itf", u64::from(record.itf))?;
            self.layout.set_field(*region, "cs", u64::from(record.cs))?;
            if self.version == Version::V2 {
                self.layout.set_field(*region, "max_size", record.size)?;
            }
        }

        if self.version == Version::V2 {
            let table = self.layout.pack_region(self.records);
            let crc_table = crc32::update(crc32::INIT, &table);
            self.layout
                .set_field(self.header, "crc_table", u64::from(crc_table))?;

            let header = self.layout.pack_region(self.header);
            let crc_header = crc32::update(crc32::INIT, &header[..HEADER_CRC_SPAN]);
            self.layout
                .set_field(self.header, "crc_header", u64::from(crc_header))?;
        }

        self.empty = ctx
            .decls()
            .iter()
            .filter(|d| d.global_index != ctx.self_index)
            .all(|d| ctx.record(d.global_index).empty);

        Ok(())
    }

    pub fn content_size(&self) -> u64 {
        self.layout.content_size()
    }

    pub fn pack(&self) -> Vec<u8> {
        self.layout.pack()
    }
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C, packed)]
pub struct RawTableHeader {
    pub magic: little_endian::U16,
    pub version: u8,
    pub nb_entries: u8,
    pub nb_entries_max: u8,
    pub flags: little_endian::U16,
    pub crc_table: little_endian::U32,
    pub crc_header: little_endian::U32,
    pub padding: u8,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C, packed)]
pub struct RawPartitionRecord {
    pub uuid: little_endian::U16,
    pub partition_type: u8,
    pub partition_subtype: u8,
    pub flags: little_endian::U16,
    pub flash_type: u8,
    pub itf: u8,
    pub cs: u8,
    pub offset: little_endian::U32,
    pub size: little_endian::U32,
    pub max_size: little_endian::U32,
    pub crc_payload: little_endian::U32,
    pub padding: [u8; 7],
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("table truncated: {len} bytes, need {need}")]
    Truncated { len: usize, need: usize },
    #[error("invalid magic: {magic:#06x}")]
    InvalidMagic { magic: u16 },
    #[error("unsupported version: {version}")]
    UnsupportedVersion { version: u8 },
    #[error("table CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    TableCrc { stored: u32, computed: u32 },
    #[error("header CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    HeaderCrc { stored: u32, computed: u32 },
}

#[derive(Debug)]
pub struct ParsedTable {
    pub header: RawTableHeader,
    /// Real records only; placeholder slots are dropped.
    pub records: Vec<RawPartitionRecord>,
}

/// Parse a v2 partition table and verify both checksums.
pub fn parse_v2(data: &[u8]) -> std::result::Result<ParsedTable, ParseError> {
    let (header, rest) =
        RawTableHeader::read_from_prefix(data).map_err(|_| ParseError::Truncated {
            len: data.len(),
            need: size_of::<RawTableHeader>(),
        })?;

    if header.magic.get() != MAGIC_V2 {
        return Err(ParseError::InvalidMagic {
            magic: header.magic.get(),
        });
    }
    if header.version != 2 {
        return Err(ParseError::UnsupportedVersion {
            version: header.version,
        });
    }

    let table_size = usize::from(header.nb_entries_max) * RECORD_SIZE_V2 as usize;
    let table = rest.get(..table_size).ok_or(ParseError::Truncated {
        len: data.len(),
        need: size_of::<RawTableHeader>() + table_size,
    })?;

    let computed = crc32::update(crc32::INIT, table);
    if computed != header.crc_table.get() {
        return Err(ParseError::TableCrc {
            stored: header.crc_table.get(),
            computed,
        });
    }

    let computed = crc32::update(crc32::INIT, &data[..HEADER_CRC_SPAN]);
    if computed != header.crc_header.get() {
        return Err(ParseError::HeaderCrc {
            stored: header.crc_header.get(),
            computed,
        });
    }

    let records = table
        .chunks_exact(RECORD_SIZE_V2 as usize)
        .take(usize::from(header.nb_entries))
        .map(|chunk| RawPartitionRecord::read_from_bytes(chunk).unwrap())
        .collect();

    Ok(ParsedTable { header, records })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::flash::{FlashType, SectionRecord};
    use crate::testutil::{decl, flash_info, record};

    use super::*;

    fn two_section_records() -> Vec<SectionRecord> {
        vec![record(0, 0x2000, false), record(0x2000, 0x400, true)]
    }

    #[test]
    fn v1_header_and_records() {
        let info = flash_info(FlashType::Mram);
        let decls = [decl("rom", 0, 0, (0x2, 0xe2)), decl("pt", 1, 1, (0x2, 0xe0))];
        let records = two_section_records();

        let mut section = PartitionTableSection::new_v1();
        section
            .layout(0x2000, None, &LayoutContext::new(&info, &decls, &records[..1]))
            .unwrap();

        assert_eq!(section.content_size(), 4 + 2 * RECORD_SIZE_V1);

        section
            .finalize(&FinalizeContext::new(&info, 1, 0x2400, &decls, &records))
            .unwrap();

        let packed = section.pack();
        assert_eq!(&packed[..4], b"\xba\x00\x01\x02");

        // Record 0 points at the ROM section.
        let rec = &packed[4..24];
        assert_eq!(u16::from_le_bytes([rec[0], rec[1]]), 0); // uuid
        assert_eq!(rec[2], 0x2); // type
        assert_eq!(rec[3], 0xe2); // subtype
        assert_eq!(u32::from_le_bytes(rec[9..13].try_into().unwrap()), 0); // offset
        assert_eq!(u32::from_le_bytes(rec[13..17].try_into().unwrap()), 0x2000); // size
    }

    #[test]
    fn v2_reserves_placeholder_slots() {
        let info = flash_info(FlashType::Spi);
        let decls = [decl("rom", 0, 0, (0x2, 0xe2)), decl("pt", 1, 1, (0x2, 0xe0))];
        let records = two_section_records();

        let mut section = PartitionTableSection::new_v2();
        // 16 + 2 * 32 = 80 used; 176 leftover = 5 placeholder slots.
        section
            .layout(
                0,
                Some(256),
                &LayoutContext::new(&info, &decls, &records[..1]),
            )
            .unwrap();
        section
            .finalize(&FinalizeContext::new(&info, 1, 0x2400, &decls, &records))
            .unwrap();

        let parsed = parse_v2(&section.pack()).unwrap();
        assert_eq!(parsed.header.nb_entries, 2);
        assert_eq!(parsed.header.nb_entries_max, 7);
        assert_eq!(parsed.records.len(), 2);
    }

    #[test]
    fn v2_parse_back_verifies_crcs() {
        let info = flash_info(FlashType::Hyper);
        let decls = [decl("rom", 0, 0, (0x2, 0xe2)), decl("pt", 1, 1, (0x2, 0xe0))];
        let records = vec![
            SectionRecord {
                flash_type_code: FlashType::Hyper.partition_code(),
                itf: 1,
                cs: 1,
                ..record(0x1000, 0x2000, false)
            },
            record(0x3000, 0x400, true),
        ];

        let mut section = PartitionTableSection::new_v2();
        section
            .layout(0x3000, None, &LayoutContext::new(&info, &decls, &records[..1]))
            .unwrap();
        section
            .finalize(&FinalizeContext::new(&info, 1, 0x3400, &decls, &records))
            .unwrap();

        let packed = section.pack();
        let parsed = parse_v2(&packed).unwrap();

        // The header CRC spans magic through crc_table, excluding itself.
        let stored = u32::from_le_bytes(packed[11..15].try_into().unwrap());
        assert_eq!(stored, crc32::update(crc32::INIT, &packed[..11]));

        let rec = &parsed.records[0];
        assert_eq!(rec.uuid.get(), 0);
        assert_eq!(rec.offset.get(), 0x1000);
        assert_eq!(rec.size.get(), 0x2000);
        assert_eq!(rec.max_size.get(), 0x2000);
        assert_eq!(rec.flash_type, 0x2);
        assert_eq!(rec.itf, 1);
        assert_eq!(rec.cs, 1);

        // Flipping a record byte must break crc_table.
        let mut corrupt = packed.clone();
        corrupt[20] ^= 0xff;
        assert_matches!(parse_v2(&corrupt), Err(ParseError::TableCrc { .. }));

        // Flipping a covered header byte (flags) must break crc_header.
        let mut corrupt = packed;
        corrupt[5] ^= 0xff;
        assert_matches!(parse_v2(&corrupt), Err(ParseError::HeaderCrc { .. }));
    }

    #[test]
    fn parse_rejects_bad_magic() {
        assert_matches!(
            parse_v2(&[0u8; 16]),
            Err(ParseError::InvalidMagic { magic: 0 })
        );
        assert_matches!(parse_v2(&[0u8; 3]), Err(ParseError::Truncated { .. }));
    }

    #[test]
    fn emptiness_tracks_covered_sections() {
        let info = flash_info(FlashType::Mram);
        let decls = [decl("rom", 0, 0, (0x0, 0xff)), decl("pt", 1, 1, (0x2, 0xe0))];

        let mut section = PartitionTableSection::new_v2();
        let records = vec![record(0, 0x100, true), record(0x100, 0x60, true)];
        section
            .layout(0x100, None, &LayoutContext::new(&info, &decls, &records[..1]))
            .unwrap();
        section
            .finalize(&FinalizeContext::new(&info, 1, 0x160, &decls, &records))
            .unwrap();
        assert!(section.is_empty());

        let records = vec![record(0, 0x100, false), record(0x100, 0x60, true)];
        section
            .layout(0x100, None, &LayoutContext::new(&info, &decls, &records[..1]))
            .unwrap();
        section
            .finalize(&FinalizeContext::new(&info, 1, 0x160, &decls, &records))
            .unwrap();
        assert!(!section.is_empty());
    }
}
