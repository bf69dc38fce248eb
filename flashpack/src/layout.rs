// SPDX-FileCopyrightText: 2024-2025 The flashpack developers
// SPDX-License-Identifier: GPL-3.0-only

//! Append-only layout arena for building on-flash structures.
//!
//! A [`Layout`] owns a tree of named regions anchored at an absolute flash
//! offset. Regions contain named fields (little-endian integers or byte
//! arrays) and child regions, all placed by running sum: every add appends
//! at the current end of the arena, so an offset is final the moment the
//! item is created and can be handed out to other sections immediately.
//!
//! Field *structure* is declared up front during the layout phase; field
//! *values* can be set at any time before packing, which is what lets a
//! table patch in the addresses and checksums of sections placed after it.

use std::fmt;

use thiserror::Error;

use crate::format::padding;

#[derive(Debug, Error)]
pub enum Error {
    #[error("region {region:?} has no field {field:?}")]
    UnknownField { region: String, field: String },
    #[error("value {value:#x} does not fit in {size}-byte field {field:?}")]
    ValueTooLarge { field: String, value: u64, size: usize },
    #[error("{len} bytes do not fit in {size}-byte field {field:?}")]
    BytesTooLong { field: String, len: usize, size: usize },
}

type Result<T> = std::result::Result<T, Error>;

/// Handle to a region inside a [`Layout`]. Only valid for the arena that
/// created it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionId(u32);

/// Width of a little-endian integer field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldWidth {
    U8,
    U16,
    U32,
    U64,
}

impl FieldWidth {
    fn size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
            Self::U64 => 8,
        }
    }
}

struct Field {
    name: String,
    offset: u64,
    data: Vec<u8>,
}

enum Item {
    Field(Field),
    Child(RegionId),
}

struct Region {
    name: String,
    offset: u64,
    size: u64,
    parent: Option<RegionId>,
    items: Vec<Item>,
}

/// Layout arena for one section, anchored at an absolute flash offset.
pub struct Layout {
    base: u64,
    end: u64,
    regions: Vec<Region>,
}

impl Layout {
    pub const ROOT: RegionId = RegionId(0);

    pub fn new(base: u64) -> Self {
        Self {
            base,
            end: base,
            regions: vec![Region {
                name: "root".to_owned(),
                offset: base,
                size: 0,
                parent: None,
                items: vec![],
            }],
        }
    }

    /// Absolute offset of the section.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Absolute offset one past the last byte of content.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Total content size in bytes.
    pub fn content_size(&self) -> u64 {
        self.end - self.base
    }

    fn region(&self, id: RegionId) -> &Region {
        &self.regions[id.0 as usize]
    }

    /// Panic unless `id` is the region currently at the tail of the arena.
    /// Appending anywhere else would shift offsets that have already been
    /// handed out, which is always a codec bug.
    fn assert_tail(&self, id: RegionId) {
        let region = self.region(id);
        assert_eq!(
            region.offset + region.size,
            self.end,
            "append to non-tail region {:?}",
            region.name,
        );
    }

    fn grow(&mut self, id: RegionId, amount: u64) {
        let mut cur = Some(id);
        while let Some(r) = cur {
            let region = &mut self.regions[r.0 as usize];
            region.size += amount;
            cur = region.parent;
        }
        self.end += amount;
    }

    /// Append an empty child region at the tail of `parent`.
    pub fn add_region(&mut self, parent: RegionId, name: &str) -> RegionId {
        self.assert_tail(parent);

        let id = RegionId(self.regions.len() as u32);
        self.regions.push(Region {
            name: name.to_owned(),
            offset: self.end,
            size: 0,
            parent: Some(parent),
            items: vec![],
        });
        self.regions[parent.0 as usize].items.push(Item::Child(id));

        id
    }

    fn push_field(&mut self, region: RegionId, field: Field) {
        let size = field.data.len() as u64;
        self.regions[region.0 as usize].items.push(Item::Field(field));
        self.grow(region, size);
    }

    /// Append a zero-initialized little-endian integer field.
    pub fn add_field(&mut self, region: RegionId, name: &str, width: FieldWidth) {
        self.assert_tail(region);

        self.push_field(
            region,
            Field {
                name: name.to_owned(),
                offset: self.end,
                data: vec![0; width.size()],
            },
        );
    }

    /// Append a zero-initialized byte-array field.
    pub fn add_bytes(&mut self, region: RegionId, name: &str, len: usize) {
        self.assert_tail(region);

        self.push_field(
            region,
            Field {
                name: name.to_owned(),
                offset: self.end,
                data: vec![0; len],
            },
        );
    }

    /// Append zero padding so that the next item lands on a multiple of
    /// `align` in absolute flash offsets. Returns the padding size.
    pub fn add_align_padding(&mut self, region: RegionId, align: u64) -> u64 {
        self.assert_tail(region);

        let pad = padding::calc(self.end, align);
        if pad > 0 {
            self.push_field(
                region,
                Field {
                    name: String::new(),
                    offset: self.end,
                    data: vec![0; pad as usize],
                },
            );
        }

        pad
    }

    fn field(&self, region: RegionId, name: &str) -> Result<&Field> {
        self.region(region)
            .items
            .iter()
            .find_map(|item| match item {
                Item::Field(f) if f.name == name => Some(f),
                _ => None,
            })
            .ok_or_else(|| Error::UnknownField {
                region: self.region(region).name.clone(),
                field: name.to_owned(),
            })
    }

    fn field_mut(&mut self, region: RegionId, name: &str) -> Result<&mut Field> {
        let region_name = self.region(region).name.clone();
        self.regions[region.0 as usize]
            .items
            .iter_mut()
            .find_map(|item| match item {
                Item::Field(f) if f.name == name => Some(f),
                _ => None,
            })
            .ok_or(Error::UnknownField {
                region: region_name,
                field: name.to_owned(),
            })
    }

    /// Set an integer field, little-endian.
    pub fn set_field(&mut self, region: RegionId, name: &str, value: u64) -> Result<()> {
        let field = self.field_mut(region, name)?;
        let size = field.data.len();

        if size < 8 && value >> (size * 8) != 0 {
            return Err(Error::ValueTooLarge {
                field: name.to_owned(),
                value,
                size,
            });
        }

        field.data.copy_from_slice(&value.to_le_bytes()[..size]);

        Ok(())
    }

    /// Set a byte-array field. Shorter inputs are zero-padded at the end.
    pub fn set_bytes(&mut self, region: RegionId, name: &str, data: &[u8]) -> Result<()> {
        let field = self.field_mut(region, name)?;
        let size = field.data.len();

        if data.len() > size {
            return Err(Error::BytesTooLong {
                field: name.to_owned(),
                len: data.len(),
                size,
            });
        }

        field.data[..data.len()].copy_from_slice(data);
        field.data[data.len()..].fill(0);

        Ok(())
    }

    /// Absolute offset of a region.
    pub fn offset(&self, region: RegionId) -> u64 {
        self.region(region).offset
    }

    /// Current size of a region, including all children.
    pub fn size(&self, region: RegionId) -> u64 {
        self.region(region).size
    }

    /// Absolute offset of a field.
    pub fn field_offset(&self, region: RegionId, name: &str) -> Result<u64> {
        Ok(self.field(region, name)?.offset)
    }

    /// Current bytes of a field.
    pub fn field_bytes(&self, region: RegionId, name: &str) -> Result<&[u8]> {
        Ok(&self.field(region, name)?.data)
    }

    fn pack_into(&self, region: RegionId, base: u64, out: &mut [u8]) {
        for item in &self.region(region).items {
            match item {
                Item::Field(f) => {
                    let start = (f.offset - base) as usize;
                    out[start..start + f.data.len()].copy_from_slice(&f.data);
                }
                Item::Child(child) => self.pack_into(*child, base, out),
            }
        }
    }

    /// Serialize the whole section.
    pub fn pack(&self) -> Vec<u8> {
        self.pack_region(Self::ROOT)
    }

    /// Serialize a single region, e.g. to checksum a table payload.
    pub fn pack_region(&self, region: RegionId) -> Vec<u8> {
        let r = self.region(region);
        let mut out = vec![0u8; r.size as usize];
        self.pack_into(region, r.offset, &mut out);
        out
    }
}

impl fmt::Debug for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layout")
            .field("base", &self.base)
            .field("end", &self.end)
            .field("regions", &self.regions.len())
            .finish()
    }
}
