// SPDX-FileCopyrightText: 2024-2025 The flashpack developers
// SPDX-License-Identifier: GPL-3.0-only

//! Secret storage: activation-code header plus a table of key-code slots.
//!
//! The key material itself is provisioned on the device; this codec only
//! reserves correctly-sized, zero-filled slots. A key-code's slot size is
//! a closed-form function of the source key size in bits and whether the
//! key is stored wrapped; wrapping is selected automatically for keys
//! under 1024 bits unless the configuration overrides it.

use bitflags::bitflags;

use crate::config::SecretStorageConfig;
use crate::crc32;
use crate::flash::{Error, FinalizeContext, LayoutContext, Result};
use crate::layout::{FieldWidth, Layout, RegionId};

/// Sizes below this are wrapped unless explicitly overridden.
const AUTO_WRAP_LIMIT: u64 = 1024;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ValidFlags: u8 {
        const ENCRYPTED = 1 << 1;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct KeyCodeFlags: u8 {
        const WRAPPED = 1 << 0;
    }
}

/// Slot size in bytes for a source key of `size` bits.
fn key_code_size(size: u64, wrapped: bool) -> u64 {
    if wrapped {
        36 + size / 8 + 16 * size.div_ceil(384)
    } else {
        (size / 8).next_multiple_of(16)
    }
}

#[derive(Debug)]
struct KeyCodePlan {
    size: u64,
    wrapped: bool,
}

#[derive(Debug)]
pub struct SecretStorageSection {
    encrypted: bool,
    key_codes: Vec<KeyCodePlan>,
    layout: Layout,
    secure: RegionId,
    payload: RegionId,
}

impl SecretStorageSection {
    pub fn new(name: &str, config: &SecretStorageConfig) -> Result<Self> {
        let mut key_codes = vec![];

        for kc in &config.kc_list {
            let wrapped = kc.wrapped.unwrap_or(kc.size < AUTO_WRAP_LIMIT);

            if !wrapped {
                let multiple = if kc.size >= 1024 { 1024 } else { 64 };
                if kc.size % multiple != 0 {
                    return Err(Error::Configuration {
                        section: name.to_owned(),
                        message: format!(
                            "unwrapped key size {} is not a multiple of {multiple}",
                            kc.size,
                        ),
                    });
                }
            }

            key_codes.push(KeyCodePlan {
                size: kc.size,
                wrapped,
            });
        }

        let mut layout = Layout::new(0);
        let secure = layout.add_region(Layout::ROOT, "secure");
        let payload = layout.add_region(Layout::ROOT, "payload");

        Ok(Self {
            encrypted: config.encrypted,
            key_codes,
            layout,
            secure,
            payload,
        })
    }

    pub fn partition_class(&self) -> (u8, u8) {
        (0x2, 0xe5)
    }

    /// Secret storage is always flashed.
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

        let secure = layout.add_region(Layout::ROOT, "secure");
        layout.add_field(secure, "valid", FieldWidth::U8);
        layout.add_bytes(secure, "ac", 996);
        layout.add_bytes(secure, "padding0", 11);
        layout.add_field(secure, "crc", FieldWidth::U32);
        layout.add_bytes(secure, "padding1", 12);

        let valid = if self.encrypted {
            ValidFlags::ENCRYPTED
        } else {
            ValidFlags::empty()
        };
        layout.set_field(secure, "valid", u64::from(valid.bits()))?;

        let payload = layout.add_region(Layout::ROOT, "payload");

        let meta = layout.add_region(payload, "meta");
        layout.add_field(meta, "kc_number", FieldWidth::U8);
        let nb = self.key_codes.len();
        for i in 0..nb {
            layout.add_field(meta, &format!("offset{i}"), FieldWidth::U32);
        }
        layout.add_bytes(meta, "padding0", 16 - (4 * nb + 1) % 16);
        layout.set_field(meta, "kc_number", nb as u64)?;

        let mut first_kc = None;
        for (i, kc) in self.key_codes.iter().enumerate() {
            let region = layout.add_region(payload, &format!("kc{i}"));
            let kc_size = key_code_size(kc.size, kc.wrapped);

            layout.add_field(region, "kc_size", FieldWidth::U16);
            layout.add_field(region, "kc_so_id", FieldWidth::U8);
            layout.add_field(region, "flags", FieldWidth::U8);
            layout.add_bytes(region, "kc", kc_size as usize);
            layout.add_bytes(region, "padding1", 16 - (kc_size as usize + 4) % 16);

            let flags = if kc.wrapped {
                KeyCodeFlags::WRAPPED
            } else {
                KeyCodeFlags::empty()
            };
            layout.set_field(region, "kc_size", kc_size)?;
            layout.set_field(region, "flags", u64::from(flags.bits()))?;

            let base = *first_kc.get_or_insert_with(|| layout.offset(region));
            layout.set_field(meta, &format!("offset{i}"), layout.offset(region) - base)?;
        }

        self.layout = layout;
        self.secure = secure;
        self.payload = payload;

        Ok(())
    }

    pub fn finalize(&mut self, _ctx: &FinalizeContext) -> Result<()> {
        let payload = self.layout.pack_region(self.payload);
        let crc = crc32::update(crc32::INIT, &payload);
        self.layout.set_field(self.secure, "crc", u64::from(crc))?;

        Ok(())
    }

    pub fn content_size(&self) -> u64 {
        self.layout.content_size()
    }

    pub fn pack(&self) -> Vec<u8> {
        self.layout.pack()
    }
}
