// SPDX-FileCopyrightText: 2024-2025 The flashpack developers
// SPDX-License-Identifier: GPL-3.0-only

//! Volume table: named groupings of partitions with boot metadata.
//!
//! Without an explicit `volumes` list the codec builds the historical
//! default: an "app" volume holding every non-system section of the
//! owning flash and a "factory" volume holding the system ones, each with
//! four spare entry slots. Explicit volumes resolve partition names across
//! the whole target; an unknown name aborts the build.

use bitflags::bitflags;

use crate::config::VolumeTableConfig;
use crate::crc32;
use crate::flash::{Error, FinalizeContext, LayoutContext, Result};
use crate::layout::{FieldWidth, Layout, RegionId};

const MAGIC: u16 = 0x01ba;

/// Spare entry slots appended to each default-mode volume.
const DEFAULT_FREE_ENTRIES: u8 = 4;

/// Bytes of the header covered by `crc_header` (`magic..=crc_vtable`).
const HEADER_CRC_SPAN: usize = 11;

/// Partition type marking system sections (bootloaders, tables); those go
/// into the "factory" volume in default mode.
const SYSTEM_TYPE: u8 = 0x2;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VolumeFlags: u16 {
        const BOOTABLE = 1 << 0;
    }
}

struct EntryPlan {
    uuid: u16,
    label: String,
}

struct VolumePlan {
    label: String,
    flags: VolumeFlags,
    boot_order: u8,
    boot_count: u8,
    entries: Vec<EntryPlan>,
    // (count, named): default-mode spares are fully zero, explicit-mode
    // spares carry a free_entry<i> label.
    free_entries: u8,
    named_free_entries: bool,
}

pub struct VolumeTableSection {
    name: String,
    config: VolumeTableConfig,
    layout: Layout,
    header: RegionId,
    payload: RegionId,
}

impl VolumeTableSection {
    pub fn new(name: &str, config: &VolumeTableConfig) -> Self {
        let mut layout = Layout::new(0);
        let header = layout.add_region(Layout::ROOT, "header");
        let payload = layout.add_region(Layout::ROOT, "volumes");

        Self {
            name: name.to_owned(),
            config: config.clone(),
            layout,
            header,
            payload,
        }
    }

    pub fn partition_class(&self) -> (u8, u8) {
        (0x2, 0xe1)
    }

    /// The volume table is always flashed.
    pub fn is_empty(&self) -> bool {
        false
    }

    fn plan(&self, ctx: &LayoutContext) -> Result<Vec<VolumePlan>> {
        match &self.config.volumes {
            None => {
                // Entries of default volumes address partitions by their
                // index within the owning flash.
                let app = ctx
                    .flash_decls()
                    .filter(|d| d.partition_type != SYSTEM_TYPE)
                    .map(|d| EntryPlan {
                        uuid: d.flash_index,
                        label: d.name.clone(),
                    })
                    .collect();
                let factory = ctx
                    .flash_decls()
                    .filter(|d| d.partition_type == SYSTEM_TYPE)
                    .map(|d| EntryPlan {
                        uuid: d.flash_index,
                        label: d.name.clone(),
                    })
                    .collect();

                Ok(vec![
                    VolumePlan {
                        label: "app".to_owned(),
                        flags: VolumeFlags::BOOTABLE,
                        boot_order: 0,
                        boot_count: 0,
                        entries: app,
                        free_entries: DEFAULT_FREE_ENTRIES,
                        named_free_entries: false,
                    },
                    VolumePlan {
                        label: "factory".to_owned(),
                        flags: VolumeFlags::empty(),
                        boot_order: 0,
                        boot_count: 0,
                        entries: factory,
                        free_entries: DEFAULT_FREE_ENTRIES,
                        named_free_entries: false,
                    },
                ])
            }
            Some(volumes) => volumes
                .iter()
                .map(|v| {
                    let entries = v
                        .partitions
                        .iter()
                        .map(|partition| {
                            let decl = ctx
                                .decls()
                                .iter()
                                .find(|d| &d.name == partition)
                                .ok_or_else(|| Error::CrossReference {
                                    section: self.name.clone(),
                                    target: partition.clone(),
                                })?;

                            Ok(EntryPlan {
                                uuid: decl.global_index,
                                label: partition.clone(),
                            })
                        })
                        .collect::<Result<_>>()?;

                    Ok(VolumePlan {
                        label: v.name.clone(),
                        flags: if v.bootable {
                            VolumeFlags::BOOTABLE
                        } else {
                            VolumeFlags::empty()
                        },
                        boot_order: v.boot_order,
                        boot_count: v.boot_count,
                        entries,
                        free_entries: v.free_entry_nb,
                        named_free_entries: true,
                    })
                })
                .collect(),
        }
    }

    pub fn layout(
        &mut self,
        offset: u64,
        _reserved: Option<u64>,
        ctx: &LayoutContext,
    ) -> Result<()> {
        let plans = self.plan(ctx)?;

        let mut layout = Layout::new(offset);
        let header = layout.add_region(Layout::ROOT, "header");
        layout.add_field(header, "magic", FieldWidth::U16);
        layout.add_field(header, "nb_volumes", FieldWidth::U8);
        layout.add_field(header, "max_size", FieldWidth::U32);
        layout.add_field(header, "crc_vtable", FieldWidth::U32);
        layout.add_field(header, "crc_header", FieldWidth::U32);

        layout.set_field(header, "magic", u64::from(MAGIC))?;
        layout.set_field(header, "nb_volumes", plans.len() as u64)?;

        let payload = layout.add_region(Layout::ROOT, "volumes");

        for (uuid, plan) in plans.iter().enumerate() {
            let volume = layout.add_region(payload, &format!("volume{uuid}"));

            layout.add_field(volume, "flags", FieldWidth::U16);
            layout.add_field(volume, "uuid", FieldWidth::U16);
            layout.add_bytes(volume, "label", 16);
            layout.add_field(volume, "nb_partitions", FieldWidth::U8);
            layout.add_field(volume, "max_nb_partitions", FieldWidth::U8);
            layout.add_field(volume, "boot_order", FieldWidth::U8);
            layout.add_field(volume, "boot_count", FieldWidth::U8);

            layout.set_field(volume, "flags", u64::from(plan.flags.bits()))?;
            layout.set_field(volume, "uuid", uuid as u64)?;
            layout.set_bytes(volume, "label", label_bytes(&plan.label))?;
            layout.set_field(volume, "nb_partitions", plan.entries.len() as u64)?;
            layout.set_field(
                volume,
                "max_nb_partitions",
                plan.entries.len() as u64 + u64::from(plan.free_entries),
            )?;
            layout.set_field(volume, "boot_order", u64::from(plan.boot_order))?;
            layout.set_field(volume, "boot_count", u64::from(plan.boot_count))?;

            for (i, entry) in plan.entries.iter().enumerate() {
                let region = layout.add_region(volume, &format!("entry{i}"));
                layout.add_field(region, "flags", FieldWidth::U16);
                layout.add_field(region, "uuid", FieldWidth::U16);
                layout.add_bytes(region, "label", 16);

                layout.set_field(region, "uuid", u64::from(entry.uuid))?;
                layout.set_bytes(region, "label", label_bytes(&entry.label))?;
            }

            for i in 0..plan.free_entries {
                let region = layout.add_region(volume, &format!("free_entry{i}"));
                layout.add_field(region, "flags", FieldWidth::U16);
                layout.add_field(region, "uuid", FieldWidth::U16);
                layout.add_bytes(region, "label", 16);

                if plan.named_free_entries {
                    layout.set_bytes(
                        region,
                        "label",
                        label_bytes(&format!("free_entry{i}")),
                    )?;
                }
            }
        }

        self.layout = layout;
        self.header = header;
        self.payload = payload;

        Ok(())
    }

    pub fn finalize(&mut self, _ctx: &FinalizeContext) -> Result<()> {
        let payload = self.layout.pack_region(self.payload);

        self.layout
            .set_field(self.header, "max_size", payload.len() as u64)?;
        self.layout.set_field(
            self.header,
            "crc_vtable",
            u64::from(crc32::update(crc32::INIT, &payload)),
        )?;

        let header = self.layout.pack_region(self.header);
        self.layout.set_field(
            self.header,
            "crc_header",
            u64::from(crc32::update(crc32::INIT, &header[..HEADER_CRC_SPAN])),
        )?;

        Ok(())
    }

    pub fn content_size(&self) -> u64 {
        self.layout.content_size()
    }

    pub fn pack(&self) -> Vec<u8> {
        self.layout.pack()
    }
}

/// Labels are stored NUL-terminated in a 16-byte slot; longer names are
/// truncated.
fn label_bytes(label: &str) -> &[u8] {
    let bytes = label.as_bytes();
    &bytes[..bytes.len().min(15)]
}
