// SPDX-FileCopyrightText: 2024-2025 The flashpack developers
// SPDX-License-Identifier: GPL-3.0-only

//! Raw section: an opaque payload copied verbatim from a file, or a
//! reserved hole when no file is configured.

use std::fs;

use crate::config::RawConfig;
use crate::flash::{Error, FinalizeContext, LayoutContext, Result};
use crate::layout::Layout;

pub struct RawSection {
    data: Option<Vec<u8>>,
    layout: Layout,
}

impl RawSection {
    pub fn new(name: &str, config: &RawConfig) -> Result<Self> {
        let data = match &config.image {
            Some(path) => Some(fs::read(path).map_err(|e| Error::InputRead {
                section: name.to_owned(),
                path: path.clone(),
                source: e,
            })?),
            None => None,
        };

        Ok(Self {
            data,
            layout: Layout::new(0),
        })
    }

    pub fn partition_class(&self) -> (u8, u8) {
        (0xff, 0xff)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_none()
    }

    pub fn layout(
        &mut self,
        offset: u64,
        _reserved: Option<u64>,
        _ctx: &LayoutContext,
    ) -> Result<()> {
        let mut layout = Layout::new(offset);

        if let Some(data) = &self.data {
            let region = layout.add_region(Layout::ROOT, "image");
            layout.add_bytes(region, "data", data.len());
            layout.set_bytes(region, "data", data)?;
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
