// SPDX-FileCopyrightText: 2024-2025 The flashpack developers
// SPDX-License-Identifier: GPL-3.0-only

//! flashpack computes byte-exact flash images for a family of embedded SoCs.
//! A target description lists one or more flashes, each holding an ordered
//! list of typed sections (boot ROM, app binary, partition/volume tables,
//! filesystems, secret storage). Sections are laid out in two phases: first
//! every section computes its own structure and gets an offset assigned,
//! then every section fills in the fields that depend on the addresses of
//! sections placed after it.
//!
//! flashpack is primarily an application; the library API exists for the
//! CLI and the test suite and can change at any time.

pub mod cli;
pub mod config;
pub mod crc32;
pub mod elf;
pub mod flash;
pub mod format;
pub mod layout;

#[cfg(test)]
pub(crate) mod testutil;
