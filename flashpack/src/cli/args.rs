// SPDX-FileCopyrightText: 2024-2025 The flashpack developers
// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(version, about = "Build and inspect flash images")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Build(BuildCli),
    Inspect(InspectCli),
}

/// Build one image per flash from a target description.
#[derive(Debug, Parser)]
pub struct BuildCli {
    /// Path to the JSON target description.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub config: PathBuf,

    /// Directory to write the <flash>.bin images to.
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    pub output_dir: PathBuf,
}

/// Inspect a partition table inside a built image.
#[derive(Debug, Parser)]
pub struct InspectCli {
    /// Path to the flash image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub image: PathBuf,

    /// Byte offset of the partition table within the image.
    #[arg(short = 'O', long, value_name = "OFFSET", default_value_t = 0)]
    pub offset: u64,
}
