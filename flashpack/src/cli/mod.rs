// SPDX-FileCopyrightText: 2024-2025 The flashpack developers
// SPDX-License-Identifier: GPL-3.0-only

pub mod args;

use std::fs;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use crate::config::TargetConfig;
use crate::flash::Target;
use crate::format::partition;

pub use args::{BuildCli, Cli, Command, InspectCli};

fn build_subcommand(cli: &BuildCli) -> Result<()> {
    let config = TargetConfig::load(&cli.config)?;
    let mut target = Target::from_config(&config)?;
    let images = target.build()?;

    fs::create_dir_all(&cli.output_dir).with_context(|| {
        format!("Failed to create directory: {:?}", cli.output_dir)
    })?;

    for image in images {
        let path = cli.output_dir.join(format!("{}.bin", image.name));
        fs::write(&path, &image.data)
            .with_context(|| format!("Failed to write image: {path:?}"))?;

        info!(image = ?path, size = image.data.len(), "wrote flash image");

        for section in &image.sections {
            info!(
                section = section.name,
                offset = format_args!("{:#x}", section.offset),
                size = format_args!("{:#x}", section.size),
                empty = section.empty,
                "section",
            );
        }
    }

    Ok(())
}

fn inspect_subcommand(cli: &InspectCli) -> Result<()> {
    let data = fs::read(&cli.image)
        .with_context(|| format!("Failed to read image: {:?}", cli.image))?;
    let offset = usize::try_from(cli.offset)?;
    let table = data
        .get(offset..)
        .context("Table offset is outside the image")?;

    let parsed = partition::parse_v2(table)
        .with_context(|| format!("Failed to parse partition table: {:?}", cli.image))?;

    println!(
        "partition table v2: {} entries ({} max)",
        parsed.header.nb_entries, parsed.header.nb_entries_max,
    );

    for record in &parsed.records {
        println!(
            "{:4}  type {:#04x}/{:#04x}  flash {}/{}/{}  offset {:#010x}  \
             size {:#010x}",
            record.uuid.get(),
            record.partition_type,
            record.partition_subtype,
            record.flash_type,
            record.itf,
            record.cs,
            record.offset.get(),
            record.size.get(),
        );
    }

    Ok(())
}

pub fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Build(c) => build_subcommand(&c),
        Command::Inspect(c) => inspect_subcommand(&c),
    }
}
