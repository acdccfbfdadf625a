// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Command-line interface definitions.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::client::Client;
use crate::commands;

/// Command-line arguments.
#[derive(Parser)]
#[command(name = "otamu-upload")]
#[command(about = "Firmware upload tool for otamu devices")]
pub struct Cli {
    /// Device base URL (e.g., http://192.168.1.50)
    #[arg(short, long)]
    pub device: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Show firmware and update status
    Status,

    /// Upload a firmware image to the inactive bank
    Upload {
        /// Firmware binary file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Version string recorded with the image
        #[arg(short, long)]
        version: Option<String>,
    },

    /// Ask the device to pull a firmware image from an HTTP URL
    Download {
        /// Image URL (http:// only)
        #[arg(long)]
        url: String,

        /// Expected CRC32 of the image, hex (e.g. 0xDEADBEEF)
        #[arg(long)]
        crc32: String,

        /// Version string recorded with the image
        #[arg(short, long)]
        version: Option<String>,
    },

    /// Activate the staged firmware and reboot the device
    Activate,

    /// Roll back to the previous firmware and reboot the device
    Rollback,

    /// Cancel an in-progress update
    Cancel,
}

/// Dispatch a parsed command line.
pub fn run(args: Cli) -> Result<()> {
    let client = Client::new(&args.device)?;

    match args.command {
        Commands::Status => commands::status(&client),
        Commands::Upload { file, version } => commands::upload(&client, &file, version.as_deref()),
        Commands::Download { url, crc32, version } => {
            commands::download(&client, &url, &crc32, version.as_deref())
        }
        Commands::Activate => commands::activate(&client),
        Commands::Rollback => commands::rollback(&client),
        Commands::Cancel => commands::cancel(&client),
    }
}
