// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Firmware upload tool for otamu devices over the HTTP REST API.
//!
//! Usage:
//!   otamu-upload --device http://192.168.1.50 status
//!   otamu-upload --device http://192.168.1.50 upload firmware.bin --version 1.4.0
//!   otamu-upload --device http://192.168.1.50 activate

mod cli;
mod client;
mod commands;

use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    cli::run(args)
}
