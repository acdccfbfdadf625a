// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Command implementations for firmware operations.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{bail, Context, Result};
use crc::{Crc, CRC_32_ISO_HDLC};
use indicatif::{ProgressBar, ProgressStyle};

use crate::client::{BankInfo, Client};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Get and display device firmware status.
pub fn status(client: &Client) -> Result<()> {
    let status = client.firmware_status()?;

    println!("Firmware Status:");
    println!(
        "  Active bank:  {}",
        status.active_bank.as_deref().unwrap_or("?")
    );
    print_bank(&status.bank_a);
    print_bank(&status.bank_b);
    println!("  Update state: {}", status.update.state);
    if status.update.total_bytes > 0 {
        println!(
            "  Progress:     {}% ({}/{} bytes)",
            status.update.progress_percent, status.update.bytes_received, status.update.total_bytes
        );
    }
    if !status.update.error_message.is_empty() {
        println!("  Last error:   {}", status.update.error_message);
    }
    if status.rollback_occurred {
        println!(
            "  NOTE: last boot was a rollback (total rollbacks: {})",
            status.rollback_count
        );
    }

    Ok(())
}

fn print_bank(info: &BankInfo) {
    println!(
        "  Bank {}:       {} version={} size={} crc32={:#010x} boot_count={}",
        info.bank,
        if info.valid { "valid  " } else { "invalid" },
        if info.version.is_empty() { "-" } else { &info.version },
        info.size,
        info.crc32,
        info.boot_count
    );
}

/// Upload a firmware image to the device's inactive bank.
pub fn upload(client: &Client, file: &Path, version: Option<&str>) -> Result<()> {
    let firmware =
        std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let size = firmware.len() as u32;
    if size == 0 {
        bail!("{} is empty", file.display());
    }
    let crc32 = CRC32.checksum(&firmware);

    println!(
        "Firmware: {} ({} bytes, CRC32: {:#010x})",
        file.display(),
        size,
        crc32
    );
    if let Some(version) = version {
        println!("Version:  {version}");
    }
    println!();
    println!("Uploading (the device erases the target bank first, this can take a while)...");

    let pb = ProgressBar::new(size as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            )?
            .progress_chars("#>-"),
    );

    // Re-open as a reader so the progress bar tracks what actually went out.
    let reader = BufReader::new(
        File::open(file).with_context(|| format!("Failed to open {}", file.display()))?,
    );
    let reader = pb.wrap_read(reader);

    let result = client.upload(reader, size, crc32, version);
    match result {
        Ok(()) => pb.finish_with_message("Upload complete"),
        Err(_) => pb.abandon(),
    }
    result?;

    println!();
    println!("Firmware staged successfully!");
    println!(
        "Use 'otamu-upload --device {} activate' to boot into it.",
        client.base_url()
    );

    Ok(())
}

/// Ask the device to pull an image from a URL.
pub fn download(client: &Client, url: &str, crc32: &str, version: Option<&str>) -> Result<()> {
    let crc32 = parse_crc32(crc32)?;

    println!("Requesting download of {url} (CRC32 {crc32:#010x})...");
    client.download(url, crc32, version)?;

    println!("Download started. Poll progress with:");
    println!("  otamu-upload --device {} status", client.base_url());

    Ok(())
}

/// Activate the staged firmware.
pub fn activate(client: &Client) -> Result<()> {
    let status = client.firmware_status()?;
    if status.update.state != "Complete" {
        bail!(
            "no staged update to activate (update state: {})",
            status.update.state
        );
    }

    println!("Activating staged firmware; the device will reboot...");
    client.activate()?;
    println!("Done. The application must confirm the boot or the device rolls back.");

    Ok(())
}

/// Roll back to the previous firmware.
pub fn rollback(client: &Client) -> Result<()> {
    println!("Requesting rollback; the device will reboot if the other bank is valid...");
    client.rollback()?;
    println!("Rollback requested.");

    Ok(())
}

/// Cancel an in-progress update.
pub fn cancel(client: &Client) -> Result<()> {
    client.cancel()?;
    println!("Update cancelled.");

    Ok(())
}

/// Accept `0xDEADBEEF`, `DEADBEEF` or decimal.
fn parse_crc32(s: &str) -> Result<u32> {
    let trimmed = s.trim();
    let value = if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16)
    } else if trimmed.chars().all(|c| c.is_ascii_digit()) {
        trimmed.parse::<u32>()
    } else {
        u32::from_str_radix(trimmed, 16)
    };
    value.with_context(|| format!("invalid CRC32 value: {s}"))
}
