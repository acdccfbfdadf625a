// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Dual-bank OTA firmware update core for XIP NOR flash.
//!
//! A new firmware image is streamed into the inactive bank while the running
//! image stays untouched; activation is a single atomic metadata swap; and the
//! boot selector rolls back to the last known-good image after a bounded
//! number of failed boots.
//!
//! The crate is layered bottom-up:
//! - [`layout`]: the fixed flash partition map and [`Bank`] addressing
//! - [`flash`]: sector/page flash operations over a [`FlashDevice`]
//! - [`metadata`]: the double-buffered persistent metadata store
//! - [`manager`]: the update state machine (stage, validate, activate)
//! - [`boot`]: early-boot bank selection with automatic rollback
//! - [`download`] / [`upload`]: HTTP-fed byte sinks into the manager
//!
//! This crate supports both `no_std` (firmware) and `std` (host) builds:
//! - `std` feature (default): enables the [`sim`] flash simulator for tests
//!   and host tooling
//! - `embedded` feature: enables the [`rp2040`] board module

#![cfg_attr(not(feature = "std"), no_std)]

pub mod boot;
pub mod download;
pub mod flash;
pub mod layout;
pub mod manager;
pub mod metadata;
pub mod upload;

#[cfg(feature = "embedded")]
pub mod rp2040;

#[cfg(feature = "std")]
pub mod sim;

// Re-export the types most callers need.
pub use boot::{select_boot_bank, BootDecision, HaltReason};
pub use flash::{FlashDevice, FlashError, FlashOps, NoWatchdog, Watchdog};
pub use layout::{Bank, FLASH_PAGE_SIZE, FLASH_SECTOR_SIZE, FLASH_TOTAL_SIZE};
pub use manager::{
    FirmwareBankInfo, FirmwareManager, FirmwareStatus, UpdateError, UpdateState, UpdateStatus,
};
pub use metadata::{
    MetadataError, MetadataRecord, MetadataStore, MAX_BOOT_ATTEMPTS, METADATA_MAGIC,
    VERSION_STRING_LENGTH,
};
