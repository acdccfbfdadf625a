// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! High-level OTA update orchestration.
//!
//! The manager drives the whole update lifecycle against the inactive bank:
//!
//! ```text
//! Idle -> Preparing -> Erasing -> Receiving -> Validating -> Complete
//!                                                        \-> Error
//! ```
//!
//! Incoming bytes are buffered into one 256-byte page and programmed page by
//! page; a trailing partial page is padded with 0xFF at finalize. Validation
//! re-reads the image from flash (not the streaming CRC) so silent program
//! corruption is caught before the bank is ever marked valid.

use core::fmt::Write as _;

use heapless::String;
use log::{info, warn};
use serde::Serialize;

use crate::flash::{FlashDevice, FlashError, Watchdog, CRC32};
use crate::layout::{Bank, FLASH_PAGE_SIZE};
use crate::metadata::{MetadataError, MetadataStore, VERSION_STRING_LENGTH};

const PAGE: usize = FLASH_PAGE_SIZE as usize;

/// Update state machine states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum UpdateState {
    Idle,
    Preparing,
    Erasing,
    Receiving,
    Validating,
    Complete,
    Error,
}

impl UpdateState {
    pub const fn as_str(self) -> &'static str {
        match self {
            UpdateState::Idle => "idle",
            UpdateState::Preparing => "preparing",
            UpdateState::Erasing => "erasing",
            UpdateState::Receiving => "receiving",
            UpdateState::Validating => "validating",
            UpdateState::Complete => "complete",
            UpdateState::Error => "error",
        }
    }
}

/// In-RAM update status, surfaced over REST. Never persisted.
#[derive(Clone, Debug, Serialize)]
pub struct UpdateStatus {
    pub state: UpdateState,
    pub bytes_received: u32,
    pub total_bytes: u32,
    pub progress_percent: u32,
    pub target_bank: Option<Bank>,
    pub error_message: String<128>,
}

impl Default for UpdateStatus {
    fn default() -> Self {
        Self {
            state: UpdateState::Idle,
            bytes_received: 0,
            total_bytes: 0,
            progress_percent: 0,
            target_bank: None,
            error_message: String::new(),
        }
    }
}

/// Per-bank snapshot for the `firmware_status` REST endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct FirmwareBankInfo {
    pub bank: Bank,
    pub valid: bool,
    pub size: u32,
    pub crc32: u32,
    pub version: String<VERSION_STRING_LENGTH>,
    pub boot_count: u8,
}

/// Full status snapshot: update progress plus both banks.
#[derive(Clone, Debug, Serialize)]
pub struct FirmwareStatus {
    pub update: UpdateStatus,
    pub active_bank: Option<Bank>,
    pub bank_a: FirmwareBankInfo,
    pub bank_b: FirmwareBankInfo,
    pub rollback_occurred: bool,
    pub rollback_count: u8,
}

/// Update operation failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateError {
    /// Operation not allowed in the current state.
    BadState,
    /// Size or argument out of bounds.
    InvalidParam,
    Flash(FlashError),
    Metadata(MetadataError),
    /// Image CRC in flash differs from the announced CRC.
    CrcMismatch { expected: u32, actual: u32 },
}

impl From<FlashError> for UpdateError {
    fn from(e: FlashError) -> Self {
        UpdateError::Flash(e)
    }
}

impl From<MetadataError> for UpdateError {
    fn from(e: MetadataError) -> Self {
        UpdateError::Metadata(e)
    }
}

impl core::fmt::Display for UpdateError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            UpdateError::BadState => f.write_str("operation not allowed in current state"),
            UpdateError::InvalidParam => f.write_str("invalid parameter"),
            UpdateError::Flash(e) => write!(f, "flash: {e}"),
            UpdateError::Metadata(e) => write!(f, "metadata: {e}"),
            UpdateError::CrcMismatch { expected, actual } => {
                write!(f, "CRC mismatch: expected {expected:#010x}, got {actual:#010x}")
            }
        }
    }
}

/// Orchestrates staging, validation, activation and rollback.
///
/// The manager owns the metadata store (and through it the flash); it is the
/// single writer of both during an update. Concurrent REST readers take
/// status snapshots by value.
pub struct FirmwareManager<D, W = crate::flash::NoWatchdog> {
    store: MetadataStore<D, W>,
    status: UpdateStatus,
    target: Option<Bank>,
    page_buf: [u8; PAGE],
    page_fill: usize,
    /// Bytes already programmed to flash (always page-aligned).
    write_cursor: u32,
    digest: Option<crc::Digest<'static, u32>>,
    expected_version: String<VERSION_STRING_LENGTH>,
}

impl<D: FlashDevice, W: Watchdog> FirmwareManager<D, W> {
    pub fn new(store: MetadataStore<D, W>) -> Self {
        Self {
            store,
            status: UpdateStatus::default(),
            target: None,
            page_buf: [0xFF; PAGE],
            page_fill: 0,
            write_cursor: 0,
            digest: None,
            expected_version: String::new(),
        }
    }

    pub fn metadata(&self) -> &MetadataStore<D, W> {
        &self.store
    }

    pub fn into_store(self) -> MetadataStore<D, W> {
        self.store
    }

    /// Snapshot of the in-RAM update status.
    pub fn status(&self) -> UpdateStatus {
        self.status.clone()
    }

    pub fn state(&self) -> UpdateState {
        self.status.state
    }

    /// The bank the boot selector chose for this boot.
    pub fn current_bank(&self) -> Option<Bank> {
        self.store.current().active_bank()
    }

    pub fn is_update_in_progress(&self) -> bool {
        matches!(
            self.status.state,
            UpdateState::Preparing
                | UpdateState::Erasing
                | UpdateState::Receiving
                | UpdateState::Validating
        )
    }

    pub fn progress_percent(&self) -> u32 {
        self.status.progress_percent
    }

    pub fn bank_info(&self, bank: Bank) -> FirmwareBankInfo {
        let status = self.store.bank_info(bank);
        let mut version = String::new();
        let _ = version.push_str(status.version_str());
        FirmwareBankInfo {
            bank,
            valid: status.is_valid(),
            size: status.size,
            crc32: status.crc32,
            version,
            boot_count: status.boot_count,
        }
    }

    /// Full snapshot for the `firmware_status` endpoint.
    pub fn firmware_status(&self) -> FirmwareStatus {
        let rec = self.store.current();
        FirmwareStatus {
            update: self.status.clone(),
            active_bank: rec.active_bank(),
            bank_a: self.bank_info(Bank::A),
            bank_b: self.bank_info(Bank::B),
            rollback_occurred: rec.did_rollback_occur(),
            rollback_count: rec.rollback_count,
        }
    }

    /// Begin an update: choose the inactive bank, erase it, flag the staging
    /// in metadata and start receiving.
    ///
    /// Allowed from `Idle` and from `Error` (a failed attempt is retried by
    /// simply starting over; the target bank gets re-erased).
    pub fn start_update(
        &mut self,
        expected_size: u32,
        expected_version: Option<&str>,
    ) -> Result<(), UpdateError> {
        if !matches!(self.status.state, UpdateState::Idle | UpdateState::Error) {
            self.note_rejection("update already in progress");
            return Err(UpdateError::BadState);
        }
        if expected_size == 0 || expected_size > Bank::A.size() {
            self.note_rejection("firmware size exceeds bank capacity");
            return Err(UpdateError::InvalidParam);
        }

        let active = self
            .store
            .current()
            .active_bank()
            .ok_or(UpdateError::Metadata(MetadataError::NoValidRecord))?;
        let target = active.opposite();

        info!(
            "starting update: {expected_size} bytes -> bank {}",
            target.name()
        );

        self.status = UpdateStatus {
            state: UpdateState::Preparing,
            bytes_received: 0,
            total_bytes: expected_size,
            progress_percent: 0,
            target_bank: Some(target),
            error_message: String::new(),
        };
        self.target = Some(target);
        self.expected_version.clear();
        let _ = self
            .expected_version
            .push_str(expected_version.unwrap_or(""));

        self.status.state = UpdateState::Erasing;
        if let Err(e) = self.store.flash_mut().erase_bank(target) {
            self.set_error("bank erase failed");
            return Err(e.into());
        }

        if let Err(e) = self.store.set_update_in_progress(target) {
            self.set_error("failed to record update start");
            return Err(e.into());
        }

        self.page_buf.fill(0xFF);
        self.page_fill = 0;
        self.write_cursor = 0;
        self.digest = Some(CRC32.digest());
        self.status.state = UpdateState::Receiving;

        Ok(())
    }

    /// Stream a chunk of image bytes. Only full pages are programmed; the
    /// remainder waits in the page buffer for the next chunk or finalize.
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<(), UpdateError> {
        if self.status.state != UpdateState::Receiving {
            self.note_rejection("write_chunk outside receiving state");
            return Err(UpdateError::BadState);
        }

        let received = self.write_cursor + self.page_fill as u32;
        if data.len() as u32 > self.status.total_bytes - received {
            self.note_rejection("more data than announced size");
            return Err(UpdateError::InvalidParam);
        }

        if let Some(digest) = self.digest.as_mut() {
            digest.update(data);
        }

        let target = self.target.ok_or(UpdateError::BadState)?;
        let mut rest = data;
        while !rest.is_empty() {
            let n = rest.len().min(PAGE - self.page_fill);
            self.page_buf[self.page_fill..self.page_fill + n].copy_from_slice(&rest[..n]);
            self.page_fill += n;
            rest = &rest[n..];

            if self.page_fill == PAGE {
                let offset = target.offset() + self.write_cursor;
                if let Err(e) = self.store.flash_mut().write(offset, &self.page_buf) {
                    self.set_error("flash write failed");
                    return Err(e.into());
                }
                self.write_cursor += FLASH_PAGE_SIZE;
                self.page_fill = 0;
                self.page_buf.fill(0xFF);
            }
        }

        self.status.bytes_received = self.write_cursor + self.page_fill as u32;
        self.status.progress_percent = if self.status.total_bytes == 0 {
            0
        } else {
            (self.status.bytes_received as u64 * 100 / self.status.total_bytes as u64) as u32
        };

        Ok(())
    }

    /// Flush the tail, validate the staged image against `expected_crc32`
    /// and record the bank as valid.
    ///
    /// On a CRC mismatch the manager goes to `Error` but deliberately leaves
    /// `update_in_progress` set: the operator decides between retry and
    /// cancel.
    pub fn finalize_update(&mut self, expected_crc32: u32) -> Result<(), UpdateError> {
        if self.status.state != UpdateState::Receiving {
            self.note_rejection("finalize outside receiving state");
            return Err(UpdateError::BadState);
        }
        if self.status.bytes_received != self.status.total_bytes {
            self.note_rejection("image shorter than announced size");
            return Err(UpdateError::InvalidParam);
        }

        let target = self.target.ok_or(UpdateError::BadState)?;

        // Pad and program the trailing partial page, if any.
        if self.page_fill > 0 {
            let offset = target.offset() + self.write_cursor;
            let page = self.page_buf;
            if let Err(e) = self.store.flash_mut().write(offset, &page) {
                self.set_error("flash write failed");
                return Err(e.into());
            }
            self.write_cursor += FLASH_PAGE_SIZE;
            self.page_fill = 0;
        }

        self.status.state = UpdateState::Validating;
        info!("validating {} bytes in bank {}", self.status.total_bytes, target.name());

        let stream_crc = self.digest.take().map(|digest| digest.finalize());

        let actual = match self
            .store
            .flash_mut()
            .calculate_crc32(target.offset(), self.status.total_bytes)
        {
            Ok(crc) => crc,
            Err(e) => {
                self.set_error("flash readback failed");
                return Err(e.into());
            }
        };

        // The streamed CRC should always match the flash readback; a
        // difference means bits got lost between RAM and flash.
        if let Some(stream) = stream_crc {
            if stream != actual {
                warn!("stream CRC {stream:#010x} != flash CRC {actual:#010x}");
            }
        }

        if actual != expected_crc32 {
            let mut msg: String<128> = String::new();
            let _ = write!(msg, "CRC mismatch: expected {expected_crc32:#010x}, got {actual:#010x}");
            self.status.state = UpdateState::Error;
            self.status.error_message = msg;
            return Err(UpdateError::CrcMismatch {
                expected: expected_crc32,
                actual,
            });
        }

        let version = self.expected_version.clone();
        if let Err(e) =
            self.store
                .mark_bank_valid(target, actual, self.status.total_bytes, &version)
        {
            self.set_error("failed to record staged image");
            return Err(e.into());
        }
        if let Err(e) = self.store.clear_update_in_progress() {
            self.set_error("failed to clear update flag");
            return Err(e.into());
        }

        self.status.state = UpdateState::Complete;
        self.status.progress_percent = 100;
        info!("update staged in bank {}, CRC {actual:#010x}", target.name());

        Ok(())
    }

    /// Abort the update and return to `Idle`.
    ///
    /// The erased target bank is left as-is; its stale metadata keeps it
    /// invalid and the next `start_update` re-erases it.
    pub fn cancel_update(&mut self) -> Result<(), UpdateError> {
        info!("cancelling update");

        self.digest = None;
        self.page_fill = 0;
        self.write_cursor = 0;
        self.target = None;
        self.status = UpdateStatus::default();

        if self.store.current().is_update_in_progress() {
            self.store.clear_update_in_progress()?;
        }
        Ok(())
    }

    /// Switch the active bank to the freshly staged image. Valid only in
    /// `Complete`; the caller is expected to reboot immediately after.
    pub fn activate(&mut self) -> Result<Bank, UpdateError> {
        if self.status.state != UpdateState::Complete {
            self.note_rejection("no staged update to activate");
            return Err(UpdateError::BadState);
        }
        let target = self.target.ok_or(UpdateError::BadState)?;

        self.store.set_active_bank(target)?;
        info!("activated bank {}, reboot pending", target.name());
        Ok(target)
    }

    /// Manual rollback to the opposite bank. Fails if that bank is not
    /// valid; the caller reboots on success.
    pub fn rollback(&mut self) -> Result<Bank, UpdateError> {
        let bank = self.store.trigger_rollback()?;
        Ok(bank)
    }

    /// Reset the active bank's boot counter. The application calls this once
    /// its critical initialization has succeeded; skipping it lets the boot
    /// counter climb until the selector rolls back.
    pub fn confirm_boot(&mut self) -> Result<(), UpdateError> {
        self.store.reset_boot_count()?;
        Ok(())
    }

    /// One-shot "last boot was a rollback" flag for the UI.
    pub fn did_rollback_occur(&self) -> bool {
        self.store.did_rollback_occur()
    }

    pub fn clear_rollback_flag(&mut self) -> Result<(), UpdateError> {
        self.store.clear_rollback_flag()?;
        Ok(())
    }

    /// Record a rejection message without disturbing the state machine.
    fn note_rejection(&mut self, msg: &str) {
        self.status.error_message.clear();
        let _ = self.status.error_message.push_str(msg);
    }

    fn set_error(&mut self, msg: &str) {
        warn!("update error: {msg}");
        self.status.state = UpdateState::Error;
        self.status.error_message.clear();
        let _ = self.status.error_message.push_str(msg);
    }
}
