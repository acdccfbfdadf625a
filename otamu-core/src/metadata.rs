// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Double-buffered persistent firmware metadata.
//!
//! Two dedicated 4 KiB sectors each hold one packed [`MetadataRecord`]. The
//! record with the higher sequence number (and a valid magic, version and
//! CRC) is canonical. Every mutation writes a new record with an incremented
//! sequence to the *lower*-sequence sector, so a power loss at any point
//! leaves at least one fully valid record in flash.
//!
//! The on-flash byte layout is a persistence contract shared with the
//! bootloader ROM: field order, widths and padding are pinned and must not
//! change. New fields may only be carved out of `reserved` together with a
//! version bump.

use log::{info, warn};

use crate::flash::{FlashDevice, FlashError, FlashOps, Watchdog, CRC32};
use crate::layout::{
    metadata_sector_offset, Bank, BANK_RAW_UNKNOWN, FLASH_PAGE_SIZE, METADATA_SECTOR_SIZE,
};

/// Record magic: "OTMU".
pub const METADATA_MAGIC: u32 = 0x4F54_4D55;
/// Record schema version.
pub const METADATA_VERSION: u32 = 1;
/// Boot attempts before the selector rolls back.
pub const MAX_BOOT_ATTEMPTS: u8 = 3;
/// Fixed capacity of the per-bank version string (NUL padded).
pub const VERSION_STRING_LENGTH: usize = 32;

/// Bank valid flag values. An erased sector reads 0xFF everywhere, which is
/// why "valid" alone proves nothing; the magic and CRC checks gate it.
pub const BANK_VALID: u8 = 0xFF;
pub const BANK_INVALID: u8 = 0x00;

/// Update-in-progress flag values (same erased-flash rationale as above).
pub const UPDATE_IN_PROGRESS: u8 = 0xFF;
pub const UPDATE_IDLE: u8 = 0x00;

const ROLLBACK_OCCURRED: u8 = 0xFF;

/// Per-bank status block inside the record.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct BankStatus {
    /// CRC-32 of the full firmware image.
    pub crc32: u32,
    /// Image size in bytes.
    pub size: u32,
    /// NUL-padded version string.
    pub version: [u8; VERSION_STRING_LENGTH],
    /// Boot attempts since the last confirmation.
    pub boot_count: u8,
    /// `BANK_VALID` or `BANK_INVALID`.
    pub valid: u8,
    pub _padding: [u8; 2],
}

impl BankStatus {
    pub fn is_valid(&self) -> bool {
        self.valid == BANK_VALID
    }

    /// The version string up to its first NUL; empty if not valid UTF-8.
    pub fn version_str(&self) -> &str {
        let len = self
            .version
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(VERSION_STRING_LENGTH);
        core::str::from_utf8(&self.version[..len]).unwrap_or("")
    }

    /// Store a version string, truncated to the fixed capacity.
    pub fn set_version(&mut self, version: &str) {
        self.version = version_bytes(version);
    }
}

/// Encode a version string into the fixed NUL-padded field.
pub(crate) fn version_bytes(version: &str) -> [u8; VERSION_STRING_LENGTH] {
    let mut out = [0u8; VERSION_STRING_LENGTH];
    let src = version.as_bytes();
    // Keep one trailing NUL so the field always terminates.
    let n = src.len().min(VERSION_STRING_LENGTH - 1);
    out[..n].copy_from_slice(&src[..n]);
    out
}

/// The persistent metadata record, written once per sector starting at the
/// sector's first byte, tail-padded to 4 KiB with 0xFF. Little-endian,
/// packed; 244 bytes.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct MetadataRecord {
    /// `METADATA_MAGIC`.
    pub magic: u32,
    /// `METADATA_VERSION` (record schema, not firmware).
    pub version: u32,
    /// Incremented on every write; the higher sequence wins.
    pub sequence: u32,

    /// Raw bank byte (`Bank::as_raw`), `BANK_RAW_UNKNOWN` when unset.
    pub active_bank: u8,
    pub _padding1: [u8; 3],

    pub bank_a: BankStatus,
    pub bank_b: BankStatus,

    /// `UPDATE_IN_PROGRESS` or `UPDATE_IDLE`.
    pub update_in_progress: u8,
    /// Raw bank byte of the staging target.
    pub update_target: u8,
    pub _padding2: [u8; 2],

    /// `ROLLBACK_OCCURRED` until the application acknowledges it.
    pub rollback_occurred: u8,
    /// Total rollbacks over the device lifetime.
    pub rollback_count: u8,
    pub _padding3: [u8; 2],

    /// Forward-compatibility space; new fields go here with a version bump.
    pub reserved: [u8; 128],

    /// CRC-32 of everything above (must stay the last field).
    pub record_crc32: u32,
}

/// Exact record size; the CRC covers all but the trailing 4 bytes.
pub const METADATA_RECORD_SIZE: usize = core::mem::size_of::<MetadataRecord>();

const _: () = assert!(METADATA_RECORD_SIZE == 244);
const _: () = assert!(METADATA_RECORD_SIZE <= METADATA_SECTOR_SIZE as usize);

impl MetadataRecord {
    /// Factory-default record: bank A valid ("factory" image of unknown size),
    /// bank B invalid, sequence 1.
    pub fn factory_defaults(initial_bank: Bank) -> Self {
        let mut rec = Self {
            magic: METADATA_MAGIC,
            version: METADATA_VERSION,
            sequence: 1,
            active_bank: initial_bank.as_raw(),
            _padding1: [0; 3],
            bank_a: BankStatus {
                crc32: 0,
                size: 0,
                version: version_bytes("factory"),
                boot_count: 0,
                valid: BANK_VALID,
                _padding: [0; 2],
            },
            bank_b: BankStatus {
                crc32: 0,
                size: 0,
                version: [0; VERSION_STRING_LENGTH],
                boot_count: 0,
                valid: BANK_INVALID,
                _padding: [0; 2],
            },
            update_in_progress: UPDATE_IDLE,
            update_target: BANK_RAW_UNKNOWN,
            _padding2: [0; 2],
            rollback_occurred: 0,
            rollback_count: 0,
            _padding3: [0; 2],
            reserved: [0; 128],
            record_crc32: 0,
        };
        rec.refresh_crc();
        rec
    }

    pub fn bank(&self, bank: Bank) -> &BankStatus {
        match bank {
            Bank::A => &self.bank_a,
            Bank::B => &self.bank_b,
        }
    }

    pub fn bank_mut(&mut self, bank: Bank) -> &mut BankStatus {
        match bank {
            Bank::A => &mut self.bank_a,
            Bank::B => &mut self.bank_b,
        }
    }

    pub fn active_bank(&self) -> Option<Bank> {
        Bank::from_raw(self.active_bank)
    }

    pub fn update_target(&self) -> Option<Bank> {
        Bank::from_raw(self.update_target)
    }

    pub fn is_update_in_progress(&self) -> bool {
        self.update_in_progress == UPDATE_IN_PROGRESS
    }

    pub fn did_rollback_occur(&self) -> bool {
        self.rollback_occurred == ROLLBACK_OCCURRED
    }

    /// CRC over the record minus its trailing CRC field.
    pub fn compute_crc32(&self) -> u32 {
        CRC32.checksum(&self.as_bytes()[..METADATA_RECORD_SIZE - 4])
    }

    pub fn refresh_crc(&mut self) {
        self.record_crc32 = self.compute_crc32();
    }

    /// Full structural validation: magic, schema version, CRC, and a sane
    /// active bank. An erased (all-0xFF) sector fails the magic check.
    pub fn is_valid(&self) -> bool {
        if self.magic != METADATA_MAGIC || self.version != METADATA_VERSION {
            return false;
        }
        if self.record_crc32 != self.compute_crc32() {
            return false;
        }
        self.active_bank().is_some()
    }

    /// Raw view of the record for flash programming and checksumming.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: repr(C, packed) with only integral fields; every byte is
        // initialized and the slice lives as long as &self.
        unsafe {
            core::slice::from_raw_parts(self as *const Self as *const u8, METADATA_RECORD_SIZE)
        }
    }

    /// Reconstruct a record from raw flash bytes. The caller still has to
    /// run [`MetadataRecord::is_valid`].
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < METADATA_RECORD_SIZE {
            return None;
        }
        // SAFETY: the length is checked above; read_unaligned copes with the
        // buffer's arbitrary alignment and every bit pattern is a valid value
        // for the record's integral fields.
        Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const Self) })
    }
}

/// Metadata store failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetadataError {
    Flash(FlashError),
    /// Neither sector holds a valid record.
    NoValidRecord,
    /// Read-back after a write did not validate.
    WriteVerifyFailed,
    /// Rollback requested but the opposite bank is not valid.
    OppositeBankInvalid,
}

impl From<FlashError> for MetadataError {
    fn from(e: FlashError) -> Self {
        MetadataError::Flash(e)
    }
}

impl MetadataError {
    pub const fn as_str(self) -> &'static str {
        match self {
            MetadataError::Flash(e) => e.as_str(),
            MetadataError::NoValidRecord => "no valid metadata record",
            MetadataError::WriteVerifyFailed => "metadata write verification failed",
            MetadataError::OppositeBankInvalid => "opposite bank is not valid",
        }
    }
}

impl core::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owner of the flash and of the sole RAM copy of the current record.
///
/// All mutations go through [`MetadataStore::write`], which re-reads both
/// sectors to pick the write target, so the store never trusts its cache for
/// the double-buffering decision.
pub struct MetadataStore<D, W = crate::flash::NoWatchdog> {
    flash: FlashOps<D, W>,
    current: MetadataRecord,
}

impl<D: FlashDevice, W: Watchdog> MetadataStore<D, W> {
    /// Load the canonical record, initializing factory defaults if neither
    /// sector validates (first boot or double corruption).
    pub fn init(mut flash: FlashOps<D, W>) -> Result<Self, MetadataError> {
        if let Some(current) = Self::select_valid(&flash) {
            return Ok(Self { flash, current });
        }

        warn!("no valid metadata found, initializing defaults");
        let mut rec = MetadataRecord::factory_defaults(Bank::A);
        Self::write_sector(&mut flash, 0, &rec)?;
        rec.sequence += 1;
        rec.refresh_crc();
        Self::write_sector(&mut flash, 1, &rec)?;

        Ok(Self { flash, current: rec })
    }

    /// Load without side effects. Fails if neither sector validates: this is
    /// the boot-selector entry point, which must halt rather than invent
    /// defaults.
    pub fn try_load(flash: FlashOps<D, W>) -> Result<Self, MetadataError> {
        match Self::select_valid(&flash) {
            Some(current) => Ok(Self { flash, current }),
            None => Err(MetadataError::NoValidRecord),
        }
    }

    /// The cached canonical record.
    pub fn current(&self) -> &MetadataRecord {
        &self.current
    }

    pub fn flash(&self) -> &FlashOps<D, W> {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut FlashOps<D, W> {
        &mut self.flash
    }

    pub fn into_flash(self) -> FlashOps<D, W> {
        self.flash
    }

    fn read_sector(flash: &FlashOps<D, W>, index: usize) -> Option<MetadataRecord> {
        let mut buf = [0u8; METADATA_RECORD_SIZE];
        flash.read(metadata_sector_offset(index), &mut buf).ok()?;
        MetadataRecord::from_bytes(&buf)
    }

    /// Read both sectors and pick the valid record with the higher sequence.
    fn select_valid(flash: &FlashOps<D, W>) -> Option<MetadataRecord> {
        let rec0 = Self::read_sector(flash, 0).filter(MetadataRecord::is_valid);
        let rec1 = Self::read_sector(flash, 1).filter(MetadataRecord::is_valid);

        match (rec0, rec1) {
            (Some(a), Some(b)) => {
                if a.sequence > b.sequence {
                    Some(a)
                } else {
                    Some(b)
                }
            }
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Erase one metadata sector and program the record page by page, padding
    /// the final partial page with 0xFF. The rest of the sector stays erased.
    fn write_sector(
        flash: &mut FlashOps<D, W>,
        index: usize,
        rec: &MetadataRecord,
    ) -> Result<(), MetadataError> {
        let offset = metadata_sector_offset(index);
        flash.device_mut().erase_sector(offset)?;

        let bytes = rec.as_bytes();
        let mut page = [0xFFu8; FLASH_PAGE_SIZE as usize];
        for (i, chunk) in bytes.chunks(FLASH_PAGE_SIZE as usize).enumerate() {
            page.fill(0xFF);
            page[..chunk.len()].copy_from_slice(chunk);
            flash.write(offset + i as u32 * FLASH_PAGE_SIZE, &page)?;
        }

        Ok(())
    }

    /// Atomically persist a mutated copy of the current record.
    ///
    /// The sequence is incremented and the CRC recomputed here; callers only
    /// apply their field changes. The write targets whichever sector holds
    /// the lower sequence (or the invalid one), is verified by re-read, and
    /// only then replaces the RAM cache.
    pub fn write(&mut self, rec: &MetadataRecord) -> Result<(), MetadataError> {
        let mut new = *rec;
        new.sequence = self.current.sequence + 1;
        new.refresh_crc();

        let rec0 = Self::read_sector(&self.flash, 0).filter(MetadataRecord::is_valid);
        let rec1 = Self::read_sector(&self.flash, 1).filter(MetadataRecord::is_valid);
        let target = match (rec0, rec1) {
            (Some(a), Some(b)) => usize::from(a.sequence >= b.sequence),
            (Some(_), None) => 1,
            (None, Some(_)) => 0,
            // Should not happen after init; sector 0 is as good as any.
            (None, None) => 0,
        };

        Self::write_sector(&mut self.flash, target, &new)?;

        match Self::read_sector(&self.flash, target) {
            Some(back) if back.is_valid() && back.sequence == new.sequence => {}
            _ => {
                warn!("metadata write verification failed on sector {target}");
                return Err(MetadataError::WriteVerifyFailed);
            }
        }

        self.current = new;
        Ok(())
    }

    // --- High-level mutators; each is one atomic write ---

    pub fn set_active_bank(&mut self, bank: Bank) -> Result<(), MetadataError> {
        let mut rec = self.current;
        rec.active_bank = bank.as_raw();
        self.write(&rec)
    }

    /// Increment the active bank's boot counter.
    pub fn increment_boot_count(&mut self) -> Result<(), MetadataError> {
        let active = self.current.active_bank().ok_or(MetadataError::NoValidRecord)?;
        let mut rec = self.current;
        let bank = rec.bank_mut(active);
        bank.boot_count = bank.boot_count.saturating_add(1);
        self.write(&rec)
    }

    /// Reset the active bank's boot counter (boot confirmation).
    pub fn reset_boot_count(&mut self) -> Result<(), MetadataError> {
        let active = self.current.active_bank().ok_or(MetadataError::NoValidRecord)?;
        let mut rec = self.current;
        rec.bank_mut(active).boot_count = 0;
        self.write(&rec)
    }

    /// Record a freshly staged, validated image.
    pub fn mark_bank_valid(
        &mut self,
        bank: Bank,
        crc32: u32,
        size: u32,
        version: &str,
    ) -> Result<(), MetadataError> {
        let mut rec = self.current;
        let status = rec.bank_mut(bank);
        status.crc32 = crc32;
        status.size = size;
        status.valid = BANK_VALID;
        status.boot_count = 0;
        status.set_version(version);
        self.write(&rec)
    }

    /// Invalidate a bank and pin its boot counter so the selector can never
    /// pick it again.
    pub fn mark_bank_invalid(&mut self, bank: Bank) -> Result<(), MetadataError> {
        let mut rec = self.current;
        let status = rec.bank_mut(bank);
        status.valid = BANK_INVALID;
        status.boot_count = MAX_BOOT_ATTEMPTS;
        self.write(&rec)
    }

    pub fn set_update_in_progress(&mut self, target: Bank) -> Result<(), MetadataError> {
        let mut rec = self.current;
        rec.update_in_progress = UPDATE_IN_PROGRESS;
        rec.update_target = target.as_raw();
        self.write(&rec)
    }

    pub fn clear_update_in_progress(&mut self) -> Result<(), MetadataError> {
        let mut rec = self.current;
        rec.update_in_progress = UPDATE_IDLE;
        rec.update_target = BANK_RAW_UNKNOWN;
        self.write(&rec)
    }

    /// Switch to the opposite bank, invalidating the current one.
    ///
    /// Fails without touching flash when the opposite bank is not valid.
    pub fn trigger_rollback(&mut self) -> Result<Bank, MetadataError> {
        let active = self.current.active_bank().ok_or(MetadataError::NoValidRecord)?;
        let new_bank = active.opposite();

        if !self.current.bank(new_bank).is_valid() {
            warn!("cannot rollback, bank {} is invalid", new_bank.name());
            return Err(MetadataError::OppositeBankInvalid);
        }

        let mut rec = self.current;
        {
            let old = rec.bank_mut(active);
            old.valid = BANK_INVALID;
            old.boot_count = MAX_BOOT_ATTEMPTS;
        }
        rec.active_bank = new_bank.as_raw();
        rec.bank_mut(new_bank).boot_count = 0;
        rec.rollback_occurred = ROLLBACK_OCCURRED;
        rec.rollback_count = rec.rollback_count.saturating_add(1);

        info!("rollback: switching to bank {}", new_bank.name());
        self.write(&rec)?;
        Ok(new_bank)
    }

    pub fn did_rollback_occur(&self) -> bool {
        self.current.did_rollback_occur()
    }

    pub fn clear_rollback_flag(&mut self) -> Result<(), MetadataError> {
        let mut rec = self.current;
        rec.rollback_occurred = 0;
        self.write(&rec)
    }

    pub fn bank_info(&self, bank: Bank) -> &BankStatus {
        self.current.bank(bank)
    }
}
