// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Sector/page flash operations with alignment, bounds and watchdog discipline.
//!
//! [`FlashDevice`] is the hardware seam: one sector erase, one page program,
//! plain reads. Everything above it (region erases, multi-page writes,
//! verification, CRC streaming) lives in [`FlashOps`] and is identical on
//! the device and in host tests against the simulator.
//!
//! Erase and program calls are expected to mask interrupts for exactly one
//! sector/page at a time; `FlashOps` iterates unit by unit so interrupts get
//! a window between units and the watchdog stays fed during long operations.

use crc::{Crc, CRC_32_ISO_HDLC};
use log::{error, info};

use crate::layout::{
    is_page_aligned, is_sector_aligned, Bank, BANK_A_OFFSET, FLASH_PAGE_SIZE, FLASH_SECTOR_SIZE,
    FLASH_TOTAL_SIZE,
};

/// CRC-32 (reflected 0x04C11DB7, init/xorout 0xFFFFFFFF), the ZIP/PNG/
/// Ethernet polynomial, used for both image and metadata integrity.
pub(crate) static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Feed the watchdog every this many erased sectors (~1 s worst case).
const ERASE_FEED_INTERVAL_SECTORS: u32 = 10;
/// Feed the watchdog every this many programmed pages (4 KiB).
const WRITE_FEED_INTERVAL_PAGES: u32 = 16;
/// Feed the watchdog every this many checksummed bytes.
const CRC_FEED_INTERVAL_BYTES: u32 = 16 * 1024;

/// Tagged result for every flash operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashError {
    InvalidParam,
    NotAligned,
    OutOfRange,
    VerifyFailed,
    CrcMismatch,
    Timeout,
}

impl FlashError {
    /// Stable description for log and REST error messages.
    pub const fn as_str(self) -> &'static str {
        match self {
            FlashError::InvalidParam => "invalid parameter",
            FlashError::NotAligned => "address/size not aligned",
            FlashError::OutOfRange => "out of range",
            FlashError::VerifyFailed => "verification failed",
            FlashError::CrcMismatch => "CRC mismatch",
            FlashError::Timeout => "operation timeout",
        }
    }
}

impl core::fmt::Display for FlashError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimal hardware contract for a NOR flash in an XIP window.
///
/// Offsets are flash-relative (0 = first byte of the device). Implementations
/// must mask interrupts on the executing core for the duration of each erase
/// and program call.
pub trait FlashDevice {
    /// Total addressable size in bytes.
    fn capacity(&self) -> u32;

    /// Erase one sector. `offset` must be sector-aligned.
    fn erase_sector(&mut self, offset: u32) -> Result<(), FlashError>;

    /// Program one page. `offset` must be page-aligned and `data` exactly
    /// [`FLASH_PAGE_SIZE`] bytes. Programming can only clear bits; the page
    /// must have been erased first.
    fn program_page(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Read `buf.len()` bytes starting at `offset`. No alignment requirement.
    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError>;
}

impl<T: FlashDevice + ?Sized> FlashDevice for &mut T {
    fn capacity(&self) -> u32 {
        (**self).capacity()
    }

    fn erase_sector(&mut self, offset: u32) -> Result<(), FlashError> {
        (**self).erase_sector(offset)
    }

    fn program_page(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        (**self).program_page(offset, data)
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        (**self).read(offset, buf)
    }
}

/// Watchdog pacing hook for long-running flash operations.
pub trait Watchdog {
    fn feed(&mut self);
}

/// No watchdog configured (host tests, early boot).
#[derive(Default)]
pub struct NoWatchdog;

impl Watchdog for NoWatchdog {
    fn feed(&mut self) {}
}

impl<T: Watchdog + ?Sized> Watchdog for &mut T {
    fn feed(&mut self) {
        (**self).feed()
    }
}

/// Validated flash operations over a [`FlashDevice`].
pub struct FlashOps<D, W = NoWatchdog> {
    device: D,
    watchdog: W,
}

impl<D: FlashDevice> FlashOps<D, NoWatchdog> {
    pub fn new(device: D) -> Self {
        Self::with_watchdog(device, NoWatchdog)
    }
}

impl<D: FlashDevice, W: Watchdog> FlashOps<D, W> {
    pub fn with_watchdog(device: D, watchdog: W) -> Self {
        Self { device, watchdog }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn into_device(self) -> D {
        self.device
    }

    /// Erase a sector-aligned region inside the application banks.
    ///
    /// The bootloader and metadata sectors are protected from this path: any
    /// offset below the start of bank A is rejected as out of range.
    pub fn erase_region(&mut self, offset: u32, size: u32) -> Result<(), FlashError> {
        if size == 0 {
            return Err(FlashError::InvalidParam);
        }
        if !is_sector_aligned(offset) || !is_sector_aligned(size) {
            error!("erase offset/size not sector-aligned: {offset:#010x}+{size:#x}");
            return Err(FlashError::NotAligned);
        }
        if offset.checked_add(size).is_none_or(|end| end > FLASH_TOTAL_SIZE) {
            error!("erase range out of bounds: {offset:#010x}+{size:#x}");
            return Err(FlashError::OutOfRange);
        }
        if offset < BANK_A_OFFSET {
            error!("attempt to erase protected region: {offset:#010x}");
            return Err(FlashError::OutOfRange);
        }

        let sectors = size / FLASH_SECTOR_SIZE;
        info!("erasing flash: offset={offset:#010x} size={size:#x} ({sectors} sectors)");

        for i in 0..sectors {
            self.device.erase_sector(offset + i * FLASH_SECTOR_SIZE)?;
            if i % ERASE_FEED_INTERVAL_SECTORS == 0 {
                self.watchdog.feed();
            }
        }

        Ok(())
    }

    /// Erase an entire firmware bank.
    pub fn erase_bank(&mut self, bank: Bank) -> Result<(), FlashError> {
        info!("erasing firmware bank {}", bank.name());
        self.erase_region(bank.offset(), bank.size())
    }

    /// Program a page-aligned, page-multiple run of bytes.
    ///
    /// Callers streaming an odd-sized image must pad the final chunk to a
    /// page boundary with 0xFF before calling.
    pub fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        if data.is_empty() {
            return Err(FlashError::InvalidParam);
        }
        let size = data.len() as u32;
        if !is_page_aligned(offset) || !is_page_aligned(size) {
            error!("write offset/size not page-aligned: {offset:#010x}+{size:#x}");
            return Err(FlashError::NotAligned);
        }
        if offset.checked_add(size).is_none_or(|end| end > FLASH_TOTAL_SIZE) {
            error!("write range out of bounds: {offset:#010x}+{size:#x}");
            return Err(FlashError::OutOfRange);
        }

        for (i, page) in data.chunks_exact(FLASH_PAGE_SIZE as usize).enumerate() {
            self.device
                .program_page(offset + i as u32 * FLASH_PAGE_SIZE, page)?;
            if i as u32 % WRITE_FEED_INTERVAL_PAGES == 0 {
                self.watchdog.feed();
            }
        }

        Ok(())
    }

    /// Program and then compare against the same buffer.
    pub fn write_and_verify(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        self.write(offset, data)?;
        self.verify(offset, data)
    }

    /// Read out of the XIP window. No alignment requirement.
    pub fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        if buf.is_empty() {
            return Err(FlashError::InvalidParam);
        }
        if (offset as u64) + buf.len() as u64 > FLASH_TOTAL_SIZE as u64 {
            return Err(FlashError::OutOfRange);
        }
        self.device.read(offset, buf)
    }

    /// Compare flash contents against `expected`, reporting the first
    /// differing byte.
    pub fn verify(&self, offset: u32, expected: &[u8]) -> Result<(), FlashError> {
        if expected.is_empty() {
            return Err(FlashError::InvalidParam);
        }
        if (offset as u64) + expected.len() as u64 > FLASH_TOTAL_SIZE as u64 {
            return Err(FlashError::OutOfRange);
        }

        let mut chunk = [0u8; FLASH_PAGE_SIZE as usize];
        for (base, want) in expected.chunks(chunk.len()).enumerate() {
            let pos = base * chunk.len();
            let got = &mut chunk[..want.len()];
            self.device.read(offset + pos as u32, got)?;
            if got != want {
                if let Some(i) = got.iter().zip(want).position(|(g, w)| g != w) {
                    error!(
                        "verify failed at {:#010x}: expected {:#04x}, got {:#04x}",
                        offset + (pos + i) as u32,
                        want[i],
                        got[i]
                    );
                }
                return Err(FlashError::VerifyFailed);
            }
        }

        Ok(())
    }

    /// Stream a CRC-32 over a flash region.
    pub fn calculate_crc32(&mut self, offset: u32, size: u32) -> Result<u32, FlashError> {
        if size == 0 {
            return Err(FlashError::InvalidParam);
        }
        if offset.checked_add(size).is_none_or(|end| end > FLASH_TOTAL_SIZE) {
            return Err(FlashError::OutOfRange);
        }

        let mut digest = CRC32.digest();
        let mut chunk = [0u8; FLASH_PAGE_SIZE as usize];
        let mut processed: u32 = 0;

        while processed < size {
            let n = (size - processed).min(chunk.len() as u32) as usize;
            self.device.read(offset + processed, &mut chunk[..n])?;
            digest.update(&chunk[..n]);
            processed += n as u32;

            if processed % CRC_FEED_INTERVAL_BYTES == 0 {
                self.watchdog.feed();
            }
        }

        Ok(digest.finalize())
    }

    /// Check a bank's image against an expected size and CRC-32.
    ///
    /// Returns the actual CRC on success so callers can record it.
    pub fn validate_firmware(
        &mut self,
        bank: Bank,
        expected_crc32: u32,
        expected_size: u32,
    ) -> Result<u32, FlashError> {
        if expected_size == 0 || expected_size > bank.size() {
            error!(
                "firmware size {} invalid for bank {} ({} bytes)",
                expected_size,
                bank.name(),
                bank.size()
            );
            return Err(FlashError::InvalidParam);
        }

        let actual = self.calculate_crc32(bank.offset(), expected_size)?;
        if actual != expected_crc32 {
            error!(
                "bank {} CRC mismatch: expected {expected_crc32:#010x}, got {actual:#010x}",
                bank.name()
            );
            return Err(FlashError::CrcMismatch);
        }

        Ok(actual)
    }
}
