// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! RP2040 board support: real flash device, watchdog reboot, bank jump.
//!
//! Flash erase/program go through the ROM routines with the full XIP
//! teardown/setup sequence:
//!   1. connect_internal_flash()
//!   2. flash_exit_xip()
//!   3. flash_range_erase() or flash_range_program()
//!   4. flash_flush_cache()
//!   5. flash_enter_cmd_xip()
//!
//! Interrupts are masked on the executing core for exactly one sector or
//! page per call, which is what gives the rest of the system its scheduling
//! windows during a long bank erase. On dual-core firmware the second core
//! must additionally be parked outside the XIP window (lockout or RAM
//! execution) for the duration of every mutation.

use rp2040_hal as hal;
use rp2040_hal::fugit::MicrosDurationU32;

use crate::flash::{FlashDevice, FlashError, Watchdog};
use crate::layout::{
    is_page_aligned, is_sector_aligned, Bank, FLASH_BASE, FLASH_PAGE_SIZE, FLASH_SECTOR_SIZE,
    FLASH_TOTAL_SIZE,
};
use crate::manager::{FirmwareManager, UpdateError};

/// SECTOR_ERASE command for flash_range_erase.
const SECTOR_ERASE_CMD: u8 = 0x20;

/// On-chip QSPI flash behind the RP2040 ROM routines.
///
/// Construction is unsafe because the value asserts exclusive mutation
/// rights over the flash for its lifetime; firmware must create exactly one.
pub struct RomFlash {
    _private: (),
}

impl RomFlash {
    /// # Safety
    /// The caller guarantees no other code erases or programs flash while
    /// this value exists, and that core 1 never executes from XIP during
    /// mutations.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl FlashDevice for RomFlash {
    fn capacity(&self) -> u32 {
        FLASH_TOTAL_SIZE
    }

    fn erase_sector(&mut self, offset: u32) -> Result<(), FlashError> {
        if !is_sector_aligned(offset) {
            return Err(FlashError::NotAligned);
        }
        if offset + FLASH_SECTOR_SIZE > FLASH_TOTAL_SIZE {
            return Err(FlashError::OutOfRange);
        }

        cortex_m::interrupt::disable();
        unsafe {
            hal::rom_data::connect_internal_flash();
            hal::rom_data::flash_exit_xip();
            hal::rom_data::flash_range_erase(
                offset,
                FLASH_SECTOR_SIZE as usize,
                FLASH_SECTOR_SIZE,
                SECTOR_ERASE_CMD,
            );
            hal::rom_data::flash_flush_cache();
            hal::rom_data::flash_enter_cmd_xip();
            cortex_m::interrupt::enable();
        }
        Ok(())
    }

    fn program_page(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        if data.len() != FLASH_PAGE_SIZE as usize {
            return Err(FlashError::InvalidParam);
        }
        if !is_page_aligned(offset) {
            return Err(FlashError::NotAligned);
        }
        if offset + FLASH_PAGE_SIZE > FLASH_TOTAL_SIZE {
            return Err(FlashError::OutOfRange);
        }

        cortex_m::interrupt::disable();
        unsafe {
            hal::rom_data::connect_internal_flash();
            hal::rom_data::flash_exit_xip();
            hal::rom_data::flash_range_program(offset, data.as_ptr(), data.len());
            hal::rom_data::flash_flush_cache();
            hal::rom_data::flash_enter_cmd_xip();
            cortex_m::interrupt::enable();
        }
        Ok(())
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        if offset as usize + buf.len() > FLASH_TOTAL_SIZE as usize {
            return Err(FlashError::OutOfRange);
        }
        // XIP window read; no alignment requirement.
        let src = (FLASH_BASE + offset) as *const u8;
        for (i, byte) in buf.iter_mut().enumerate() {
            // SAFETY: range-checked above; the XIP window is always readable.
            *byte = unsafe { src.add(i).read_volatile() };
        }
        Ok(())
    }
}

/// Watchdog pacing through the HAL watchdog.
pub struct HalWatchdog(pub hal::Watchdog);

impl Watchdog for HalWatchdog {
    fn feed(&mut self) {
        self.0.feed();
    }
}

/// Force a reset by arming a short watchdog timeout and spinning into it.
pub fn watchdog_reboot(watchdog: &mut hal::Watchdog) -> ! {
    watchdog.start(MicrosDurationU32::millis(10));
    loop {
        cortex_m::asm::nop();
    }
}

/// Swap the active bank and reboot. Returns only on failure.
pub fn activate_and_reboot<D: FlashDevice, W: Watchdog>(
    manager: &mut FirmwareManager<D, W>,
    watchdog: &mut hal::Watchdog,
) -> Result<core::convert::Infallible, UpdateError> {
    manager.activate()?;
    watchdog_reboot(watchdog)
}

/// Roll back to the opposite bank and reboot. Returns only on failure
/// (opposite bank not valid).
pub fn rollback_and_reboot<D: FlashDevice, W: Watchdog>(
    manager: &mut FirmwareManager<D, W>,
    watchdog: &mut hal::Watchdog,
) -> Result<core::convert::Infallible, UpdateError> {
    manager.rollback()?;
    watchdog_reboot(watchdog)
}

struct VectorTable {
    initial_sp: u32,
    reset_vector: u32,
}

impl VectorTable {
    /// # Safety
    /// `addr` must point at readable memory holding at least two words.
    unsafe fn read_from(addr: u32) -> Self {
        let ptr = addr as *const u32;
        unsafe {
            Self {
                initial_sp: ptr.read_volatile(),
                reset_vector: ptr.offset(1).read_volatile(),
            }
        }
    }

    /// The stack pointer must land in SRAM and the reset vector inside the
    /// bank, with the Thumb bit set.
    fn is_plausible_for(&self, bank: Bank) -> bool {
        const SRAM_START: u32 = 0x2000_0000;
        const SRAM_END: u32 = 0x2004_2000;
        let bank_start = bank.address();
        let bank_end = bank_start + bank.size();

        (SRAM_START..=SRAM_END).contains(&self.initial_sp)
            && self.reset_vector & 1 == 1
            && (bank_start..bank_end).contains(&(self.reset_vector & !1))
    }
}

/// Quick structural check that a bank starts with a sane vector table.
pub fn bank_has_plausible_image(bank: Bank) -> bool {
    let vt = unsafe { VectorTable::read_from(bank.address()) };
    vt.is_plausible_for(bank)
}

/// Hand control to the application in `bank`.
///
/// # Safety
/// The bank must contain a valid image (CRC-checked by the boot selector)
/// whose vector table expects to execute in place at the bank's address.
pub unsafe fn jump_to_bank(bank: Bank) -> ! {
    const SCB_VTOR: *mut u32 = 0xE000_ED08 as *mut u32;

    let vt = unsafe { VectorTable::read_from(bank.address()) };

    cortex_m::interrupt::disable();
    unsafe {
        SCB_VTOR.write_volatile(bank.address());
    }
    cortex_m::asm::dsb();
    cortex_m::asm::isb();

    unsafe {
        core::arch::asm!(
            "msr msp, {sp}",
            "cpsie i",
            "bx {reset}",
            sp = in(reg) vt.initial_sp,
            reset = in(reg) vt.reset_vector,
            options(noreturn)
        );
    }
}
