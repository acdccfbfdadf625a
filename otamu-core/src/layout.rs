// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Flash partition map for the dual-bank update system.
//!
//! The layout is bit-exact with the deployed bootloader ROMs and must never
//! change for a given hardware revision:
//!
//! ```text
//! 0x10000000-0x100000FF  256 B     Boot2 (second-stage bootloader)
//! 0x10000100-0x10003FFF  ~16 KB    OTA bootloader
//! 0x10004000-0x10004FFF  4 KB      Metadata sector 0
//! 0x10005000-0x10005FFF  4 KB      Metadata sector 1
//! 0x10006000-0x100E5FFF  896 KB    Firmware bank A
//! 0x100E6000-0x101C5FFF  896 KB    Firmware bank B
//! 0x101C6000-0x101FFFFF  232 KB    Reserved
//! ```

use serde::Serialize;

// --- Flash characteristics ---

/// Base address of the XIP window.
pub const FLASH_BASE: u32 = 0x1000_0000;
/// Total flash size in bytes.
pub const FLASH_TOTAL_SIZE: u32 = 2 * 1024 * 1024;
/// Erase granularity.
pub const FLASH_SECTOR_SIZE: u32 = 4096;
/// Program granularity.
pub const FLASH_PAGE_SIZE: u32 = 256;

// --- Partition addresses (XIP window) ---

pub const BOOT2_ADDR: u32 = FLASH_BASE;
pub const BOOT2_SIZE: u32 = 256;

pub const BOOTLOADER_ADDR: u32 = 0x1000_0100;
pub const BOOTLOADER_SIZE: u32 = 0x3F00;

pub const METADATA_SECTOR_0_ADDR: u32 = 0x1000_4000;
pub const METADATA_SECTOR_1_ADDR: u32 = 0x1000_5000;
pub const METADATA_SECTOR_SIZE: u32 = FLASH_SECTOR_SIZE;

pub const BANK_A_ADDR: u32 = 0x1000_6000;
pub const BANK_B_ADDR: u32 = 0x100E_6000;
/// Both banks have the same fixed size.
pub const BANK_SIZE: u32 = 896 * 1024;

pub const RESERVED_ADDR: u32 = 0x101C_6000;
pub const RESERVED_SIZE: u32 = 232 * 1024;

// --- Flash-relative offsets (for erase/program, which take offsets) ---

pub const METADATA_SECTOR_0_OFFSET: u32 = METADATA_SECTOR_0_ADDR - FLASH_BASE;
pub const METADATA_SECTOR_1_OFFSET: u32 = METADATA_SECTOR_1_ADDR - FLASH_BASE;
pub const BANK_A_OFFSET: u32 = BANK_A_ADDR - FLASH_BASE;
pub const BANK_B_OFFSET: u32 = BANK_B_ADDR - FLASH_BASE;

/// Sectors per firmware bank.
pub const BANK_SECTOR_COUNT: u32 = BANK_SIZE / FLASH_SECTOR_SIZE;

// The regions must tile the device exactly; a silent gap or overlap here
// would corrupt a neighbouring partition on the next update.
const _: () = assert!(BANK_A_OFFSET % FLASH_SECTOR_SIZE == 0);
const _: () = assert!(BANK_B_OFFSET % FLASH_SECTOR_SIZE == 0);
const _: () = assert!(BANK_SIZE % FLASH_SECTOR_SIZE == 0);
const _: () = assert!(METADATA_SECTOR_0_ADDR + METADATA_SECTOR_SIZE == METADATA_SECTOR_1_ADDR);
const _: () = assert!(METADATA_SECTOR_1_ADDR + METADATA_SECTOR_SIZE == BANK_A_ADDR);
const _: () = assert!(BANK_A_ADDR + BANK_SIZE == BANK_B_ADDR);
const _: () = assert!(BANK_B_ADDR + BANK_SIZE == RESERVED_ADDR);
const _: () = assert!(RESERVED_ADDR + RESERVED_SIZE == FLASH_BASE + FLASH_TOTAL_SIZE);

// --- Alignment helpers ---

pub const fn is_sector_aligned(value: u32) -> bool {
    value & (FLASH_SECTOR_SIZE - 1) == 0
}

pub const fn is_page_aligned(value: u32) -> bool {
    value & (FLASH_PAGE_SIZE - 1) == 0
}

/// Round `value` up to the next page boundary.
pub const fn page_align_up(value: u32) -> u32 {
    (value + FLASH_PAGE_SIZE - 1) & !(FLASH_PAGE_SIZE - 1)
}

/// Round `value` up to the next sector boundary.
pub const fn sector_align_up(value: u32) -> u32 {
    (value + FLASH_SECTOR_SIZE - 1) & !(FLASH_SECTOR_SIZE - 1)
}

/// Flash-relative offset of a metadata sector (0 or 1).
pub const fn metadata_sector_offset(index: usize) -> u32 {
    if index == 0 {
        METADATA_SECTOR_0_OFFSET
    } else {
        METADATA_SECTOR_1_OFFSET
    }
}

// --- Firmware banks ---

/// Raw on-flash encoding for "no bank" (erased flash reads as 0xFF).
pub const BANK_RAW_UNKNOWN: u8 = 0xFF;

/// One of the two equally sized application-image regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum Bank {
    A = 0,
    B = 1,
}

impl Bank {
    /// The other bank.
    pub const fn opposite(self) -> Self {
        match self {
            Bank::A => Bank::B,
            Bank::B => Bank::A,
        }
    }

    /// Absolute XIP address of the bank's first byte.
    pub const fn address(self) -> u32 {
        match self {
            Bank::A => BANK_A_ADDR,
            Bank::B => BANK_B_ADDR,
        }
    }

    /// Flash-relative offset of the bank's first byte.
    pub const fn offset(self) -> u32 {
        match self {
            Bank::A => BANK_A_OFFSET,
            Bank::B => BANK_B_OFFSET,
        }
    }

    /// Bank capacity in bytes.
    pub const fn size(self) -> u32 {
        BANK_SIZE
    }

    /// The byte stored in the metadata record.
    pub const fn as_raw(self) -> u8 {
        self as u8
    }

    /// Decode a metadata byte. Anything other than 0/1 (notably the erased
    /// value 0xFF) has no bank.
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Bank::A),
            1 => Some(Bank::B),
            _ => None,
        }
    }

    /// Short name for log output.
    pub const fn name(self) -> &'static str {
        match self {
            Bank::A => "A",
            Bank::B => "B",
        }
    }
}
