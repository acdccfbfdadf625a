// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Early-boot bank selection with automatic rollback.
//!
//! Runs single-threaded before the scheduler starts. The selector never
//! invents metadata: if neither sector validates it halts, leaving the
//! hard-fault indication to the board code. Each selected boot costs one
//! attempt; the application pays it back via `confirm_boot` once healthy.

use log::{info, warn};

use crate::flash::{FlashDevice, FlashError, Watchdog};
use crate::layout::Bank;
use crate::metadata::{MetadataError, MetadataStore, MAX_BOOT_ATTEMPTS};

/// Why the selector refused to boot anything.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HaltReason {
    /// Neither metadata sector holds a valid record.
    NoValidMetadata,
    /// No bank is left that is valid, under its attempt budget and passes
    /// its CRC check.
    NoBootableImage,
}

/// Outcome of bank selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootDecision {
    /// Jump to the application at `address` (the bank's first byte).
    Boot { bank: Bank, address: u32 },
    Halt(HaltReason),
}

/// Select the bank to boot, applying the rollback rules and charging one
/// boot attempt to the chosen bank.
///
/// The store must come from [`MetadataStore::try_load`]; a caller that could
/// not load metadata at all should halt with
/// [`HaltReason::NoValidMetadata`].
pub fn select_boot_bank<D: FlashDevice, W: Watchdog>(
    store: &mut MetadataStore<D, W>,
) -> Result<BootDecision, MetadataError> {
    let Some(active) = store.current().active_bank() else {
        return Ok(BootDecision::Halt(HaltReason::NoValidMetadata));
    };

    let mut bank = active;

    // An invalid active bank (interrupted activation, explicit invalidation)
    // falls over to the opposite bank without rollback bookkeeping.
    if !store.current().bank(bank).is_valid() {
        let opposite = bank.opposite();
        if !store.current().bank(opposite).is_valid() {
            return Ok(BootDecision::Halt(HaltReason::NoBootableImage));
        }
        warn!("active bank {} invalid, switching to {}", bank.name(), opposite.name());
        store.set_active_bank(opposite)?;
        bank = opposite;
    }

    // Two passes at most: the second one runs after a CRC failure demoted
    // the first choice.
    for _ in 0..2 {
        if store.current().bank(bank).boot_count >= MAX_BOOT_ATTEMPTS {
            if !store.current().bank(bank.opposite()).is_valid() {
                warn!("bank {} exhausted its boot attempts, no fallback", bank.name());
                return Ok(BootDecision::Halt(HaltReason::NoBootableImage));
            }
            warn!("bank {} exhausted its boot attempts, rolling back", bank.name());
            bank = store.trigger_rollback()?;
        }

        store.increment_boot_count()?;

        let status = *store.current().bank(bank);
        let (image_crc, image_size) = (status.crc32, status.size);
        if image_size == 0 {
            // Factory image with no recorded size; nothing to checksum.
            info!("booting bank {} (no recorded image metadata)", bank.name());
            return Ok(BootDecision::Boot { bank, address: bank.address() });
        }

        match store.flash_mut().validate_firmware(bank, image_crc, image_size) {
            Ok(_) => {
                let attempts = status.boot_count;
                info!(
                    "booting bank {} ({image_size} bytes, attempt {attempts})",
                    bank.name()
                );
                return Ok(BootDecision::Boot { bank, address: bank.address() });
            }
            Err(FlashError::CrcMismatch) | Err(FlashError::InvalidParam) => {
                // The stored image no longer matches its metadata; demote the
                // bank and retry through the rollback path.
                warn!("bank {} failed image validation", bank.name());
                store.mark_bank_invalid(bank)?;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(BootDecision::Halt(HaltReason::NoBootableImage))
}
