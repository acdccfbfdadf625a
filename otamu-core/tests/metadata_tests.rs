// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Metadata store tests: record layout, double-buffered atomic writes,
//! power-loss recovery and the mutator set.

use core::mem::offset_of;

use crc::{Crc, CRC_32_ISO_HDLC};
use otamu_core::flash::FlashOps;
use otamu_core::layout::{metadata_sector_offset, Bank};
use otamu_core::metadata::{
    BankStatus, MetadataError, MetadataRecord, MetadataStore, BANK_INVALID, BANK_VALID,
    MAX_BOOT_ATTEMPTS, METADATA_RECORD_SIZE,
};
use otamu_core::sim::SimFlash;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

fn fresh_store() -> MetadataStore<SimFlash> {
    MetadataStore::init(FlashOps::new(SimFlash::new())).expect("init on erased flash")
}

fn read_raw_sector(store: &MetadataStore<SimFlash>, index: usize) -> MetadataRecord {
    let mut buf = [0u8; METADATA_RECORD_SIZE];
    store
        .flash()
        .read(metadata_sector_offset(index), &mut buf)
        .unwrap();
    MetadataRecord::from_bytes(&buf).unwrap()
}

// =============================================================================
// Record byte layout (persistence contract)
// =============================================================================

#[test]
fn test_record_size_is_pinned() {
    assert_eq!(METADATA_RECORD_SIZE, 244);
    assert_eq!(core::mem::size_of::<BankStatus>(), 44);
}

#[test]
fn test_record_field_offsets_are_pinned() {
    assert_eq!(offset_of!(MetadataRecord, magic), 0);
    assert_eq!(offset_of!(MetadataRecord, version), 4);
    assert_eq!(offset_of!(MetadataRecord, sequence), 8);
    assert_eq!(offset_of!(MetadataRecord, active_bank), 12);
    assert_eq!(offset_of!(MetadataRecord, bank_a), 16);
    assert_eq!(offset_of!(MetadataRecord, bank_b), 60);
    assert_eq!(offset_of!(MetadataRecord, update_in_progress), 104);
    assert_eq!(offset_of!(MetadataRecord, update_target), 105);
    assert_eq!(offset_of!(MetadataRecord, rollback_occurred), 108);
    assert_eq!(offset_of!(MetadataRecord, rollback_count), 109);
    assert_eq!(offset_of!(MetadataRecord, reserved), 112);
    assert_eq!(offset_of!(MetadataRecord, record_crc32), 240);

    assert_eq!(offset_of!(BankStatus, crc32), 0);
    assert_eq!(offset_of!(BankStatus, size), 4);
    assert_eq!(offset_of!(BankStatus, version), 8);
    assert_eq!(offset_of!(BankStatus, boot_count), 40);
    assert_eq!(offset_of!(BankStatus, valid), 41);
}

#[test]
fn test_record_is_little_endian_on_flash() {
    let store = fresh_store();
    let mut magic = [0u8; 4];
    store
        .flash()
        .read(metadata_sector_offset(0), &mut magic)
        .unwrap();
    // 0x4F544D55 ("OTMU") little-endian.
    assert_eq!(magic, [0x55, 0x4D, 0x54, 0x4F]);
}

#[test]
fn test_record_crc_covers_all_but_last_field() {
    let rec = MetadataRecord::factory_defaults(Bank::A);
    let expected = CRC32.checksum(&rec.as_bytes()[..METADATA_RECORD_SIZE - 4]);
    let stored = rec.record_crc32;
    assert_eq!(stored, expected);
    assert!(rec.is_valid());
}

#[test]
fn test_validation_rejects_bad_magic_version_crc_and_bank() {
    let good = MetadataRecord::factory_defaults(Bank::A);

    let mut bad = good;
    bad.magic = 0x1234_5678;
    assert!(!bad.is_valid());

    let mut bad = good;
    bad.version = 99;
    bad.refresh_crc();
    assert!(!bad.is_valid());

    let mut bad = good;
    bad.sequence = 7; // stale CRC
    assert!(!bad.is_valid());

    let mut bad = good;
    bad.active_bank = 0xFF;
    bad.refresh_crc();
    assert!(!bad.is_valid());
}

#[test]
fn test_erased_sector_is_not_a_valid_record() {
    let erased = [0xFFu8; METADATA_RECORD_SIZE];
    let rec = MetadataRecord::from_bytes(&erased).unwrap();
    // All-0xFF decodes as "valid flags everywhere" by value, which is exactly
    // why the magic check must reject it.
    assert!(!rec.is_valid());
}

// =============================================================================
// Cold start (both sectors erased)
// =============================================================================

#[test]
fn test_cold_start_writes_defaults_to_both_sectors() {
    let store = fresh_store();

    let rec0 = read_raw_sector(&store, 0);
    let rec1 = read_raw_sector(&store, 1);
    assert!(rec0.is_valid());
    assert!(rec1.is_valid());

    let (seq0, seq1) = (rec0.sequence, rec1.sequence);
    assert_eq!(seq0, 1);
    assert_eq!(seq1, 2);

    // The cached record is the higher-sequence copy.
    let current_seq = store.current().sequence;
    assert_eq!(current_seq, 2);
    assert_eq!(store.current().active_bank(), Some(Bank::A));
    let (a_valid, b_valid) = (store.current().bank_a.valid, store.current().bank_b.valid);
    assert_eq!(a_valid, BANK_VALID);
    assert_eq!(b_valid, BANK_INVALID);
    assert_eq!(store.current().bank(Bank::A).version_str(), "factory");
}

#[test]
fn test_try_load_fails_on_erased_flash() {
    let result = MetadataStore::try_load(FlashOps::new(SimFlash::new()));
    assert!(matches!(result, Err(MetadataError::NoValidRecord)));
}

#[test]
fn test_try_load_succeeds_after_init() {
    let store = fresh_store();
    let flash = store.into_flash();
    let store = MetadataStore::try_load(flash).expect("both sectors valid");
    let seq = store.current().sequence;
    assert_eq!(seq, 2);
}

// =============================================================================
// Atomic double-buffered writes
// =============================================================================

#[test]
fn test_write_targets_lower_sequence_sector() {
    let mut store = fresh_store();
    // Sector 0 holds seq 1, sector 1 holds seq 2; the next write must land
    // in sector 0.
    store.set_active_bank(Bank::A).unwrap();

    let rec0 = read_raw_sector(&store, 0);
    let rec1 = read_raw_sector(&store, 1);
    let (seq0, seq1) = (rec0.sequence, rec1.sequence);
    assert_eq!(seq0, 3);
    assert_eq!(seq1, 2);

    // And the one after that in sector 1.
    store.set_active_bank(Bank::A).unwrap();
    let rec1 = read_raw_sector(&store, 1);
    let seq1 = rec1.sequence;
    assert_eq!(seq1, 4);
}

#[test]
fn test_sequence_is_strictly_monotone() {
    let mut store = fresh_store();
    let mut last = store.current().sequence;
    for _ in 0..7 {
        store.increment_boot_count().unwrap();
        let seq = store.current().sequence;
        assert!(seq > last);
        last = seq;
    }
}

#[test]
fn test_write_read_roundtrip_is_bit_exact() {
    let mut store = fresh_store();
    store
        .mark_bank_valid(Bank::B, 0xDEAD_BEEF, 400_000, "v2.1")
        .unwrap();

    let expected = *store.current();
    let flash = store.into_flash();
    let store = MetadataStore::try_load(flash).unwrap();
    assert_eq!(store.current().as_bytes(), expected.as_bytes());
}

#[test]
fn test_power_loss_after_erase_preserves_other_sector() {
    let mut store = fresh_store();

    // Advance to sector 0 = seq 5, sector 1 = seq 6.
    for _ in 0..4 {
        store.set_active_bank(Bank::A).unwrap();
    }
    let rec0 = read_raw_sector(&store, 0);
    let rec1 = read_raw_sector(&store, 1);
    let (seq0, seq1) = (rec0.sequence, rec1.sequence);
    assert_eq!(seq0, 5);
    assert_eq!(seq1, 6);
    let survivor = rec1;

    // The next write targets sector 0. Let the erase succeed, then kill
    // power before any page program.
    store.flash_mut().device_mut().power_loss_after(1);
    let result = store.increment_boot_count();
    assert!(result.is_err());

    // Reboot: sector 0 is erased (invalid magic), sector 1 untouched.
    let mut flash = store.into_flash();
    flash.device_mut().power_cycle();
    let store = MetadataStore::try_load(flash).expect("sector 1 still valid");

    let current_seq = store.current().sequence;
    assert_eq!(current_seq, 6);
    assert_eq!(store.current().as_bytes(), survivor.as_bytes());

    let rec0 = read_raw_sector(&store, 0);
    assert!(!rec0.is_valid());
}

#[test]
fn test_power_loss_mid_write_preserves_other_sector() {
    let mut store = fresh_store();
    let before = *store.current();

    // The target-sector erase succeeds; the record page never lands.
    store.flash_mut().device_mut().power_loss_after(1);
    assert!(store.set_active_bank(Bank::B).is_err());

    let mut flash = store.into_flash();
    flash.device_mut().power_cycle();
    let store = MetadataStore::try_load(flash).expect("one sector survives");
    assert_eq!(store.current().as_bytes(), before.as_bytes());
    assert_eq!(store.current().active_bank(), Some(Bank::A));
}

#[test]
fn test_corrupted_winner_falls_back_to_other_sector() {
    let store = fresh_store();
    let loser = read_raw_sector(&store, 0);

    let mut flash = store.into_flash();
    // Sector 1 holds the higher sequence; flip one byte in it.
    flash
        .device_mut()
        .corrupt_byte(metadata_sector_offset(1) + 20, 0xAA);

    let store = MetadataStore::try_load(flash).expect("sector 0 still valid");
    assert_eq!(store.current().as_bytes(), loser.as_bytes());
}

#[test]
fn test_both_sectors_corrupted_reinitializes_defaults() {
    fn corrupted_flash() -> FlashOps<SimFlash> {
        let store = fresh_store();
        let mut flash = store.into_flash();
        flash.device_mut().corrupt_byte(metadata_sector_offset(0) + 3, 0x00);
        flash.device_mut().corrupt_byte(metadata_sector_offset(1) + 3, 0x00);
        flash
    }

    // The boot path refuses to invent metadata.
    assert!(MetadataStore::try_load(corrupted_flash()).is_err());

    // The application path recovers by rewriting factory defaults.
    let store = MetadataStore::init(corrupted_flash()).expect("defaults rewritten");
    assert!(store.current().is_valid());
    let seq = store.current().sequence;
    assert_eq!(seq, 2);
    assert_eq!(store.current().active_bank(), Some(Bank::A));
}

// =============================================================================
// Mutators
// =============================================================================

#[test]
fn test_boot_count_increment_and_reset() {
    let mut store = fresh_store();
    store.increment_boot_count().unwrap();
    store.increment_boot_count().unwrap();
    let count = store.current().bank(Bank::A).boot_count;
    assert_eq!(count, 2);

    store.reset_boot_count().unwrap();
    let count = store.current().bank(Bank::A).boot_count;
    assert_eq!(count, 0);
}

#[test]
fn test_mark_bank_valid_records_image_details() {
    let mut store = fresh_store();
    store
        .mark_bank_valid(Bank::B, 0xCAFE_F00D, 123_456, "v3.0-rc1")
        .unwrap();

    let status = store.current().bank(Bank::B);
    let (crc, size, valid, count) = (status.crc32, status.size, status.valid, status.boot_count);
    assert_eq!(crc, 0xCAFE_F00D);
    assert_eq!(size, 123_456);
    assert_eq!(valid, BANK_VALID);
    assert_eq!(count, 0);
    assert_eq!(status.version_str(), "v3.0-rc1");
}

#[test]
fn test_mark_bank_valid_is_idempotent_except_sequence() {
    let mut store = fresh_store();
    store
        .mark_bank_valid(Bank::B, 0xDEAD_BEEF, 400_000, "v2")
        .unwrap();
    let first = *store.current();

    store
        .mark_bank_valid(Bank::B, 0xDEAD_BEEF, 400_000, "v2")
        .unwrap();
    let second = *store.current();

    let (seq1, seq2) = (first.sequence, second.sequence);
    assert_eq!(seq2, seq1 + 1);
    // Everything between the header and the CRC is unchanged.
    assert_eq!(
        &first.as_bytes()[12..METADATA_RECORD_SIZE - 4],
        &second.as_bytes()[12..METADATA_RECORD_SIZE - 4]
    );
}

#[test]
fn test_mark_bank_invalid_pins_boot_count() {
    let mut store = fresh_store();
    store.mark_bank_invalid(Bank::A).unwrap();

    let status = store.current().bank(Bank::A);
    let (valid, count) = (status.valid, status.boot_count);
    assert_eq!(valid, BANK_INVALID);
    assert_eq!(count, MAX_BOOT_ATTEMPTS);
}

#[test]
fn test_update_in_progress_roundtrip_leaves_banks_untouched() {
    let mut store = fresh_store();
    let before = *store.current();

    store.set_update_in_progress(Bank::B).unwrap();
    assert!(store.current().is_update_in_progress());
    assert_eq!(store.current().update_target(), Some(Bank::B));

    store.clear_update_in_progress().unwrap();
    let after = *store.current();
    assert!(!after.is_update_in_progress());
    assert_eq!(after.update_target(), None);

    // Bank metadata identical to the pre-call state; only the sequence (and
    // therefore the CRC) moved.
    let bank_range = offset_of!(MetadataRecord, bank_a)..offset_of!(MetadataRecord, bank_b) + 44;
    assert_eq!(
        &before.as_bytes()[bank_range.clone()],
        &after.as_bytes()[bank_range]
    );
}

// =============================================================================
// Rollback
// =============================================================================

#[test]
fn test_trigger_rollback_switches_and_invalidates() {
    let mut store = fresh_store();
    store
        .mark_bank_valid(Bank::B, 0xDEAD_BEEF, 1000, "v2")
        .unwrap();

    let new_bank = store.trigger_rollback().unwrap();
    assert_eq!(new_bank, Bank::B);

    let rec = store.current();
    assert_eq!(rec.active_bank(), Some(Bank::B));
    assert!(rec.did_rollback_occur());
    let (a_valid, a_count, b_count, rb_count) = (
        rec.bank_a.valid,
        rec.bank_a.boot_count,
        rec.bank_b.boot_count,
        rec.rollback_count,
    );
    assert_eq!(a_valid, BANK_INVALID);
    assert_eq!(a_count, MAX_BOOT_ATTEMPTS);
    assert_eq!(b_count, 0);
    assert_eq!(rb_count, 1);
}

#[test]
fn test_trigger_rollback_fails_when_opposite_invalid() {
    let mut store = fresh_store();
    let before_seq = store.current().sequence;

    // Factory state: bank B invalid.
    assert_eq!(
        store.trigger_rollback(),
        Err(MetadataError::OppositeBankInvalid)
    );

    // Nothing was written.
    let seq = store.current().sequence;
    assert_eq!(seq, before_seq);
    assert_eq!(store.current().active_bank(), Some(Bank::A));
}

#[test]
fn test_rollback_flag_is_one_shot() {
    let mut store = fresh_store();
    store
        .mark_bank_valid(Bank::B, 0xDEAD_BEEF, 1000, "v2")
        .unwrap();
    store.trigger_rollback().unwrap();

    assert!(store.did_rollback_occur());
    store.clear_rollback_flag().unwrap();
    assert!(!store.did_rollback_occur());

    // The rollback counter keeps its history.
    let count = store.current().rollback_count;
    assert_eq!(count, 1);
}

// =============================================================================
// Invariants across a mutation storm
// =============================================================================

#[test]
fn test_at_least_one_sector_valid_after_any_write_sequence() {
    let mut store = fresh_store();
    store
        .mark_bank_valid(Bank::B, 0x1111_2222, 2048, "v9")
        .unwrap();

    for i in 0..10 {
        match i % 4 {
            0 => store.increment_boot_count().unwrap(),
            1 => store.set_update_in_progress(Bank::B).unwrap(),
            2 => store.clear_update_in_progress().unwrap(),
            _ => store.reset_boot_count().unwrap(),
        }

        let rec0 = read_raw_sector(&store, 0);
        let rec1 = read_raw_sector(&store, 1);
        assert!(rec0.is_valid() || rec1.is_valid());

        // The cached record always matches the higher-sequence valid sector.
        let winner = match (rec0.is_valid(), rec1.is_valid()) {
            (true, true) => {
                let (s0, s1) = (rec0.sequence, rec1.sequence);
                if s0 > s1 {
                    rec0
                } else {
                    rec1
                }
            }
            (true, false) => rec0,
            _ => rec1,
        };
        assert_eq!(store.current().as_bytes(), winner.as_bytes());
    }
}
