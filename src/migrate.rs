//! C4: Schema Migrator.
//!
//! Reconciles a record read back under some older on-flash version with
//! the current schema (§4.3): newer presence bits an old record never
//! wrote must be treated as absent rather than as whatever stale bytes
//! happen to follow it, the legacy single-byte PIN-failure counter is
//! folded into the PIN-fail area's bit-clearing scheme, and a mnemonic
//! that predates the U2F root field is staged for recomputation.
//!
//! Grounded on `storage_from_flash`'s version cascade in the original
//! firmware, re-expressed as a pure function over `StorageRecord` plus a
//! plan the caller (`StorageCore::init`) carries out against the flash
//! and counter areas it alone has a handle to.

use crate::error::{Error, Result};
use crate::record::StorageRecord;

/// What `StorageCore::init` still needs to do after `migrate` returns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MigrationOutcome {
    /// The record's version no longer matches the current one: a commit
    /// must be issued to persist the migrated record under the current
    /// version.
    pub needs_recommit: bool,
    /// `has_mnemonic` should be re-staged on the next commit so the
    /// committer recomputes `u2froot` (versions predating its
    /// introduction never computed it).
    pub recompute_u2froot: bool,
    /// If set, the PIN area's sector must be erased and this wait-word
    /// programmed at its start, converting the legacy small-integer
    /// failure counter into the current bit-clearing encoding.
    pub legacy_pin_wait: Option<u32>,
}

/// Versions at and below which a given field was not yet part of the
/// schema (§4.3's table, newest-first).
const V_IMPORTED: u32 = 2;
const V_HOMESCREEN: u32 = 5;
const V_U2F_COUNTER: u32 = 7;
const V_FLAGS: u32 = 8;
const V_U2FROOT: u32 = 9;
const V_LEGACY_PIN_CUTOFF: u32 = 5;

/// Clear presence bits (and their payloads) for every field introduced
/// after `stored_version`, and work out what else migration requires.
/// `legacy_pin_failed_attempts` is `rom.pin_failed_attempts` as decoded
/// from the flash image, if `rom.has_pin_failed_attempts` was set (the
/// caller reads this straight off the decoded record, since current
/// commits never populate it); pass `None` if the boot record is
/// already current.
pub fn migrate(
    rom: &mut StorageRecord,
    stored_version: u32,
    current_version: u32,
    legacy_pin_failed_attempts: Option<u32>,
) -> Result<MigrationOutcome> {
    if stored_version > current_version {
        return Err(Error::DowngradeDetected);
    }

    if stored_version <= V_IMPORTED {
        rom.has_imported = false;
        rom.imported = false;
    }
    if stored_version <= V_HOMESCREEN {
        rom.has_homescreen = false;
        rom.homescreen = Default::default();
    }
    if stored_version <= V_U2F_COUNTER {
        rom.has_u2f_counter = false;
        rom.u2f_counter = 0;
    }
    if stored_version <= V_FLAGS {
        rom.has_needs_backup = false;
        rom.needs_backup = false;
        rom.has_flags = false;
        rom.flags = 0;
    }
    if stored_version <= V_U2FROOT {
        rom.has_u2froot = false;
        rom.u2froot = Default::default();
    }

    let legacy_pin_wait = if stored_version <= V_LEGACY_PIN_CUTOFF {
        let pinctr = legacy_pin_failed_attempts.unwrap_or(0).min(31);
        rom.has_pin_failed_attempts = false;
        rom.pin_failed_attempts = 0;
        Some(0xFFFF_FFFFu32 << pinctr)
    } else {
        None
    };

    let recompute_u2froot = stored_version < V_U2FROOT && rom.has_mnemonic;

    Ok(MigrationOutcome {
        needs_recommit: stored_version != current_version,
        recompute_u2froot,
        legacy_pin_wait,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::STORAGE_VERSION;

    fn populated_rom() -> StorageRecord {
        let mut rec = StorageRecord::default();
        rec.has_mnemonic = true;
        rec.mnemonic.set("abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about");
        rec.has_imported = true;
        rec.imported = true;
        rec.has_homescreen = true;
        rec.homescreen.set(&[1u8; 10]);
        rec.has_u2f_counter = true;
        rec.u2f_counter = 7;
        rec.has_flags = true;
        rec.flags = 0x5;
        rec.has_u2froot = true;
        rec
    }

    #[test]
    fn downgrade_is_rejected() {
        let mut rom = populated_rom();
        let err = migrate(&mut rom, STORAGE_VERSION + 1, STORAGE_VERSION, None).unwrap_err();
        assert_eq!(err, Error::DowngradeDetected);
    }

    #[test]
    fn version_2_clears_everything_after_imported() {
        let mut rom = populated_rom();
        let outcome = migrate(&mut rom, 2, STORAGE_VERSION, None).unwrap();
        assert!(!rom.has_homescreen);
        assert!(!rom.has_u2f_counter);
        assert!(!rom.has_flags);
        assert!(!rom.has_u2froot);
        assert!(rom.has_imported);
        assert!(outcome.needs_recommit);
        assert!(outcome.recompute_u2froot);
    }

    #[test]
    fn version_8_clears_only_u2froot() {
        let mut rom = populated_rom();
        let outcome = migrate(&mut rom, 8, STORAGE_VERSION, None).unwrap();
        assert!(rom.has_flags);
        assert!(rom.has_u2f_counter);
        assert!(!rom.has_u2froot);
        assert!(outcome.recompute_u2froot);
    }

    #[test]
    fn version_9_leaves_fields_untouched() {
        let mut rom = populated_rom();
        let outcome = migrate(&mut rom, 9, STORAGE_VERSION, None).unwrap();
        assert!(rom.has_u2froot);
        assert!(!outcome.recompute_u2froot);
        assert!(outcome.needs_recommit);
    }

    #[test]
    fn current_version_is_a_no_op() {
        let mut rom = populated_rom();
        let outcome = migrate(&mut rom, STORAGE_VERSION, STORAGE_VERSION, None).unwrap();
        assert!(!outcome.needs_recommit);
        assert!(!outcome.recompute_u2froot);
        assert!(outcome.legacy_pin_wait.is_none());
    }

    #[test]
    fn legacy_pin_counter_becomes_wait_word() {
        let mut rom = populated_rom();
        let outcome = migrate(&mut rom, 3, STORAGE_VERSION, Some(4)).unwrap();
        assert_eq!(outcome.legacy_pin_wait, Some(0xFFFF_FFFFu32 << 4));
    }

    #[test]
    fn legacy_pin_counter_saturates_at_31() {
        let mut rom = populated_rom();
        let outcome = migrate(&mut rom, 3, STORAGE_VERSION, Some(99)).unwrap();
        assert_eq!(outcome.legacy_pin_wait, Some(0xFFFF_FFFFu32 << 31));
    }

    /// Mirrors the real call site in `StorageCore::from_flash`: the
    /// legacy counter comes from the decoded record's own field, not a
    /// value the caller invents.
    #[test]
    fn legacy_pin_counter_is_read_from_the_decoded_record() {
        let mut rom = populated_rom();
        rom.has_pin_failed_attempts = true;
        rom.pin_failed_attempts = 6;
        let legacy = if rom.has_pin_failed_attempts { Some(rom.pin_failed_attempts) } else { None };
        let outcome = migrate(&mut rom, 4, STORAGE_VERSION, legacy).unwrap();
        assert_eq!(outcome.legacy_pin_wait, Some(0xFFFF_FFFFu32 << 6));
        assert!(!rom.has_pin_failed_attempts);
    }

    #[test]
    fn absent_legacy_counter_converts_to_zero_wait() {
        let mut rom = populated_rom();
        let outcome = migrate(&mut rom, 4, STORAGE_VERSION, None).unwrap();
        assert_eq!(outcome.legacy_pin_wait, Some(0xFFFF_FFFFu32));
    }
}
