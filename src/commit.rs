//! C3: Atomic Committer.
//!
//! Merges the staged update record into the rom record (§4.2's merge
//! policy) and rewrites the meta sector atomically with respect to power
//! loss: erase, then reprogram meta-descriptor + magic + uuid + record,
//! then zero-fill the remainder. Grounded on the teacher's `flash::write`
//! (unlock/program-word-at-a-time/check-status/lock) and its config
//! sector's magic+checksum validate-or-default pattern.

use crate::error::{Error, Result};
use crate::flash::{program_bytes, FlashDevice, FlashGeometry};
use crate::record::{StorageRecord, MAGIC, RECORD_IMAGE_LEN, STORAGE_VERSION};

/// Side effects the merge determined are necessary, reported back to the
/// caller (`StorageCore::commit`) so it can perform the parts that need
/// capabilities the committer itself does not have (crypto, session
/// cache).
#[derive(Clone, Copy, Debug, Default)]
pub struct MergeEffects {
    pub invalidate_seed: bool,
    pub invalidate_pin: bool,
    /// `has_mnemonic` was set by this update: `u2froot` must be
    /// recomputed from the (decrypted) mnemonic before the merged record
    /// is written to flash.
    pub recompute_u2froot: bool,
}

/// Apply §4.2's field-by-field merge policy. `update` is the caller's
/// staged record: every `has_X` bit on it means "the caller touched this
/// field this round", exactly as it does on the rom record, so merge
/// reads as "for each field, take update's if present, else rom's" with
/// the handful of presence-demoting exceptions spec'd for PIN/label/
/// homescreen. `update` is taken by value and its buffer-backed fields
/// end up folded into the returned record; `StorageRecord` is `Copy` (so
/// it cannot also implement `Drop`/`ZeroizeOnDrop`), so the secret bytes
/// still held in the caller's own `update` binding are **not** zeroized
/// by this call alone — the caller must `.zeroize()` that binding itself
/// once it has handed ownership to `merge` (see `StorageCore::commit`).
pub fn merge(rom: &StorageRecord, mut update: StorageRecord) -> (StorageRecord, MergeEffects) {
    let mut effects = MergeEffects {
        invalidate_seed: update.has_passphrase_protection || update.has_pin,
        invalidate_pin: update.has_pin,
        recompute_u2froot: false,
    };

    update.version = STORAGE_VERSION;

    // The legacy PIN failure counter is never repopulated by a current
    // commit: once folded into the PIN-fail area's wait-word encoding by
    // the migrator, it stays absent from the record going forward.
    update.has_pin_failed_attempts = false;
    update.pin_failed_attempts = 0;

    if !update.has_node && !update.has_mnemonic {
        update.has_node = rom.has_node;
        update.node = rom.node;
        update.has_mnemonic = rom.has_mnemonic;
        update.mnemonic = rom.mnemonic;
        update.has_u2froot = rom.has_u2froot;
        update.u2froot = rom.u2froot;
    } else if update.has_mnemonic {
        update.has_u2froot = true;
        effects.recompute_u2froot = true;
    }

    if !update.has_pin {
        update.has_pin = rom.has_pin;
        update.pin = rom.pin;
    } else if update.pin.is_empty() {
        update.has_pin = false;
    }

    if !update.has_language {
        update.has_language = rom.has_language;
        update.language = rom.language;
    }

    if !update.has_label {
        update.has_label = rom.has_label;
        update.label = rom.label;
    } else if update.label.is_empty() {
        update.has_label = false;
    }

    if !update.has_imported {
        update.has_imported = rom.has_imported;
        update.imported = rom.imported;
    }

    if !update.has_homescreen {
        update.has_homescreen = rom.has_homescreen;
        update.homescreen = rom.homescreen;
    } else if update.homescreen.size == 0 {
        update.has_homescreen = false;
    }

    if !update.has_u2f_counter {
        update.has_u2f_counter = rom.has_u2f_counter;
        update.u2f_counter = rom.u2f_counter;
    }

    if !update.has_needs_backup {
        update.has_needs_backup = rom.has_needs_backup;
        update.needs_backup = rom.needs_backup;
    }

    if !update.has_flags {
        update.has_flags = rom.has_flags;
        update.flags = rom.flags;
    }

    if !update.has_passphrase_protection {
        update.has_passphrase_protection = rom.has_passphrase_protection;
        update.passphrase_protection = rom.passphrase_protection;
    }

    update.zone_is_initialized = rom.zone_is_initialized || update.zone_is_initialized;

    (update, effects)
}

/// Back up the meta-descriptor, erase the meta sector, and reprogram
/// descriptor + magic + uuid + record + zero-fill (§4.2 write protocol).
/// `uuid` is the 12-byte device identifier, unchanged by ordinary
/// commits and only regenerated by `wipe`.
pub fn write_sector<F: FlashDevice>(
    flash: &mut F,
    geometry: &FlashGeometry,
    uuid: &[u8; 12],
    record: Option<&StorageRecord>,
) -> Result<()> {
    let sector = geometry.meta_sector;
    let mut meta_backup = [0u8; 256];
    let desc_len = geometry.meta_desc_len as usize;
    assert!(desc_len <= meta_backup.len(), "meta descriptor exceeds backup buffer");
    flash.read(sector.start, &mut meta_backup[..desc_len]);

    flash.unlock();
    let result = (|| -> Result<()> {
        flash.erase_sector(sector)?;

        program_bytes(flash, sector.start, &meta_backup[..desc_len])?;
        program_bytes(flash, sector.start + geometry.magic_offset, &MAGIC.to_le_bytes())?;
        program_bytes(flash, sector.start + geometry.uuid_offset, uuid)?;

        if let Some(record) = record {
            let mut image = [0u8; RECORD_IMAGE_LEN];
            record.encode(&mut image);
            program_bytes(flash, sector.start + geometry.record_offset, &image)?;
        }

        // Zero-fill through the storage boundary so future schema
        // extensions read as "presence bits cleared" (§4.3) rather than
        // stale erased-flash 0xFF.
        let written_end = sector.start
            + geometry.record_offset
            + if record.is_some() { RECORD_IMAGE_LEN as u32 } else { 0 };
        let pad_start = written_end;
        let pad_end = sector.start + geometry.storage_len;
        let mut addr = pad_start;
        while addr < pad_end {
            flash.program_word(addr, 0)?;
            addr += 4;
        }
        Ok(())
    })();
    flash.lock();
    result.map_err(|e| {
        log::error!("storage: flash program failed at sector {:#x}: {:?}", sector.start, e);
        Error::FlashProgramFailed
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::mock::MockFlash;

    fn geom() -> FlashGeometry {
        FlashGeometry::REFERENCE
    }

    #[test]
    fn write_then_read_back_magic_and_record() {
        let g = geom();
        let mut flash = MockFlash::new(0x6000);
        let uuid = [0xAAu8; 12];
        let mut rec = StorageRecord::default();
        rec.has_label = true;
        assert!(rec.label.set("dev"));

        write_sector(&mut flash, &g, &uuid, Some(&rec)).unwrap();

        assert_eq!(flash.read_word(g.meta_sector.start + g.magic_offset), MAGIC);
        let mut got_uuid = [0u8; 12];
        flash.read(g.meta_sector.start + g.uuid_offset, &mut got_uuid);
        assert_eq!(got_uuid, uuid);

        let mut image = [0u8; RECORD_IMAGE_LEN];
        flash.read(g.meta_sector.start + g.record_offset, &mut image);
        let back = StorageRecord::decode(&image);
        assert_eq!(back.label.as_str(), "dev");
    }

    #[test]
    fn merge_carries_rom_fields_forward_when_update_is_empty() {
        let mut rom = StorageRecord::default();
        rom.has_label = true;
        rom.label.set("kept");
        rom.has_flags = true;
        rom.flags = 0x3;

        let update = StorageRecord::default();
        let (merged, effects) = merge(&rom, update);
        assert_eq!(merged.label.as_str(), "kept");
        assert!(merged.has_flags);
        assert_eq!(merged.flags, 0x3);
        assert!(!effects.recompute_u2froot);
        assert!(!effects.invalidate_seed);
        assert!(!effects.invalidate_pin);
    }

    #[test]
    fn merge_empty_label_demotes_presence() {
        let rom = StorageRecord::default();
        let mut update = StorageRecord::default();
        update.has_label = true;
        update.label.set("");
        let (merged, _) = merge(&rom, update);
        assert!(!merged.has_label);
    }

    #[test]
    fn merge_setting_mnemonic_forces_u2froot_recompute() {
        let rom = StorageRecord::default();
        let mut update = StorageRecord::default();
        update.has_mnemonic = true;
        update.mnemonic.set("abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about");
        let (merged, effects) = merge(&rom, update);
        assert!(merged.has_u2froot);
        assert!(effects.recompute_u2froot);
    }

    #[test]
    fn merge_setting_pin_invalidates_seed_and_pin_cache() {
        let rom = StorageRecord::default();
        let mut update = StorageRecord::default();
        update.has_pin = true;
        update.pin.set("1234");
        let (merged, effects) = merge(&rom, update);
        assert!(merged.has_pin);
        assert!(effects.invalidate_seed);
        assert!(effects.invalidate_pin);
    }
}
