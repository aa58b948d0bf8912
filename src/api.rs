//! C9: Public API.
//!
//! `StorageCore` owns every piece of mutable state the original
//! firmware kept as file-scope globals (`storageUpdate`, the session
//! cache, `storage_u2f_offset`) per §9's "global mutable state → owned
//! store" redesign note: one object, constructed once, threaded through
//! every call site the way the teacher threads `&mut
//! stm32f407::Peripherals` rather than reaching for a static.

use crate::commit::{self, MergeEffects};
use crate::counters;
use crate::crypto::Crypto;
use crate::error::{Error, Result};
use crate::flash::{FlashDevice, FlashGeometry};
use crate::migrate;
use crate::pipeline::{self, PassphrasePrompt, UiProgress, UsbYield};
use crate::record::{Curve, HdNode, StorageRecord, MAGIC, MNEMONIC_CAP, RECORD_IMAGE_LEN, STORAGE_VERSION};
use crate::session::SessionCache;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// The device-local identifier, regenerated only on `wipe`.
pub type Uuid = [u8; 12];

pub struct StorageCore<F: FlashDevice, C: Crypto> {
    flash: F,
    crypto: C,
    geometry: FlashGeometry,
    rom: StorageRecord,
    update: StorageRecord,
    session: SessionCache,
    uuid: Uuid,
    u2f_offset: u32,
    secure_chip_ready: bool,
}

impl<F: FlashDevice, C: Crypto> StorageCore<F, C> {
    /// `init` (§4.7) for a deployment with no secure element: the
    /// on-MCU plaintext backend is used for everything, so
    /// `secure_chip_ready` starts (and stays) `false`. Callers compiled
    /// with the `secure-chip` feature and a real chip handle should use
    /// [`Self::init_with_secure_chip`] instead, which actually brings
    /// the chip up first. Tries to load from flash; on any failure to do
    /// so, wipes.
    pub fn init(flash: F, crypto: C, geometry: FlashGeometry, secure_chip_ready: bool, rng: &mut dyn FnMut(&mut [u8])) -> Self {
        let mut core = StorageCore {
            flash,
            crypto,
            geometry,
            rom: StorageRecord::default(),
            update: StorageRecord::default(),
            session: SessionCache::default(),
            uuid: [0u8; 12],
            u2f_offset: 0,
            secure_chip_ready,
        };
        if core.from_flash().is_err() {
            log::warn!("storage: from_flash failed at init, wiping");
            core.wipe(rng).expect("wipe of a freshly constructed core cannot fail");
        }
        core
    }

    /// `init` (§4.7) with a secure element present: bring the chip up
    /// first (a failure here is not fatal — it just means the on-MCU
    /// plaintext path is used for everything the chip would otherwise
    /// back) and record whether that succeeded, then proceed exactly as
    /// [`Self::init`].
    #[cfg(feature = "secure-chip")]
    pub fn init_with_secure_chip(
        flash: F,
        crypto: C,
        geometry: FlashGeometry,
        chip: &mut dyn crate::securechip::SecureChip,
        rng: &mut dyn FnMut(&mut [u8]),
    ) -> Self {
        let ready = chip.init();
        if !ready {
            log::warn!("storage: secure chip init failed, falling back to on-MCU plaintext backend");
        }
        Self::init(flash, crypto, geometry, ready, rng)
    }

    /// Whether the secure-element backend is up and should be consulted
    /// for mnemonic encryption/PIN verification instead of the on-MCU
    /// plaintext fields.
    pub fn secure_chip_ready(&self) -> bool {
        self.secure_chip_ready
    }

    /// Read and validate the rom record, run the schema migrator, and
    /// scan the U2F area to recompute `u2f_offset` (§4.7).
    pub fn from_flash(&mut self) -> Result<()> {
        self.update = StorageRecord::default();

        let magic = self.flash.read_word(self.geometry.meta_sector.start + self.geometry.magic_offset);
        if magic != MAGIC {
            log::error!("storage: magic mismatch at {:#x}", self.geometry.meta_sector.start);
            return Err(Error::MagicMismatch);
        }

        self.flash.read(
            self.geometry.meta_sector.start + self.geometry.uuid_offset,
            &mut self.uuid,
        );

        let mut image = [0u8; RECORD_IMAGE_LEN];
        self.flash.read(
            self.geometry.meta_sector.start + self.geometry.record_offset,
            &mut image,
        );
        let mut rom = StorageRecord::decode(&image);
        let stored_version = rom.version;
        let legacy_pin_failed_attempts =
            if rom.has_pin_failed_attempts { Some(rom.pin_failed_attempts) } else { None };

        let outcome = migrate::migrate(&mut rom, stored_version, STORAGE_VERSION, legacy_pin_failed_attempts)
            .map_err(|e| {
                log::error!("storage: downgrade detected, stored version {:#x}", stored_version);
                e
            })?;
        self.rom = rom;

        self.u2f_offset = counters::scan_u2f_offset(&self.flash, &self.geometry);

        if outcome.recompute_u2froot {
            self.update.has_mnemonic = true;
            self.update.mnemonic = self.rom.mnemonic;
        }
        if let Some(wait) = outcome.legacy_pin_wait {
            counters::area_recycle(&mut self.flash, &self.geometry, wait, self.u2f_offset)?;
            self.u2f_offset = 0;
        }
        if outcome.needs_recommit {
            self.commit()?;
            log::info!("storage: migrated to version {:#x}", STORAGE_VERSION);
        }

        Ok(())
    }

    /// Merge the staged update into rom and rewrite the meta sector
    /// atomically (§4.2). Recomputes `u2froot` first if the mnemonic
    /// changed this round (§4.2's merge exception).
    pub fn commit(&mut self) -> Result<MergeEffects> {
        if self.update.has_mnemonic && !self.update.has_u2froot {
            self.update.has_u2froot = true;
            let seed = self.crypto.mnemonic_to_seed(self.update.mnemonic.as_str(), "", &mut |_, _| {});
            self.update.u2froot = self.crypto.hdnode_from_seed(&seed, Curve::Nist256p1);
            let path = crate::record::U2F_KEY_PATH;
            for index in path {
                if !self.crypto.hdnode_private_ckd(&mut self.update.u2froot, index, Curve::Nist256p1) {
                    log::error!("storage: u2f root derivation failed at index {:#x}", index);
                    return Err(Error::StorageCorrupt);
                }
            }
        }

        let mut staged = core::mem::take(&mut self.update);
        let (merged, effects) = commit::merge(&self.rom, staged);
        // `StorageRecord` is `Copy`, so passing `staged` into `merge` by
        // value left this binding's mnemonic/PIN/node/u2froot bytes
        // intact (P6, §2.1): scrub them explicitly now that `merged` has
        // what it needs.
        staged.zeroize();

        commit::write_sector(&mut self.flash, &self.geometry, &self.uuid, Some(&merged))?;
        self.rom = merged;
        self.update = StorageRecord::default();

        if effects.invalidate_seed {
            self.session.invalidate_seed();
        }
        if effects.invalidate_pin {
            self.session.invalidate_pin();
        }

        log::info!("storage: committed version {:#x}", self.rom.version);
        Ok(effects)
    }

    /// Full reset of the on-MCU state: clear the session, generate a
    /// fresh uuid, commit an empty record, and recycle the counter
    /// sector. Deployments with a secure element should call
    /// [`Self::wipe_with_secure_chip`] instead, so the chip's own zone is
    /// wiped too.
    pub fn wipe(&mut self, rng: &mut dyn FnMut(&mut [u8])) -> Result<()> {
        self.session.clear();
        rng(&mut self.uuid);
        self.rom = StorageRecord::default();
        self.update = StorageRecord::default();
        self.u2f_offset = 0;

        commit::write_sector(&mut self.flash, &self.geometry, &self.uuid, Some(&self.rom))?;

        self.flash.unlock();
        let result = self.flash.erase_sector(self.geometry.counter_sector);
        self.flash.lock();
        result?;

        log::info!("storage: wiped, new uuid generated");
        Ok(())
    }

    /// `wipe` (§4.7) with a secure element present: wipe the chip's zone
    /// first (best-effort — a chip failure does not block the MCU-side
    /// wipe from proceeding) before doing everything [`Self::wipe`] does.
    #[cfg(feature = "secure-chip")]
    pub fn wipe_with_secure_chip(
        &mut self,
        chip: &mut dyn crate::securechip::SecureChip,
        rng: &mut dyn FnMut(&mut [u8]),
    ) -> Result<()> {
        chip.wipe_zone();
        self.secure_chip_ready = false;
        self.wipe(rng)
    }

    /// OR-merge new bits into `flags` (monotonic: a bit once set can
    /// only be cleared by `wipe`). No-op (no commit) if `f` contributes
    /// no new bits.
    pub fn apply_flags(&mut self, f: u32) {
        let current = if self.update.has_flags { self.update.flags } else { self.rom.flags };
        let merged = current | f;
        if merged != current {
            self.update.has_flags = true;
            self.update.flags = merged;
        }
    }

    pub fn flags(&self) -> u32 {
        if self.rom.has_flags {
            self.rom.flags
        } else {
            0
        }
    }

    /// Constant-time mnemonic comparison (§4.7/P5): both candidate and
    /// stored length participate in every comparison step regardless of
    /// where they first differ.
    pub fn contains_mnemonic(&self, candidate: &str) -> bool {
        if !self.rom.has_mnemonic {
            return false;
        }
        let cand_bytes = candidate.as_bytes();
        if cand_bytes.len() >= MNEMONIC_CAP {
            return false;
        }
        let mut cand_buf = [0u8; MNEMONIC_CAP];
        cand_buf[..cand_bytes.len()].copy_from_slice(cand_bytes);
        bool::from(self.rom.mnemonic.buf.ct_eq(&cand_buf))
    }

    pub fn has_mnemonic(&self) -> bool {
        self.rom.has_mnemonic
    }

    pub fn has_pin(&self) -> bool {
        self.rom.has_pin && !self.rom.pin.is_empty()
    }

    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }

    pub fn rom(&self) -> &StorageRecord {
        &self.rom
    }

    /// Stage a mutation into the update record. Callers build up a
    /// `StorageRecord` with just the `has_X` bits they're touching set
    /// (mirroring the C layer's `storageUpdate.has_X = true;
    /// storageUpdate.X = ...;` pattern) and hand it to `stage`; `commit`
    /// merges it with rom.
    pub fn stage(&mut self, mutator: impl FnOnce(&mut StorageRecord)) {
        mutator(&mut self.update);
    }

    pub fn get_seed(
        &mut self,
        ui: &mut dyn UiProgress,
        usb: &mut dyn UsbYield,
        prompt: &mut dyn PassphrasePrompt,
        use_passphrase: bool,
    ) -> Result<[u8; 64]> {
        pipeline::get_seed(&self.rom, &mut self.session, &self.crypto, ui, usb, prompt, use_passphrase)
    }

    pub fn get_root_node(
        &mut self,
        ui: &mut dyn UiProgress,
        usb: &mut dyn UsbYield,
        prompt: &mut dyn PassphrasePrompt,
        curve: Curve,
        use_passphrase: bool,
    ) -> Result<HdNode> {
        pipeline::get_root_node(&self.rom, &mut self.session, &self.crypto, ui, usb, prompt, curve, use_passphrase)
    }

    pub fn get_u2f_root(&self) -> Option<HdNode> {
        pipeline::get_u2f_root(&self.rom)
    }

    pub fn session_get_state(
        &self,
        salt: Option<&[u8; 32]>,
        passphrase: Option<&str>,
        rng: &mut dyn FnMut(&mut [u8]),
    ) -> Result<[u8; 64]> {
        pipeline::session_get_state(&self.crypto, &self.session, &self.uuid, salt, passphrase, rng)
    }

    pub fn pin_fails_offset(&self) -> u32 {
        counters::pin_fails_offset(&self.flash, &self.geometry)
    }

    pub fn pin_wait(&self, addr: u32) -> u32 {
        counters::pin_wait(&self.flash, addr)
    }

    pub fn increase_pin_fails(&mut self, addr: u32) -> Result<bool> {
        counters::increase_pin_fails(&mut self.flash, addr)
    }

    pub fn reset_pin_fails(&mut self, addr: u32) -> Result<()> {
        counters::reset_pin_fails(&mut self.flash, &self.geometry, addr)
    }

    /// `next_u2f_counter` (§4.5): advance the bit-clearing counter,
    /// recycling the sector (and re-committing the folded base value)
    /// if the area is exhausted.
    pub fn next_u2f_counter(&mut self) -> Result<u32> {
        match counters::next_u2f_counter(&mut self.flash, &self.geometry, self.rom.u2f_counter, self.u2f_offset) {
            Ok((value, new_offset)) => {
                self.u2f_offset = new_offset;
                Ok(value)
            }
            Err(Error::InvalidArgument) => {
                let folded = self.rom.u2f_counter.wrapping_add(self.u2f_offset);
                counters::area_recycle(&mut self.flash, &self.geometry, 0xFFFF_FFFF, self.u2f_offset)?;
                self.update.has_u2f_counter = true;
                self.update.u2f_counter = folded;
                self.commit()?;
                self.u2f_offset = 0;
                log::info!("storage: u2f area recycled, folded counter {}", folded);
                self.next_u2f_counter()
            }
            Err(e) => Err(e),
        }
    }
}
