//! C1: Flash Region Map.
//!
//! Static partition of the reserved flash region into the storage-record
//! ("meta") sector and the PIN-fail / U2F counter sector, plus the
//! `FlashDevice` capability the rest of the core is written against.
//!
//! Grounded on the teacher's `flash.rs`: a `FLASH_SECTOR_ADDRESSES` table,
//! an `unlock`/`lock` bracket around every program/erase, and a post-op
//! status-register check that maps hardware error bits onto `Error`.

use crate::error::{Error, Result};

/// One erasable unit of flash. `id` is the opaque sector number the
/// driver's `erase_sector` call expects (mirrors the teacher's `u8`
/// sector index into `FLASH_SECTOR_ADDRESSES`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlashSector {
    pub id: u8,
    pub start: u32,
    pub len: u32,
}

impl FlashSector {
    pub const fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr < self.start + self.len
    }
}

/// Addresses and sector assignment for the three flash areas this core
/// owns. Passed into `StorageCore::new` instead of being baked in as
/// constants, so the same core builds against the real MCU layout or an
/// in-memory test layout (`FlashGeometry::TEST`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlashGeometry {
    /// Sector holding the bootloader's meta-descriptor header, followed
    /// by magic + uuid + storage record. Erased and rewritten wholesale
    /// by every commit.
    pub meta_sector: FlashSector,
    /// Length of the opaque meta-descriptor header at the very start of
    /// `meta_sector`. The committer backs this up before the erase and
    /// restores it verbatim (§4.2 step 1/3) — it belongs to the
    /// bootloader, not to this crate, and is never interpreted.
    pub meta_desc_len: u32,
    /// Offset (within `meta_sector`) of the magic word.
    pub magic_offset: u32,
    /// Offset of the uuid (12 bytes).
    pub uuid_offset: u32,
    /// Offset of the storage record image.
    pub record_offset: u32,
    /// Offset of the zero-fill boundary (`0x4000` on the reference
    /// hardware): everything from `record_offset + RECORD_IMAGE_LEN` up
    /// to here is zeroed after every commit (§4.2 step 4).
    pub storage_len: u32,

    /// Sector holding both the PIN-fail and U2F counter areas. A single
    /// sector on the reference hardware: both areas are erased together
    /// by `area_recycle`.
    pub counter_sector: FlashSector,
    /// Offset (within `counter_sector`) of the PIN-fail area.
    pub pin_area_offset: u32,
    pub pin_area_len: u32,
    /// Offset (within `counter_sector`) of the U2F area.
    pub u2f_area_offset: u32,
    pub u2f_area_len: u32,
}

impl FlashGeometry {
    /// Layout matching §3/§6 of the storage specification, at an
    /// arbitrary base of zero. Real firmware shifts every address by its
    /// flash base address when constructing its own `FlashGeometry`.
    pub const REFERENCE: FlashGeometry = FlashGeometry {
        meta_sector: FlashSector { id: 0, start: 0x0000, len: 0x4000 },
        meta_desc_len: 0x10,
        magic_offset: 0x0010,
        uuid_offset: 0x0014,
        record_offset: 0x0020,
        storage_len: 0x4000,
        counter_sector: FlashSector { id: 1, start: 0x4000, len: 0x1100 },
        pin_area_offset: 0x4000,
        pin_area_len: 0x1000,
        u2f_area_offset: 0x5000,
        u2f_area_len: 0x0100,
    };
}

/// The flash programming capability the core is written against. An
/// implementation is expected to:
///  - report words as read from an external OTP-style medium where bits
///    can only move 1→0 between erases (§3 invariants I1/I3/I4 all
///    depend on this);
///  - treat `program_word`/`erase_sector` as blocking and return only
///    after the hardware status register has been checked.
pub trait FlashDevice {
    fn read_word(&self, addr: u32) -> u32;
    fn read(&self, addr: u32, buf: &mut [u8]) {
        for (i, chunk) in buf.chunks_mut(4).enumerate() {
            let word = self.read_word(addr + (i as u32) * 4).to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }
    fn program_word(&mut self, addr: u32, word: u32) -> Result<()>;
    fn erase_sector(&mut self, sector: FlashSector) -> Result<()>;
    fn unlock(&mut self);
    fn lock(&mut self);
}

/// Program a byte slice at `addr`, 4 bytes at a time, padding the final
/// partial word with `0xFF` (erased value) so short tails never smear
/// neighbouring bytes. Mirrors the teacher's `write()` loop.
pub fn program_bytes<F: FlashDevice + ?Sized>(flash: &mut F, addr: u32, data: &[u8]) -> Result<()> {
    for (i, chunk) in data.chunks(4).enumerate() {
        let mut word_bytes = [0xFFu8; 4];
        word_bytes[..chunk.len()].copy_from_slice(chunk);
        let word = u32::from_le_bytes(word_bytes);
        flash.program_word(addr + (i as u32) * 4, word)?;
    }
    Ok(())
}

#[cfg(test)]
pub mod mock {
    //! Host-side in-memory `FlashDevice` implementing the write-once-bit
    //! rule and optional fault injection, per §4.9. Used throughout the
    //! crate's `#[cfg(test)]` modules.
    use super::*;

    pub const ERASED: u8 = 0xFF;

    pub struct MockFlash {
        image: Vec<u8>,
        locked: bool,
        ops_budget: Option<usize>,
        ops_done: usize,
    }

    impl MockFlash {
        pub fn new(len: usize) -> Self {
            MockFlash { image: vec![ERASED; len], locked: true, ops_budget: None, ops_done: 0 }
        }

        /// Allow only the first `n` program/erase operations to actually
        /// apply; subsequent ones are silently dropped. Models a power
        /// cut partway through a commit (P2).
        pub fn cut_power_after(&mut self, n: usize) {
            self.ops_budget = Some(n);
        }

        pub fn ops_done(&self) -> usize {
            self.ops_done
        }

        fn budget_allows(&mut self) -> bool {
            match self.ops_budget {
                None => true,
                Some(n) => self.ops_done < n,
            }
        }

        pub fn raw(&self) -> &[u8] {
            &self.image
        }
    }

    impl FlashDevice for MockFlash {
        fn read_word(&self, addr: u32) -> u32 {
            let addr = addr as usize;
            u32::from_le_bytes(self.image[addr..addr + 4].try_into().unwrap())
        }

        fn program_word(&mut self, addr: u32, word: u32) -> Result<()> {
            assert!(!self.locked, "program_word called without unlock()");
            self.ops_done += 1;
            if !self.budget_allows() {
                return Ok(());
            }
            let addr = addr as usize;
            let old = u32::from_le_bytes(self.image[addr..addr + 4].try_into().unwrap());
            // 1 -> 0 only: new bits must be a subset of old bits.
            assert_eq!(word & !old, 0, "attempted to set a bit from 0 to 1 without an erase");
            self.image[addr..addr + 4].copy_from_slice(&word.to_le_bytes());
            Ok(())
        }

        fn erase_sector(&mut self, sector: FlashSector) -> Result<()> {
            assert!(!self.locked, "erase_sector called without unlock()");
            self.ops_done += 1;
            if !self.budget_allows() {
                return Ok(());
            }
            let start = sector.start as usize;
            let end = start + sector.len as usize;
            for b in &mut self.image[start..end] {
                *b = ERASED;
            }
            Ok(())
        }

        fn unlock(&mut self) {
            self.locked = false;
        }

        fn lock(&mut self) {
            self.locked = true;
        }
    }
}
