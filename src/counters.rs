//! C5: Monotonic Counters.
//!
//! The PIN-fail and U2F counters both live in a dedicated sector as
//! sequences of words that only ever move bits 1→0 (§4.5), so a counter
//! can advance without an erase until its area is exhausted, at which
//! point the whole sector is recycled. Grounded directly on the
//! bit-shifting scheme in the original firmware's `storage_increasePinFails`/
//! `storage_nextU2FCounter`/`storage_area_recycle`.

use crate::error::{Error, Result};
use crate::flash::{FlashDevice, FlashGeometry};

/// Scan the PIN-fail area for the current (first all-ones-from-the-top,
/// i.e. not fully cleared) word, per `get_pin_fails_offset`.
pub fn pin_fails_offset<F: FlashDevice>(flash: &F, geometry: &FlashGeometry) -> u32 {
    let base = geometry.counter_sector.start + geometry.pin_area_offset;
    let len = geometry.pin_area_len;
    let mut addr = base;
    while addr + 4 <= base + len {
        if flash.read_word(addr) != 0 {
            return addr;
        }
        addr += 4;
    }
    // Fully exhausted area: caller is expected to have already recycled;
    // fall back to the final word so callers degrade to "maximally
    // failed" instead of reading out of range.
    base + len - 4
}

/// Remaining PIN attempts encoded at `addr`: the word counts failures as
/// 1-bits shifted in from the left, so the bitwise complement's
/// population of trailing 1s is the count already used.
pub fn pin_wait(flash: &impl FlashDevice, addr: u32) -> u32 {
    !flash.read_word(addr)
}

/// Record one more PIN failure. Returns `Ok(true)` if the counter
/// saturated (all bits already cleared), which the caller treats as
/// "accept a subsequently correct PIN anyway" since no further
/// distinction between failure counts is representable.
pub fn increase_pin_fails<F: FlashDevice>(flash: &mut F, addr: u32) -> Result<bool> {
    let cur = flash.read_word(addr);
    let newctr = cur << 1;
    if newctr == 0 {
        return Ok(true);
    }
    flash.unlock();
    let result = flash.program_word(addr, newctr);
    flash.lock();
    result?;
    if flash.read_word(addr) != newctr {
        log::error!("storage: pin-fail counter verify failed at {:#x}", addr);
        return Err(Error::FlashVerifyFailed);
    }
    Ok(false)
}

/// Clear the failure counter at `addr` back to zero attempts used,
/// unless doing so would need to advance past the area (in which case
/// the caller must recycle the sector instead).
pub fn reset_pin_fails<F: FlashDevice>(
    flash: &mut F,
    geometry: &FlashGeometry,
    addr: u32,
) -> Result<()> {
    let area_end = geometry.counter_sector.start + geometry.pin_area_offset + geometry.pin_area_len;
    if addr + 4 >= area_end {
        return area_recycle(flash, geometry, 0xFFFF_FFFF, 0);
    }
    flash.unlock();
    let result = flash.program_word(addr, 0);
    flash.lock();
    result
}

/// U2F counter state derived from scanning the U2F area: `word_offset`
/// is the bit position of the first still-set bit (the `u2f_offset`
/// carried across boot by `storage_from_flash`), measured from the area
/// base.
pub fn scan_u2f_offset<F: FlashDevice>(flash: &F, geometry: &FlashGeometry) -> u32 {
    let base = geometry.counter_sector.start + geometry.u2f_area_offset;
    let len = geometry.u2f_area_len;
    let mut addr = base;
    while addr + 4 <= base + len {
        let word = flash.read_word(addr);
        if word != 0 {
            let mut bit = 0u32;
            let mut w = word;
            while w & 1 == 0 {
                bit += 1;
                w >>= 1;
            }
            return (addr - base) * 8 + bit;
        }
        addr += 4;
    }
    len * 8
}

/// Advance the U2F counter by one. Returns the new logical counter value
/// (`rom.u2f_counter + u2f_offset` after the advance) and the updated
/// `u2f_offset`; if the area is exhausted the caller must recycle.
pub fn next_u2f_counter<F: FlashDevice>(
    flash: &mut F,
    geometry: &FlashGeometry,
    rom_u2f_counter: u32,
    u2f_offset: u32,
) -> Result<(u32, u32)> {
    let area_bits = geometry.u2f_area_len * 8;
    if u2f_offset >= area_bits {
        return Err(Error::InvalidArgument);
    }
    let base = geometry.counter_sector.start + geometry.u2f_area_offset;
    let addr = base + 4 * (u2f_offset / 32);
    let bit_in_word = u2f_offset & 31;
    let newval = 0xFFFF_FFFEu32 << bit_in_word;

    flash.unlock();
    let result = flash.program_word(addr, newval);
    flash.lock();
    result?;

    let new_offset = u2f_offset + 1;
    Ok((rom_u2f_counter.wrapping_add(new_offset), new_offset))
}

/// Recycle the counter sector (§4.5): clear the storage magic so a power
/// loss before the subsequent commit reads as "wiped" rather than
/// "stale PIN counter", erase the meta-sector-last (the counter
/// sector), reprogram the new PIN-fail wait word, and report the
/// U2F counter value the caller should fold into the next committed
/// record (`rom.u2f_counter + u2f_offset`) before zeroing `u2f_offset`.
///
/// This function only performs steps (a)-(c); folding the U2F offset
/// into the update record and issuing the commit (steps d/e) is the
/// caller's responsibility since it needs the record codec and
/// committer, not just the counter area.
pub fn area_recycle<F: FlashDevice>(
    flash: &mut F,
    geometry: &FlashGeometry,
    new_pinfails: u32,
    _current_u2f_offset: u32,
) -> Result<()> {
    let magic_addr = geometry.meta_sector.start + geometry.magic_offset;
    flash.unlock();
    let result = (|| -> Result<()> {
        flash.program_word(magic_addr, 0)?;
        if flash.read_word(magic_addr) != 0 {
            log::error!("storage: magic-clear verify failed at {:#x}", magic_addr);
            return Err(Error::FlashVerifyFailed);
        }
        flash.erase_sector(geometry.counter_sector)?;
        let pin_addr = geometry.counter_sector.start + geometry.pin_area_offset;
        flash.program_word(pin_addr, new_pinfails)?;
        if flash.read_word(pin_addr) != new_pinfails {
            log::error!("storage: pin-wait word verify failed at {:#x}", pin_addr);
            return Err(Error::FlashVerifyFailed);
        }
        Ok(())
    })();
    flash.lock();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::mock::MockFlash;

    fn geom() -> FlashGeometry {
        FlashGeometry::REFERENCE
    }

    fn fresh_flash() -> MockFlash {
        MockFlash::new(0x6000)
    }

    #[test]
    fn pin_fails_offset_finds_first_nonzero_word() {
        let g = geom();
        let mut flash = fresh_flash();
        flash.unlock();
        flash.program_word(g.counter_sector.start + g.pin_area_offset, 0).unwrap();
        flash.program_word(g.counter_sector.start + g.pin_area_offset + 4, 0xFFFF_FFF0).unwrap();
        flash.lock();
        let addr = pin_fails_offset(&flash, &g);
        assert_eq!(addr, g.counter_sector.start + g.pin_area_offset + 4);
        assert_eq!(pin_wait(&flash, addr), !0xFFFF_FFF0u32);
    }

    #[test]
    fn increase_pin_fails_shifts_left() {
        let g = geom();
        let mut flash = fresh_flash();
        let addr = g.counter_sector.start + g.pin_area_offset;
        let saturated = increase_pin_fails(&mut flash, addr).unwrap();
        assert!(!saturated);
        assert_eq!(flash.read_word(addr), 0xFFFF_FFFEu32);
    }

    #[test]
    fn increase_pin_fails_saturates_when_fully_cleared() {
        let g = geom();
        let mut flash = fresh_flash();
        let addr = g.counter_sector.start + g.pin_area_offset;
        flash.unlock();
        flash.program_word(addr, 0x8000_0000).unwrap();
        flash.lock();
        let saturated = increase_pin_fails(&mut flash, addr).unwrap();
        assert!(saturated);
    }

    #[test]
    fn scan_u2f_offset_on_fresh_area_is_zero() {
        let g = geom();
        let flash = fresh_flash();
        assert_eq!(scan_u2f_offset(&flash, &g), 0);
    }

    #[test]
    fn next_u2f_counter_advances_offset() {
        let g = geom();
        let mut flash = fresh_flash();
        let (val, offset) = next_u2f_counter(&mut flash, &g, 100, 0).unwrap();
        assert_eq!(offset, 1);
        assert_eq!(val, 101);
    }

    #[test]
    fn increase_pin_fails_reports_verify_failure_on_power_cut() {
        let _ = env_logger::try_init();
        let g = geom();
        let mut flash = fresh_flash();
        let addr = g.counter_sector.start + g.pin_area_offset;
        flash.cut_power_after(0);
        let err = increase_pin_fails(&mut flash, addr).unwrap_err();
        assert_eq!(err, Error::FlashVerifyFailed);
    }

    #[test]
    fn area_recycle_clears_magic_and_erases_counters() {
        let g = geom();
        let mut flash = fresh_flash();
        flash.unlock();
        flash.program_word(g.meta_sector.start + g.magic_offset, crate::record::MAGIC).unwrap();
        flash.lock();
        area_recycle(&mut flash, &g, 0xFFFF_FFFF, 0).unwrap();
        assert_eq!(flash.read_word(g.meta_sector.start + g.magic_offset), 0);
        assert_eq!(
            flash.read_word(g.counter_sector.start + g.pin_area_offset),
            0xFFFF_FFFF
        );
    }
}
