//! C8: Secure-Chip Adapter (compiled only with the `secure-chip` feature).
//!
//! When a secure element is present, the mnemonic plaintext never
//! touches flash: it is AES-256-CBC encrypted under a key the chip
//! alone holds, with an ESSIV derived from the device's unique ID
//! (§4.6). PIN verification is delegated to the chip's own zone API
//! instead of being checked on-MCU. Grounded on the `CRYPTOMEM`
//! conditional branch in the original firmware, re-modeled per §9's
//! "compile-time feature flag → runtime strategy" note as a trait with
//! exactly one production implementation selected by this crate
//! feature (the in-MCU path lives directly in `pipeline`/`api` and
//! needs no adapter).

use crate::crypto::Crypto;
use crate::error::{Error, Result};

/// The chip's own status codes collapse to success/failure at this
/// boundary; `SecureChipFailure` is never fatal (§7).
pub trait SecureChip {
    fn init(&mut self) -> bool;
    fn open_zone(&mut self, pin: u32) -> bool;
    fn set_pin(&mut self, pin: u32) -> bool;
    fn get_aes_key(&mut self) -> Result<[u8; 32]>;
    fn remaining_pin_attempts(&mut self) -> i8;
    fn initialize_new_zone(&mut self) -> bool;
    fn wipe_zone(&mut self);
    fn deactivate_security(&mut self);
    fn remaining_zones(&mut self) -> i32;
}

/// Default PIN value the chip is opened with when the caller supplies
/// no PIN (an empty or malformed PIN string parses to this).
pub const CM_DEFAULT_PW: u32 = 0;

/// Parse a PIN string as a 24-bit integer per §4.6: decimal digits
/// only, truncated to `& 0xFFFFFF`; anything else (empty, non-numeric,
/// overflowing) maps to `CM_DEFAULT_PW`.
pub fn pin_string_to_u24(pin: &str) -> u32 {
    if pin.is_empty() || !pin.bytes().all(|b| b.is_ascii_digit()) {
        return CM_DEFAULT_PW;
    }
    match pin.parse::<u32>() {
        Ok(v) => v & 0x00FF_FFFF,
        Err(_) => CM_DEFAULT_PW,
    }
}

/// `containsPin` on the secure-chip backend: deactivate any stale
/// security state, then attempt to open the zone with the parsed PIN.
pub fn contains_pin(chip: &mut dyn SecureChip, pin: &str) -> bool {
    chip.deactivate_security();
    chip.open_zone(pin_string_to_u24(pin))
}

/// Derive the per-record AES-CBC IV: `AES-256-ECB(SHA-256(aes_key),
/// mcu_unique_id repeated to 32 bytes)` (ESSIV, §4.6/GLOSSARY). Returns
/// the full 16-byte IV (the low half of the 32-byte ECB output block is
/// unused the same way `get_root_node`'s KDF split discards its tail).
pub fn derive_essiv<C: Crypto>(crypto: &C, aes_key: &[u8; 32], mcu_unique_id: &[u8]) -> [u8; 16] {
    let essiv_key = crypto.sha256(aes_key);
    let mut iv = [0u8; 16];
    for (i, b) in iv.iter_mut().enumerate() {
        *b = mcu_unique_id[i % mcu_unique_id.len()];
    }
    crypto.aes256_ecb_encrypt_block(&essiv_key, &mut iv);
    iv
}

/// Encrypt `plaintext` (zero-padded to `buffer`'s length) into `buffer`
/// under the chip's AES key and the device's ESSIV, per §4.6's write
/// path.
pub fn encrypt_mnemonic<C: Crypto>(
    crypto: &C,
    chip: &mut dyn SecureChip,
    mcu_unique_id: &[u8],
    plaintext: &str,
    buffer: &mut [u8],
) -> Result<()> {
    let aes_key = chip.get_aes_key().map_err(|_| Error::SecureChipFailure)?;
    let iv = derive_essiv(crypto, &aes_key, mcu_unique_id);
    let bytes = plaintext.as_bytes();
    if bytes.len() >= buffer.len() {
        return Err(Error::InvalidArgument);
    }
    buffer[..bytes.len()].copy_from_slice(bytes);
    buffer[bytes.len()..].fill(0);
    crypto.aes256_cbc_encrypt(&aes_key, &iv, buffer);
    Ok(())
}

/// Decrypt `buffer` in place and return the NUL-terminated plaintext
/// length, forcing a terminator at the last byte if none was found
/// (§4.6's read path).
pub fn decrypt_mnemonic<C: Crypto>(
    crypto: &C,
    chip: &mut dyn SecureChip,
    mcu_unique_id: &[u8],
    buffer: &mut [u8],
) -> Result<usize> {
    let aes_key = chip.get_aes_key().map_err(|_| Error::SecureChipFailure)?;
    let iv = derive_essiv(crypto, &aes_key, mcu_unique_id);
    crypto.aes256_cbc_decrypt(&aes_key, &iv, buffer);
    match buffer.iter().position(|&b| b == 0) {
        Some(pos) => Ok(pos),
        None => {
            let last = buffer.len() - 1;
            buffer[last] = 0;
            Ok(last)
        }
    }
}

/// `setMnemonic`'s zone bootstrap: a chip zone is only initialized the
/// first time a mnemonic is written to it.
pub fn ensure_zone_initialized(chip: &mut dyn SecureChip, zone_is_initialized: bool) -> bool {
    if zone_is_initialized {
        true
    } else {
        chip.initialize_new_zone()
    }
}
