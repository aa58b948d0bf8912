//! C7: Secret Pipeline.
//!
//! Mnemonic → seed → HD-root derivation, consulting the Session Cache
//! (C6) first and falling back to the slow PBKDF2 path with progress
//! reporting and USB-yield bracketing (§5) otherwise. The scheduling
//! capabilities (`UiProgress`, `UsbYield`, `PassphrasePrompt`) are
//! modeled as traits the caller supplies, the same way the teacher's
//! firmware takes `&mut stm32f407::Peripherals` as an externally-owned
//! handle instead of reaching for a global.

use crate::crypto::Crypto;
use crate::error::{Error, Result};
use crate::record::{Curve, HdNode, StorageRecord, HD_NODE_ENC_PASSWORD};
use crate::session::SessionCache;

pub const BIP39_PBKDF2_ROUNDS: u32 = crate::crypto::BIP39_PBKDF2_ROUNDS;

/// Progress reporting during long cryptographic loops. `fatal` never
/// returns: it is the host's non-returning "show error and shut down"
/// capability (§9's exception-free fatal path).
pub trait UiProgress {
    fn progress(&mut self, current: u32, total: u32);
    fn fatal(&mut self, message: &str) -> !;
}

/// USB servicing must be suspended ("tiny mode") for the duration of a
/// PBKDF2 loop so the interrupt handler parks incoming packets instead
/// of racing the core (§5).
pub trait UsbYield {
    fn tiny_mode(&mut self, enable: bool);
    fn sleep_ms(&mut self, ms: u32);
}

/// The passphrase entry prompt (`protect_passphrase`). Returns the
/// number of bytes written into `out`, or `None` if the user cancelled.
pub trait PassphrasePrompt {
    fn prompt(&mut self, out: &mut [u8; 51]) -> Option<usize>;
}

/// No-op implementations for host tests (§2.1/§5).
pub struct NoProgress;
impl UiProgress for NoProgress {
    fn progress(&mut self, _current: u32, _total: u32) {}
    fn fatal(&mut self, message: &str) -> ! {
        panic!("fatal storage error: {}", message);
    }
}

pub struct NoYield;
impl UsbYield for NoYield {
    fn tiny_mode(&mut self, _enable: bool) {}
    fn sleep_ms(&mut self, _ms: u32) {}
}

/// Obtain the 64-byte seed, consulting the cache first. Requires
/// `has_mnemonic`; if `use_passphrase` and no passphrase is cached yet,
/// invokes `prompt`.
pub fn get_seed<C: Crypto>(
    rom: &StorageRecord,
    session: &mut SessionCache,
    crypto: &C,
    ui: &mut dyn UiProgress,
    usb: &mut dyn UsbYield,
    prompt: &mut dyn PassphrasePrompt,
    use_passphrase: bool,
) -> Result<[u8; 64]> {
    if let Some(seed) = session.seed(use_passphrase) {
        return Ok(*seed);
    }
    if !rom.has_mnemonic {
        return Err(Error::NoMnemonic);
    }

    if use_passphrase && !session.is_passphrase_cached() {
        let mut buf = [0u8; 51];
        match prompt.prompt(&mut buf) {
            Some(len) => {
                let s = core::str::from_utf8(&buf[..len]).map_err(|_| Error::InvalidArgument)?;
                session.cache_passphrase(s);
            }
            None => return Err(Error::UserCancel),
        }
    }

    let mnemonic = rom.mnemonic.as_str();
    if !rom.has_imported && !crypto.mnemonic_check(mnemonic) {
        // A properly-generated-or-recovered mnemonic that fails its own
        // checksum means the record is corrupt beyond repair (§7):
        // there is no seed to recover by continuing, so this halts the
        // device rather than handing back an ordinary `Result`.
        log::error!("storage: stored mnemonic failed its checksum, halting");
        ui.fatal("storage failure detected");
    }

    let passphrase = if use_passphrase { session.passphrase().unwrap_or("") } else { "" };

    usb.tiny_mode(true);
    let seed = crypto.mnemonic_to_seed(mnemonic, passphrase, &mut |done, total| ui.progress(done, total));
    usb.tiny_mode(false);

    session.cache_seed(seed, use_passphrase);
    Ok(seed)
}

/// Obtain the HD root for `curve`. A stored SECP256K1 node is preferred
/// over mnemonic-derivation; it may be passphrase-encrypted in place
/// (chain code and private key only), per §4.4.
pub fn get_root_node<C: Crypto>(
    rom: &StorageRecord,
    session: &mut SessionCache,
    crypto: &C,
    ui: &mut dyn UiProgress,
    usb: &mut dyn UsbYield,
    prompt: &mut dyn PassphrasePrompt,
    curve: Curve,
    use_passphrase: bool,
) -> Result<HdNode> {
    if rom.has_node && curve == Curve::Secp256k1 {
        let mut node = rom.node;
        if rom.passphrase_protection {
            if let Some(passphrase) = session.passphrase() {
                if !passphrase.is_empty() {
                    usb.sleep_ms(1);
                    usb.tiny_mode(true);
                    let kdf = crypto.pbkdf2_hmac_sha512(
                        passphrase.as_bytes(),
                        HD_NODE_ENC_PASSWORD,
                        BIP39_PBKDF2_ROUNDS,
                        &mut |done, total| ui.progress(done, total),
                    );
                    usb.tiny_mode(false);
                    let key: [u8; 32] = kdf[..32].try_into().unwrap();
                    // The KDF output's second half is nominally the IV
                    // (§4.4); only its leading 16 bytes are usable as an
                    // AES-CBC IV, so the remaining 16 are discarded.
                    let iv: [u8; 16] = kdf[32..48].try_into().unwrap();

                    let mut chain_code = node.chain_code;
                    crypto.aes256_cbc_decrypt(&key, &iv, &mut chain_code);
                    node.chain_code = chain_code;

                    let mut private_key = node.private_key;
                    crypto.aes256_cbc_decrypt(&key, &iv, &mut private_key);
                    node.private_key = private_key;
                }
            }
        }
        return Ok(node);
    }

    let seed = get_seed(rom, session, crypto, ui, usb, prompt, use_passphrase)?;
    Ok(crypto.hdnode_from_seed(&seed, curve))
}

/// The U2F authentication root, if one has been computed.
pub fn get_u2f_root(rom: &StorageRecord) -> Option<HdNode> {
    if rom.has_u2froot {
        Some(rom.u2froot)
    } else {
        None
    }
}

/// `session_get_state(salt, passphrase)`: §4.4's device-state hash used
/// by the wire protocol to detect passphrase/session changes without
/// exposing the passphrase itself. `rng` fills 32 random bytes when no
/// `salt` is supplied (the random source is out of this core's scope,
/// per §1, so it is injected as a capability like everything else
/// external).
pub fn session_get_state<C: Crypto>(
    crypto: &C,
    session: &SessionCache,
    uuid: &[u8; 12],
    salt: Option<&[u8; 32]>,
    passphrase: Option<&str>,
    rng: &mut dyn FnMut(&mut [u8]),
) -> Result<[u8; 64]> {
    let passphrase = match passphrase.or_else(|| session.passphrase()) {
        Some(p) => p,
        None => return Err(Error::InvalidArgument),
    };

    let mut out = [0u8; 64];
    match salt {
        Some(s) => out[..32].copy_from_slice(s),
        None => rng(&mut out[..32]),
    }

    let mut msg = [0u8; 44];
    msg[..32].copy_from_slice(&out[..32]);
    msg[32..].copy_from_slice(uuid);
    let mac = crypto.hmac_sha256(passphrase.as_bytes(), &msg);
    out[32..].copy_from_slice(&mac);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::RustCryptoBackend;

    struct NeverPrompt;
    impl PassphrasePrompt for NeverPrompt {
        fn prompt(&mut self, _out: &mut [u8; 51]) -> Option<usize> {
            None
        }
    }

    fn rom_with_mnemonic() -> StorageRecord {
        let mut rec = StorageRecord::default();
        rec.has_mnemonic = true;
        rec.mnemonic.set("abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about");
        rec
    }

    #[test]
    fn get_seed_without_mnemonic_fails() {
        let rom = StorageRecord::default();
        let mut session = SessionCache::default();
        let crypto = RustCryptoBackend;
        let mut ui = NoProgress;
        let mut usb = NoYield;
        let mut prompt = NeverPrompt;
        let err = get_seed(&rom, &mut session, &crypto, &mut ui, &mut usb, &mut prompt, false).unwrap_err();
        assert_eq!(err, Error::NoMnemonic);
    }

    #[test]
    fn get_seed_caches_result() {
        let rom = rom_with_mnemonic();
        let mut session = SessionCache::default();
        let crypto = RustCryptoBackend;
        let mut ui = NoProgress;
        let mut usb = NoYield;
        let mut prompt = NeverPrompt;
        let seed1 = get_seed(&rom, &mut session, &crypto, &mut ui, &mut usb, &mut prompt, false).unwrap();
        assert!(session.seed(false).is_some());
        let seed2 = get_seed(&rom, &mut session, &crypto, &mut ui, &mut usb, &mut prompt, false).unwrap();
        assert_eq!(seed1, seed2);
    }

    #[test]
    fn get_root_node_derives_from_seed_when_no_stored_node() {
        let rom = rom_with_mnemonic();
        let mut session = SessionCache::default();
        let crypto = RustCryptoBackend;
        let mut ui = NoProgress;
        let mut usb = NoYield;
        let mut prompt = NeverPrompt;
        let node = get_root_node(&rom, &mut session, &crypto, &mut ui, &mut usb, &mut prompt, Curve::Secp256k1, false).unwrap();
        assert!(node.has_private_key);
        assert_eq!(node.depth, 0);
    }

    #[test]
    fn get_u2f_root_absent_by_default() {
        let rom = StorageRecord::default();
        assert!(get_u2f_root(&rom).is_none());
    }

    #[test]
    fn session_get_state_with_fixed_salt_matches_manual_hmac() {
        let crypto = RustCryptoBackend;
        let session = SessionCache::default();
        let uuid = [0xABu8; 12];
        let salt = [0u8; 32];
        let mut rng_calls = 0;
        let out = session_get_state(&crypto, &session, &uuid, Some(&salt), Some(""), &mut |_| rng_calls += 1).unwrap();
        assert_eq!(rng_calls, 0);
        let mut msg = [0u8; 44];
        msg[32..].copy_from_slice(&uuid);
        let expected = crypto.hmac_sha256(b"", &msg);
        assert_eq!(&out[32..], &expected[..]);
    }

    #[test]
    fn session_get_state_without_passphrase_fails() {
        let crypto = RustCryptoBackend;
        let session = SessionCache::default();
        let uuid = [0u8; 12];
        let err = session_get_state(&crypto, &session, &uuid, None, None, &mut |_| {}).unwrap_err();
        assert_eq!(err, Error::InvalidArgument);
    }
}
