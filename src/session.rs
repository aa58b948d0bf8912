//! C6: Session Cache.
//!
//! Volatile, zeroize-on-clear cache for the secrets a boot-time PIN/
//! passphrase unlock produces, so repeated `get_seed`/`get_root_node`
//! calls within one session don't re-run PBKDF2. Grounded on the pack's
//! `keystore`/`pddb` session-material handling: a plain struct with
//! `Zeroize`, cleared explicitly at the lifecycle points I6 names
//! (boot, wipe, PIN change, passphrase-protection change) rather than
//! relying on scope exit.

use zeroize::Zeroize;

pub const PASSPHRASE_CAP: usize = 51;

/// `{seed, seed_valid, seed_uses_passphrase, passphrase, passphrase_valid,
/// pin_ok}` (§3). Not `Copy`: callers hold exactly one `SessionCache`
/// inside `StorageCore` and mutate it in place.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct SessionCache {
    seed: [u8; 64],
    #[zeroize(skip)]
    seed_valid: bool,
    #[zeroize(skip)]
    seed_uses_passphrase: bool,
    passphrase: [u8; PASSPHRASE_CAP],
    #[zeroize(skip)]
    passphrase_len: usize,
    #[zeroize(skip)]
    passphrase_valid: bool,
    #[zeroize(skip)]
    pin_ok: bool,
}

impl Default for SessionCache {
    fn default() -> Self {
        SessionCache {
            seed: [0u8; 64],
            seed_valid: false,
            seed_uses_passphrase: false,
            passphrase: [0u8; PASSPHRASE_CAP],
            passphrase_len: 0,
            passphrase_valid: false,
            pin_ok: false,
        }
    }
}

impl SessionCache {
    pub fn clear(&mut self) {
        self.zeroize();
        *self = SessionCache::default();
    }

    pub fn seed(&self, use_passphrase: bool) -> Option<&[u8; 64]> {
        if self.seed_valid && self.seed_uses_passphrase == use_passphrase {
            Some(&self.seed)
        } else {
            None
        }
    }

    pub fn cache_seed(&mut self, seed: [u8; 64], uses_passphrase: bool) {
        self.seed = seed;
        self.seed_valid = true;
        self.seed_uses_passphrase = uses_passphrase;
    }

    pub fn passphrase(&self) -> Option<&str> {
        if self.passphrase_valid {
            core::str::from_utf8(&self.passphrase[..self.passphrase_len]).ok()
        } else {
            None
        }
    }

    pub fn cache_passphrase(&mut self, passphrase: &str) -> bool {
        let bytes = passphrase.as_bytes();
        if bytes.len() > PASSPHRASE_CAP {
            return false;
        }
        self.passphrase[..bytes.len()].copy_from_slice(bytes);
        self.passphrase[bytes.len()..].fill(0);
        self.passphrase_len = bytes.len();
        self.passphrase_valid = true;
        // A freshly cached passphrase invalidates any seed derived under
        // a different (or absent) passphrase.
        self.seed_valid = false;
        true
    }

    pub fn is_passphrase_cached(&self) -> bool {
        self.passphrase_valid
    }

    pub fn pin_ok(&self) -> bool {
        self.pin_ok
    }

    pub fn cache_pin_ok(&mut self, ok: bool) {
        self.pin_ok = ok;
    }

    /// I6: invalidate everything derived from the old policy without
    /// forgetting the device is mid-session (the caller re-derives on
    /// next `get_seed`).
    pub fn invalidate_seed(&mut self) {
        self.seed.zeroize();
        self.seed_valid = false;
    }

    pub fn invalidate_pin(&mut self) {
        self.pin_ok = false;
    }
}
