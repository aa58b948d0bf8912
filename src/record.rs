//! C2: Record Codec.
//!
//! A direct structural mapping of the Storage record (§3/§4.1): fixed
//! layout, presence bit ahead of every optional field, fixed-capacity
//! NUL-terminated strings and length-prefixed blobs. This is not a
//! variable-length wire format — every record, present or not, occupies
//! the same number of bytes, the way the teacher's `UserConfig` occupies
//! a fixed slot in flash regardless of which fields a user actually set.

use zeroize::Zeroize;

pub const STORAGE_VERSION: u32 = 0x0001_0001;
pub const MAGIC: u32 = 0x726f_7473;

pub const MNEMONIC_CAP: usize = 241;
pub const PIN_CAP: usize = 10;
pub const LANGUAGE_CAP: usize = 17;
pub const LABEL_CAP: usize = 33;
pub const HOMESCREEN_LEN: usize = 1024;

/// `m/10022'/0x55324653'`
pub const U2F_KEY_PATH: [u32; 2] = [0x8000_2732, 0x5532_4653];
pub const HD_NODE_ENC_PASSWORD: &[u8] = b"TREZORHD";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Curve {
    Secp256k1,
    Nist256p1,
}

/// BIP-0032 hierarchical-deterministic key material. `private_key` is
/// zeroized on drop since it is always secret when present.
#[derive(Clone, Copy, Zeroize)]
#[zeroize(drop)]
pub struct HdNode {
    pub depth: u32,
    pub fingerprint: u32,
    pub child_num: u32,
    pub chain_code: [u8; 32],
    pub has_private_key: bool,
    pub private_key: [u8; 32],
}

impl Default for HdNode {
    fn default() -> Self {
        HdNode {
            depth: 0,
            fingerprint: 0,
            child_num: 0,
            chain_code: [0u8; 32],
            has_private_key: false,
            private_key: [0u8; 32],
        }
    }
}

/// A length-tagged fixed-capacity blob, used for the homescreen bitmap.
#[derive(Clone, Copy)]
pub struct Blob<const N: usize> {
    pub size: u32,
    pub bytes: [u8; N],
}

impl<const N: usize> Default for Blob<N> {
    fn default() -> Self {
        Blob { size: 0, bytes: [0u8; N] }
    }
}

impl<const N: usize> Blob<N> {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.size as usize]
    }

    pub fn set(&mut self, data: &[u8]) -> bool {
        if data.len() > N {
            return false;
        }
        self.bytes[..data.len()].copy_from_slice(data);
        self.bytes[data.len()..].fill(0);
        self.size = data.len() as u32;
        true
    }
}

/// A NUL-terminated, fixed-capacity ASCII/UTF-8 string (the mnemonic,
/// PIN digits, label and language fields all take this shape). The
/// buffer always carries a trailing NUL within its capacity; `len()` is
/// the length up to (not including) that NUL.
#[derive(Clone, Copy)]
pub struct FixedStr<const N: usize> {
    pub buf: [u8; N],
}

impl<const N: usize> Default for FixedStr<N> {
    fn default() -> Self {
        FixedStr { buf: [0u8; N] }
    }
}

impl<const N: usize> FixedStr<N> {
    pub fn len(&self) -> usize {
        self.buf.iter().position(|&b| b == 0).unwrap_or(N)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len()]).unwrap_or("")
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len()]
    }

    /// Returns `false` (and leaves the buffer untouched) if `s` plus its
    /// NUL terminator does not fit.
    pub fn set(&mut self, s: &str) -> bool {
        let bytes = s.as_bytes();
        if bytes.len() >= N {
            return false;
        }
        self.buf.fill(0);
        self.buf[..bytes.len()].copy_from_slice(bytes);
        true
    }
}

impl<const N: usize> Zeroize for FixedStr<N> {
    fn zeroize(&mut self) {
        self.buf.zeroize();
    }
}

/// The Storage record (rom snapshot or staged update — both use the
/// same shape, per §2's "update record shadows the rom record"). Every
/// field that the original firmware's wire schema marks optional carries
/// its own `has_X` presence bit, including the ones whose prose in §3 is
/// terse about it (`imported`, `u2f_counter`, `needs_backup`, `flags`,
/// `passphrase_protection`): on the staged update record the presence
/// bit means "the caller touched this field this round", which is what
/// lets the merge in `commit.rs` tell "leave alone" apart from "set to
/// its current value". `zone_is_initialized` is the one field with no
/// presence bit — it is always meaningful, never optional.
#[derive(Clone, Copy)]
pub struct StorageRecord {
    pub version: u32,

    pub has_node: bool,
    pub node: HdNode,

    pub has_mnemonic: bool,
    pub mnemonic: FixedStr<MNEMONIC_CAP>,

    pub has_passphrase_protection: bool,
    pub passphrase_protection: bool,

    pub has_pin: bool,
    pub pin: FixedStr<{ PIN_CAP + 1 }>,

    /// Legacy (version <= 5) PIN failure counter. Versions from 6 onward
    /// keep failures in the PIN-fail flash area's bit-clearing encoding
    /// instead (§4.3/§4.5); this field is only ever non-absent on a
    /// record decoded from a pre-6 image, and every commit clears it, so
    /// it reads as a one-shot migration input rather than live state.
    pub has_pin_failed_attempts: bool,
    pub pin_failed_attempts: u32,

    pub has_language: bool,
    pub language: FixedStr<LANGUAGE_CAP>,

    pub has_label: bool,
    pub label: FixedStr<LABEL_CAP>,

    pub has_imported: bool,
    pub imported: bool,

    pub has_homescreen: bool,
    pub homescreen: Blob<HOMESCREEN_LEN>,

    pub has_u2f_counter: bool,
    pub u2f_counter: u32,

    pub has_needs_backup: bool,
    pub needs_backup: bool,

    pub has_flags: bool,
    pub flags: u32,

    pub has_u2froot: bool,
    pub u2froot: HdNode,

    pub zone_is_initialized: bool,
}

impl Default for StorageRecord {
    fn default() -> Self {
        StorageRecord {
            version: STORAGE_VERSION,
            has_node: false,
            node: HdNode::default(),
            has_mnemonic: false,
            mnemonic: FixedStr::default(),
            has_passphrase_protection: false,
            passphrase_protection: false,
            has_pin: false,
            pin: FixedStr::default(),
            has_pin_failed_attempts: false,
            pin_failed_attempts: 0,
            has_language: false,
            language: FixedStr::default(),
            has_label: false,
            label: FixedStr::default(),
            has_imported: false,
            imported: false,
            has_homescreen: false,
            homescreen: Blob::default(),
            has_u2f_counter: false,
            u2f_counter: 0,
            has_needs_backup: false,
            needs_backup: false,
            has_flags: false,
            flags: 0,
            has_u2froot: false,
            u2froot: HdNode::default(),
            zone_is_initialized: false,
        }
    }
}

impl Zeroize for StorageRecord {
    fn zeroize(&mut self) {
        self.node.zeroize();
        self.mnemonic.zeroize();
        self.pin.zeroize();
        self.u2froot.zeroize();
    }
}

/// Byte-exact size of the encoded record image (excluding magic/uuid).
/// Computed, not hand-maintained, so the `FLASH_STORAGE_START + sizeof
/// <= 0x4000` constraint (§4.1) stays checkable against any geometry.
pub const RECORD_IMAGE_LEN: usize = {
    4 // version
    + 1 + hdnode_len()  // has_node + node
    + 1 + MNEMONIC_CAP  // has_mnemonic + mnemonic
    + 1 + 1             // has_passphrase_protection + passphrase_protection
    + 1 + (PIN_CAP + 1) // has_pin + pin
    + 1 + 4             // has_pin_failed_attempts + pin_failed_attempts (legacy)
    + 1 + LANGUAGE_CAP  // has_language + language
    + 1 + LABEL_CAP     // has_label + label
    + 1 + 1             // has_imported + imported
    + 1 + 4 + HOMESCREEN_LEN // has_homescreen + size + bytes
    + 1 + 4             // has_u2f_counter + u2f_counter
    + 1 + 1             // has_needs_backup + needs_backup
    + 1 + 4             // has_flags + flags
    + 1 + hdnode_len()  // has_u2froot + u2froot
    + 1                 // zone_is_initialized
};

const fn hdnode_len() -> usize {
    4 + 4 + 4 + 32 + 1 + 32
}

/// A small byte cursor, written the way the teacher's `flash::write`
/// builds up 32-bit words from a byte slice: explicit indices, no
/// `unsafe`, no reliance on struct layout/padding.
struct Writer<'a> {
    out: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(out: &'a mut [u8]) -> Self {
        Writer { out, pos: 0 }
    }

    fn u32(&mut self, v: u32) {
        self.out[self.pos..self.pos + 4].copy_from_slice(&v.to_le_bytes());
        self.pos += 4;
    }

    fn bool_(&mut self, v: bool) {
        self.out[self.pos] = v as u8;
        self.pos += 1;
    }

    fn bytes(&mut self, v: &[u8]) {
        self.out[self.pos..self.pos + v.len()].copy_from_slice(v);
        self.pos += v.len();
    }

    fn hdnode(&mut self, n: &HdNode) {
        self.u32(n.depth);
        self.u32(n.fingerprint);
        self.u32(n.child_num);
        self.bytes(&n.chain_code);
        self.bool_(n.has_private_key);
        self.bytes(&n.private_key);
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(self.data[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        v
    }

    fn bool_(&mut self) -> bool {
        let v = self.data[self.pos] != 0;
        self.pos += 1;
        v
    }

    fn bytes(&mut self, n: usize) -> &'a [u8] {
        let v = &self.data[self.pos..self.pos + n];
        self.pos += n;
        v
    }

    fn fixed<const N: usize>(&mut self) -> FixedStr<N> {
        let mut s = FixedStr::<N>::default();
        s.buf.copy_from_slice(self.bytes(N));
        s
    }

    fn hdnode(&mut self) -> HdNode {
        let depth = self.u32();
        let fingerprint = self.u32();
        let child_num = self.u32();
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(self.bytes(32));
        let has_private_key = self.bool_();
        let mut private_key = [0u8; 32];
        private_key.copy_from_slice(self.bytes(32));
        HdNode { depth, fingerprint, child_num, chain_code, has_private_key, private_key }
    }
}

impl StorageRecord {
    /// Encode into `out`, which must be at least `RECORD_IMAGE_LEN` bytes.
    pub fn encode(&self, out: &mut [u8]) {
        let mut w = Writer::new(out);
        w.u32(self.version);
        w.bool_(self.has_node);
        w.hdnode(&self.node);
        w.bool_(self.has_mnemonic);
        w.bytes(&self.mnemonic.buf);
        w.bool_(self.has_passphrase_protection);
        w.bool_(self.passphrase_protection);
        w.bool_(self.has_pin);
        w.bytes(&self.pin.buf);
        w.bool_(self.has_pin_failed_attempts);
        w.u32(self.pin_failed_attempts);
        w.bool_(self.has_language);
        w.bytes(&self.language.buf);
        w.bool_(self.has_label);
        w.bytes(&self.label.buf);
        w.bool_(self.has_imported);
        w.bool_(self.imported);
        w.bool_(self.has_homescreen);
        w.u32(self.homescreen.size);
        w.bytes(&self.homescreen.bytes);
        w.bool_(self.has_u2f_counter);
        w.u32(self.u2f_counter);
        w.bool_(self.has_needs_backup);
        w.bool_(self.needs_backup);
        w.bool_(self.has_flags);
        w.u32(self.flags);
        w.bool_(self.has_u2froot);
        w.hdnode(&self.u2froot);
        w.bool_(self.zone_is_initialized);
    }

    /// Decode a record image of exactly `RECORD_IMAGE_LEN` bytes.
    pub fn decode(data: &[u8]) -> StorageRecord {
        let mut r = Reader::new(data);
        let version = r.u32();
        let has_node = r.bool_();
        let node = r.hdnode();
        let has_mnemonic = r.bool_();
        let mnemonic = r.fixed::<MNEMONIC_CAP>();
        let has_passphrase_protection = r.bool_();
        let passphrase_protection = r.bool_();
        let has_pin = r.bool_();
        let pin = r.fixed::<{ PIN_CAP + 1 }>();
        let has_pin_failed_attempts = r.bool_();
        let pin_failed_attempts = r.u32();
        let has_language = r.bool_();
        let language = r.fixed::<LANGUAGE_CAP>();
        let has_label = r.bool_();
        let label = r.fixed::<LABEL_CAP>();
        let has_imported = r.bool_();
        let imported = r.bool_();
        let has_homescreen = r.bool_();
        let size = r.u32();
        let mut homescreen = Blob::<HOMESCREEN_LEN>::default();
        homescreen.size = size;
        homescreen.bytes.copy_from_slice(r.bytes(HOMESCREEN_LEN));
        let has_u2f_counter = r.bool_();
        let u2f_counter = r.u32();
        let has_needs_backup = r.bool_();
        let needs_backup = r.bool_();
        let has_flags = r.bool_();
        let flags = r.u32();
        let has_u2froot = r.bool_();
        let u2froot = r.hdnode();
        let zone_is_initialized = r.bool_();
        StorageRecord {
            version,
            has_node,
            node,
            has_mnemonic,
            mnemonic,
            has_passphrase_protection,
            passphrase_protection,
            has_pin,
            pin,
            has_pin_failed_attempts,
            pin_failed_attempts,
            has_language,
            language,
            has_label,
            label,
            has_imported,
            imported,
            has_homescreen,
            homescreen,
            has_u2f_counter,
            u2f_counter,
            has_needs_backup,
            needs_backup,
            has_flags,
            flags,
            has_u2froot,
            u2froot,
            zone_is_initialized,
        }
    }
}

/// Normalises the legacy `"english"` alias to `"EN"` (§3).
pub fn normalize_language(lang: &str) -> &str {
    if lang.eq_ignore_ascii_case("english") {
        "EN"
    } else {
        lang
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_empty_record() {
        let rec = StorageRecord::default();
        let mut buf = [0u8; RECORD_IMAGE_LEN];
        rec.encode(&mut buf);
        let back = StorageRecord::decode(&buf);
        assert_eq!(back.version, STORAGE_VERSION);
        assert!(!back.has_node);
        assert!(!back.has_mnemonic);
        assert!(back.mnemonic.is_empty());
    }

    #[test]
    fn round_trip_populated_record() {
        let mut rec = StorageRecord::default();
        rec.has_mnemonic = true;
        assert!(rec.mnemonic.set("abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about"));
        rec.has_pin = true;
        assert!(rec.pin.set("1234"));
        rec.has_label = true;
        assert!(rec.label.set("my wallet"));
        rec.has_flags = true;
        rec.flags = 0x5;
        rec.has_u2f_counter = true;
        rec.u2f_counter = 42;
        rec.has_node = true;
        rec.node.has_private_key = true;
        rec.node.private_key = [7u8; 32];
        rec.node.chain_code = [9u8; 32];
        rec.node.depth = 3;

        let mut buf = [0u8; RECORD_IMAGE_LEN];
        rec.encode(&mut buf);
        let back = StorageRecord::decode(&buf);

        assert_eq!(back.mnemonic.as_str(), rec.mnemonic.as_str());
        assert_eq!(back.pin.as_str(), "1234");
        assert_eq!(back.label.as_str(), "my wallet");
        assert!(back.has_flags);
        assert_eq!(back.flags, 0x5);
        assert!(back.has_u2f_counter);
        assert_eq!(back.u2f_counter, 42);
        assert_eq!(back.node.private_key, [7u8; 32]);
        assert_eq!(back.node.chain_code, [9u8; 32]);
        assert_eq!(back.node.depth, 3);
    }

    #[test]
    fn empty_string_demotes_presence_is_caller_responsibility() {
        // The codec itself is agnostic to the merge-policy demotion rule
        // (§4.2); it only needs to round-trip whatever has_X + payload
        // the committer hands it.
        let mut rec = StorageRecord::default();
        rec.has_label = true;
        assert!(rec.label.set(""));
        assert!(rec.label.is_empty());
    }

    #[test]
    fn normalizes_legacy_english_alias() {
        assert_eq!(normalize_language("english"), "EN");
        assert_eq!(normalize_language("English"), "EN");
        assert_eq!(normalize_language("FR"), "FR");
    }
}
