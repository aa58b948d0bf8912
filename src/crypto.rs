//! Cryptographic primitives consumed by the Secret Pipeline (C7) and
//! Secure-Chip Adapter (C8), behind a trait so the core never names a
//! concrete crypto library directly (§6). `RustCryptoBackend` is the
//! bundled implementation, built from the same RustCrypto-family crates
//! the rest of the retrieval pack reaches for (`keystore`/`pddb`'s
//! `sha2`/`hmac`, `hubris`'s stage0 use of `p256`).
//!
//! BIP-0039/BIP-0032 are treated as algorithms to implement against
//! primitives, not as a single opaque library call, because the progress
//! interleaving in §5 requires control over the PBKDF2 round loop that
//! no off-the-shelf one-shot `pbkdf2()` call exposes.

use crate::record::{Curve, HdNode};
use aes::Aes256;
use cipher::{generic_array::GenericArray, BlockEncrypt, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use cipher::block_padding::NoPadding;
use hmac::{Hmac, Mac};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256, Sha512};

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const BIP39_PBKDF2_ROUNDS: u32 = 2048;
const PROGRESS_SLICES: u32 = 8;

/// Cryptographic capability the Secret Pipeline and Secure-Chip Adapter
/// are written against. `progress` is called with `(done, total)` at
/// slice boundaries during the long PBKDF2 derivations, matching §5's
/// eight-slices-with-reporting scheduling rule.
pub trait Crypto {
    fn sha256(&self, data: &[u8]) -> [u8; 32];
    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> [u8; 32];

    fn pbkdf2_hmac_sha512(
        &self,
        password: &[u8],
        salt: &[u8],
        rounds: u32,
        progress: &mut dyn FnMut(u32, u32),
    ) -> [u8; 64];

    fn aes256_cbc_encrypt(&self, key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]);
    fn aes256_cbc_decrypt(&self, key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]);
    fn aes256_ecb_encrypt_block(&self, key: &[u8; 32], block: &mut [u8; 16]);

    fn hdnode_from_seed(&self, seed: &[u8], curve: Curve) -> HdNode;
    /// Private child key derivation at `index` (set bit 31 for
    /// hardened). Returns `false` (leaving `node` untouched) on the
    /// negligible-probability case where the derived scalar is invalid;
    /// BIP-0032 callers are expected to retry at `index + 1`.
    fn hdnode_private_ckd(&self, node: &mut HdNode, index: u32, curve: Curve) -> bool;

    fn mnemonic_to_seed(
        &self,
        mnemonic: &str,
        passphrase: &str,
        progress: &mut dyn FnMut(u32, u32),
    ) -> [u8; 64];
    fn mnemonic_check(&self, mnemonic: &str) -> bool;
}

/// PBKDF2-HMAC-SHA-512 with a 64-byte derived key (one hash block), the
/// only size this core ever needs: both the BIP-0039 seed and the
/// HD-node encryption key+IV are exactly `key=32 || iv/chain=32`. Single
/// block means round `i` only ever updates `U_i`, so progress reporting
/// is just "how many of the `rounds` HMAC applications have run".
fn pbkdf2_hmac_sha512_64(
    password: &[u8],
    salt: &[u8],
    rounds: u32,
    progress: &mut dyn FnMut(u32, u32),
) -> [u8; 64] {
    let mut mac = HmacSha512::new_from_slice(password).expect("HMAC accepts any key length");
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut u: [u8; 64] = mac.finalize_reset().into_bytes().into();
    let mut t = u;
    let mut done = 1u32;
    let slice_size = (rounds / PROGRESS_SLICES).max(1);

    for slice in 0..PROGRESS_SLICES {
        let target = if slice == PROGRESS_SLICES - 1 { rounds } else { ((slice + 1) * slice_size).min(rounds) };
        while done < target {
            mac.update(&u);
            u = mac.finalize_reset().into_bytes().into();
            for i in 0..64 {
                t[i] ^= u[i];
            }
            done += 1;
        }
        progress(done, rounds);
    }
    t
}

fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let rip = Ripemd160::digest(sha);
    rip.into()
}

fn compressed_pubkey_secp256k1(private_key: &[u8; 32]) -> [u8; 33] {
    let sk = k256::SecretKey::from_bytes(GenericArray::from_slice(private_key)).expect("non-zero scalar");
    let point = sk.public_key().to_encoded_point(true);
    let mut out = [0u8; 33];
    out.copy_from_slice(point.as_bytes());
    out
}

fn compressed_pubkey_nist256p1(private_key: &[u8; 32]) -> [u8; 33] {
    let sk = p256::SecretKey::from_bytes(GenericArray::from_slice(private_key)).expect("non-zero scalar");
    let point = sk.public_key().to_encoded_point(true);
    let mut out = [0u8; 33];
    out.copy_from_slice(point.as_bytes());
    out
}

fn scalar_add_secp256k1(a: &[u8; 32], b: &[u8; 32]) -> Option<[u8; 32]> {
    use elliptic_curve::ff::{Field, PrimeField};
    let sa = k256::Scalar::from_repr(*GenericArray::from_slice(a));
    let sb = k256::Scalar::from_repr(*GenericArray::from_slice(b));
    if bool::from(sa.is_none()) || bool::from(sb.is_none()) {
        return None;
    }
    let sum = sa.unwrap() + sb.unwrap();
    if bool::from(sum.is_zero()) {
        return None;
    }
    Some(sum.to_repr().into())
}

fn scalar_add_nist256p1(a: &[u8; 32], b: &[u8; 32]) -> Option<[u8; 32]> {
    use elliptic_curve::ff::{Field, PrimeField};
    let sa = p256::Scalar::from_repr(*GenericArray::from_slice(a));
    let sb = p256::Scalar::from_repr(*GenericArray::from_slice(b));
    if bool::from(sa.is_none()) || bool::from(sb.is_none()) {
        return None;
    }
    let sum = sa.unwrap() + sb.unwrap();
    if bool::from(sum.is_zero()) {
        return None;
    }
    Some(sum.to_repr().into())
}

/// Default `Crypto` implementation, built entirely on RustCrypto-family
/// crates. Stateless; firmware integrators with a hardware crypto
/// engine implement `Crypto` themselves instead of constructing this.
#[derive(Default)]
pub struct RustCryptoBackend;

impl Crypto for RustCryptoBackend {
    fn sha256(&self, data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    fn pbkdf2_hmac_sha512(
        &self,
        password: &[u8],
        salt: &[u8],
        rounds: u32,
        progress: &mut dyn FnMut(u32, u32),
    ) -> [u8; 64] {
        pbkdf2_hmac_sha512_64(password, salt, rounds, progress)
    }

    fn aes256_cbc_encrypt(&self, key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]) {
        let enc = Aes256CbcEnc::new(key.into(), iv.into());
        enc.encrypt_padded_mut::<NoPadding>(data, data.len()).expect("data is block-aligned");
    }

    fn aes256_cbc_decrypt(&self, key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]) {
        let dec = Aes256CbcDec::new(key.into(), iv.into());
        dec.decrypt_padded_mut::<NoPadding>(data).expect("data is block-aligned");
    }

    fn aes256_ecb_encrypt_block(&self, key: &[u8; 32], block: &mut [u8; 16]) {
        let cipher = Aes256::new(GenericArray::from_slice(key));
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }

    fn hdnode_from_seed(&self, seed: &[u8], curve: Curve) -> HdNode {
        let seed_key: &[u8] = match curve {
            Curve::Secp256k1 => b"Bitcoin seed",
            Curve::Nist256p1 => b"Nist256p1 seed",
        };
        let mut mac = HmacSha512::new_from_slice(seed_key).expect("HMAC accepts any key length");
        mac.update(seed);
        let i: [u8; 64] = mac.finalize().into_bytes().into();
        let mut private_key = [0u8; 32];
        let mut chain_code = [0u8; 32];
        private_key.copy_from_slice(&i[..32]);
        chain_code.copy_from_slice(&i[32..]);
        HdNode {
            depth: 0,
            fingerprint: 0,
            child_num: 0,
            chain_code,
            has_private_key: true,
            private_key,
        }
    }

    fn hdnode_private_ckd(&self, node: &mut HdNode, index: u32, curve: Curve) -> bool {
        if !node.has_private_key {
            return false;
        }
        let hardened = index & 0x8000_0000 != 0;
        let mut mac = HmacSha512::new_from_slice(&node.chain_code).expect("HMAC accepts any key length");
        if hardened {
            mac.update(&[0u8]);
            mac.update(&node.private_key);
        } else {
            let pubkey = match curve {
                Curve::Secp256k1 => compressed_pubkey_secp256k1(&node.private_key),
                Curve::Nist256p1 => compressed_pubkey_nist256p1(&node.private_key),
            };
            mac.update(&pubkey);
        }
        mac.update(&index.to_be_bytes());
        let i: [u8; 64] = mac.finalize().into_bytes().into();
        let il: [u8; 32] = i[..32].try_into().unwrap();
        let ir: [u8; 32] = i[32..].try_into().unwrap();

        let fingerprint_source = match curve {
            Curve::Secp256k1 => compressed_pubkey_secp256k1(&node.private_key),
            Curve::Nist256p1 => compressed_pubkey_nist256p1(&node.private_key),
        };
        let fingerprint = u32::from_be_bytes(hash160(&fingerprint_source)[..4].try_into().unwrap());

        let new_private_key = match curve {
            Curve::Secp256k1 => scalar_add_secp256k1(&il, &node.private_key),
            Curve::Nist256p1 => scalar_add_nist256p1(&il, &node.private_key),
        };
        let Some(new_private_key) = new_private_key else {
            return false;
        };

        node.depth += 1;
        node.fingerprint = fingerprint;
        node.child_num = index;
        node.chain_code = ir;
        node.private_key = new_private_key;
        true
    }

    fn mnemonic_to_seed(
        &self,
        mnemonic: &str,
        passphrase: &str,
        progress: &mut dyn FnMut(u32, u32),
    ) -> [u8; 64] {
        let mut salt = [0u8; 8 + 51];
        salt[..8].copy_from_slice(b"mnemonic");
        let pass_bytes = passphrase.as_bytes();
        salt[8..8 + pass_bytes.len()].copy_from_slice(pass_bytes);
        pbkdf2_hmac_sha512_64(mnemonic.as_bytes(), &salt[..8 + pass_bytes.len()], BIP39_PBKDF2_ROUNDS, progress)
    }

    fn mnemonic_check(&self, mnemonic: &str) -> bool {
        bip39::Mnemonic::parse_in_normalized(bip39::Language::English, mnemonic).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_vector() {
        let backend = RustCryptoBackend;
        let digest = backend.sha256(b"abc");
        assert_eq!(
            digest,
            [
                0xba, 0x78, 0x16, 0xbf, 0x8f, 0x01, 0xcf, 0xea, 0x41, 0x41, 0x40, 0xde, 0x5d, 0xae,
                0x22, 0x23, 0xb0, 0x03, 0x61, 0xa3, 0x96, 0x17, 0x7a, 0x9c, 0xb4, 0x10, 0xff, 0x61,
                0xf2, 0x00, 0x15, 0xad
            ]
        );
    }

    #[test]
    fn pbkdf2_reports_eight_progress_slices() {
        let backend = RustCryptoBackend;
        let mut slices_seen = 0u32;
        let mut last_total = 0u32;
        backend.pbkdf2_hmac_sha512(b"pw", b"salt", BIP39_PBKDF2_ROUNDS, &mut |_done, total| {
            slices_seen += 1;
            last_total = total;
        });
        assert_eq!(slices_seen, PROGRESS_SLICES);
        assert_eq!(last_total, BIP39_PBKDF2_ROUNDS);
    }

    #[test]
    fn mnemonic_to_seed_matches_bip39_test_vector() {
        let backend = RustCryptoBackend;
        let mnemonic = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
        let mut calls = 0;
        let seed = backend.mnemonic_to_seed(mnemonic, "", &mut |_, _| calls += 1);
        assert!(calls > 0);
        // Known BIP-0039 test vector for the all-"abandon"+"about" phrase.
        assert_eq!(
            seed[0..4],
            [0x5e, 0xb0, 0x0b, 0xbd]
        );
    }

    #[test]
    fn mnemonic_check_accepts_valid_and_rejects_garbage() {
        let backend = RustCryptoBackend;
        assert!(backend.mnemonic_check(
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about"
        ));
        assert!(!backend.mnemonic_check("not a valid bip39 mnemonic at all"));
    }

    #[test]
    fn hdnode_from_seed_then_ckd_advances_depth() {
        let backend = RustCryptoBackend;
        let seed = [0x42u8; 64];
        let mut node = backend.hdnode_from_seed(&seed, Curve::Secp256k1);
        assert_eq!(node.depth, 0);
        let ok = backend.hdnode_private_ckd(&mut node, 0x8000_0000, Curve::Secp256k1);
        assert!(ok);
        assert_eq!(node.depth, 1);
        assert_eq!(node.child_num, 0x8000_0000);
    }

    #[test]
    fn aes256_cbc_round_trips() {
        let backend = RustCryptoBackend;
        let key = [7u8; 32];
        let iv = [9u8; 16];
        let mut data = *b"0123456789abcdef0123456789abcdef";
        let original = data;
        backend.aes256_cbc_encrypt(&key, &iv, &mut data);
        assert_ne!(data, original);
        backend.aes256_cbc_decrypt(&key, &iv, &mut data);
        assert_eq!(data, original);
    }
}
