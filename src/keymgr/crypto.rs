//! Cryptographic building blocks for the key manager.
//!
//! Design notes:
//!
//! - KDF: Argon2id derives `kdf_out` from the cluster passphrase; HKDF-SHA512
//!   expands it into the KEK pair (a 32-byte encryption key plus a 64-byte
//!   MAC key). The salt and expansion label are build constants, so the same
//!   passphrase always yields the same pair; there is no per-cluster salt to
//!   persist alongside the fixed-size key records.
//! - Wrapping: encrypt-then-MAC. XChaCha20 under the encryption key with a
//!   fresh random 24-byte IV, then HMAC-SHA512 under the MAC key over
//!   `IV || ciphertext`. Output layout is `IV || ciphertext || tag`.
//! - The MAC tag doubles as the passphrase-correctness oracle: unwrapping
//!   with a KEK derived from the wrong passphrase fails tag verification, so
//!   no plaintext verifier is ever stored.
//!
//! Security foot-guns to avoid:
//!
//! - Never log or print passphrases, derived keys, or key plaintexts.
//! - Treat unwrapped key bytes as sensitive; all owning types here zeroize
//!   on drop.

use argon2::{Algorithm, Argon2, Params as Argon2Params, Version};
use chacha20::XChaCha20;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::SecretSlice;
use sha2::Sha512;
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::MAX_KEY_LEN;

/// Size (bytes) of the KEK encryption key.
pub const ENC_KEY_LEN: usize = 32;
/// Size (bytes) of the KEK MAC key.
pub const MAC_KEY_LEN: usize = 64;
/// Output size (bytes) of Argon2id before HKDF expansion.
const KDF_OUT_LEN: usize = 32;

/// Size (bytes) of the XChaCha20 IV prepended to every wrapped key.
pub const WRAP_IV_LEN: usize = 24;
/// Size (bytes) of the HMAC-SHA512 tag appended to every wrapped key.
pub const WRAP_TAG_LEN: usize = 64;
/// Total expansion of a key blob when wrapped.
pub const WRAP_EXPAND: usize = WRAP_IV_LEN + WRAP_TAG_LEN;
/// Capacity of a key buffer, large enough for any wrapped internal key.
pub const WRAPPED_KEY_MAX_LEN: usize = MAX_KEY_LEN + WRAP_EXPAND;

/// Fixed KDF salt. Keys are location-bound by the data directory rather than
/// a stored salt; determinism across bootstrap and every later startup is
/// the requirement here.
const KDF_SALT: &[u8] = b"clusterkey.kek.v1";

/// HKDF `info` label for expanding `kdf_out` into the KEK pair.
///
/// Provides domain separation from other keys we may derive later.
const HKDF_INFO_KEK_PAIR: &[u8] = b"clusterkey/kek/v1/pair";

/// Secret bytes held in memory with zeroize-on-drop semantics.
pub type SecretBytes = SecretSlice<u8>;

type HmacSha512 = Hmac<Sha512>;

/// Argon2id tuning parameters.
///
/// Not persisted: the wrapped-key records carry no header, so the active
/// parameter set is a process-wide constant. A cluster bootstrapped with one
/// set must always start with the same set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

/// Environment variable selecting the cheap KDF parameters for tests.
pub const TEST_KDF_ENV: &str = "CLUSTERKEY_TEST_KDF";

impl KdfParams {
    /// Recommended parameters for a server-side, once-per-start derivation.
    pub fn recommended() -> Self {
        Self {
            memory_kib: 128 * 1024,
            iterations: 3,
            parallelism: 1,
        }
    }

    pub fn for_tests() -> Self {
        Self {
            memory_kib: 16 * 1024,
            iterations: 1,
            parallelism: 1,
        }
    }

    /// The parameter set in effect for this process.
    pub fn active() -> Self {
        if std::env::var_os(TEST_KDF_ENV).is_some() {
            Self::for_tests()
        } else {
            Self::recommended()
        }
    }

    fn to_argon2_params(self, output_len: usize) -> Result<Argon2Params, CryptoError> {
        Ok(Argon2Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(output_len),
        )?)
    }
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key length {0} out of range")]
    InvalidKeyLength(usize),

    #[error("could not initialize wrap cipher")]
    Init,

    #[error("argon2 error")]
    Argon2(#[from] argon2::Error),

    #[error("hkdf error")]
    Hkdf,

    #[error("key authentication failed")]
    Auth,
}

/// One internal key record, plaintext or wrapped.
///
/// A fixed-capacity buffer plus the number of bytes in use. The same shape
/// serves both forms: a plaintext DEK occupies `KEY_LENGTHS[id]` bytes, its
/// wrapped form `KEY_LENGTHS[id] + WRAP_EXPAND`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CryptoKey {
    len: usize,
    bytes: [u8; WRAPPED_KEY_MAX_LEN],
}

impl CryptoKey {
    pub fn from_slice(data: &[u8]) -> Result<Self, CryptoError> {
        if data.is_empty() || data.len() > WRAPPED_KEY_MAX_LEN {
            return Err(CryptoError::InvalidKeyLength(data.len()));
        }
        let mut bytes = [0u8; WRAPPED_KEY_MAX_LEN];
        bytes[..data.len()].copy_from_slice(data);
        Ok(Self {
            len: data.len(),
            bytes,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

// Key material stays out of debug output.
impl fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoKey")
            .field("len", &self.len)
            .field("bytes", &"<redacted>")
            .finish()
    }
}

/// The KEK pair derived from the cluster passphrase.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KekPair {
    enc: [u8; ENC_KEY_LEN],
    mac: [u8; MAC_KEY_LEN],
}

/// Generate `N` cryptographically-secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Generate a fresh internal key of `len` bytes.
pub fn generate_key(len: usize) -> Result<CryptoKey, CryptoError> {
    if len == 0 || len > MAX_KEY_LEN {
        return Err(CryptoError::InvalidKeyLength(len));
    }
    let mut buf = Zeroizing::new([0u8; MAX_KEY_LEN]);
    OsRng.fill_bytes(&mut buf[..len]);
    CryptoKey::from_slice(&buf[..len])
}

/// Derive the KEK pair from the cluster passphrase.
///
/// Deterministic for a given passphrase and parameter set; trailing bytes of
/// the passphrase (newlines included) are significant.
pub fn derive_kek_pair(passphrase: &[u8], params: KdfParams) -> Result<KekPair, CryptoError> {
    let argon2_params = params.to_argon2_params(KDF_OUT_LEN)?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut kdf_out = Zeroizing::new([0u8; KDF_OUT_LEN]);
    argon2.hash_password_into(passphrase, KDF_SALT, kdf_out.as_mut())?;

    let hk = Hkdf::<Sha512>::new(None, kdf_out.as_ref());
    let mut okm = Zeroizing::new([0u8; ENC_KEY_LEN + MAC_KEY_LEN]);
    hk.expand(HKDF_INFO_KEK_PAIR, okm.as_mut())
        .map_err(|_| CryptoError::Hkdf)?;

    let mut pair = KekPair {
        enc: [0u8; ENC_KEY_LEN],
        mac: [0u8; MAC_KEY_LEN],
    };
    pair.enc.copy_from_slice(&okm[..ENC_KEY_LEN]);
    pair.mac.copy_from_slice(&okm[ENC_KEY_LEN..]);
    Ok(pair)
}

/// Authenticated wrap/unwrap context bound to one KEK pair.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct WrapCipher {
    enc_key: [u8; ENC_KEY_LEN],
    mac_key: [u8; MAC_KEY_LEN],
}

impl WrapCipher {
    pub fn new(kek: &KekPair) -> Result<Self, CryptoError> {
        // Fail construction, not every wrap, if the MAC primitive rejects
        // the key.
        HmacSha512::new_from_slice(&kek.mac).map_err(|_| CryptoError::Init)?;
        Ok(Self {
            enc_key: kek.enc,
            mac_key: kek.mac,
        })
    }

    /// Wrap a plaintext key: `IV || XChaCha20(plaintext) || HMAC(IV || ct)`.
    pub fn wrap(&self, plain: &CryptoKey) -> Result<CryptoKey, CryptoError> {
        let plen = plain.len();
        if plen > MAX_KEY_LEN {
            return Err(CryptoError::InvalidKeyLength(plen));
        }

        let iv = random_bytes::<WRAP_IV_LEN>();
        let mut ct = Zeroizing::new([0u8; MAX_KEY_LEN]);
        ct[..plen].copy_from_slice(plain.as_bytes());
        let mut cipher = XChaCha20::new(&self.enc_key.into(), &iv.into());
        cipher.apply_keystream(&mut ct[..plen]);

        let tag = self.compute_tag(&iv, &ct[..plen])?;

        let mut out = [0u8; WRAPPED_KEY_MAX_LEN];
        out[..WRAP_IV_LEN].copy_from_slice(&iv);
        out[WRAP_IV_LEN..WRAP_IV_LEN + plen].copy_from_slice(&ct[..plen]);
        out[WRAP_IV_LEN + plen..WRAP_IV_LEN + plen + WRAP_TAG_LEN].copy_from_slice(&tag);
        CryptoKey::from_slice(&out[..plen + WRAP_EXPAND])
    }

    /// Unwrap a wrapped key, verifying the tag first.
    ///
    /// `CryptoError::Auth` is the expected outcome for a wrong passphrase or
    /// a tampered record; callers treat it as a verdict, not a fault.
    pub fn unwrap(&self, wrapped: &CryptoKey) -> Result<CryptoKey, CryptoError> {
        let clen = wrapped.len();
        if clen < WRAP_EXPAND {
            return Err(CryptoError::Auth);
        }
        let plen = clen - WRAP_EXPAND;

        let bytes = wrapped.as_bytes();
        let (iv, rest) = bytes.split_at(WRAP_IV_LEN);
        let (ct, tag) = rest.split_at(plen);

        let mut mac = HmacSha512::new_from_slice(&self.mac_key).map_err(|_| CryptoError::Init)?;
        mac.update(iv);
        mac.update(ct);
        mac.verify_slice(tag).map_err(|_| CryptoError::Auth)?;

        let iv: [u8; WRAP_IV_LEN] = iv.try_into().map_err(|_| CryptoError::Auth)?;
        let mut plain = Zeroizing::new([0u8; MAX_KEY_LEN]);
        plain[..plen].copy_from_slice(ct);
        let mut cipher = XChaCha20::new(&self.enc_key.into(), &iv.into());
        cipher.apply_keystream(&mut plain[..plen]);

        CryptoKey::from_slice(&plain[..plen])
    }

    fn compute_tag(&self, iv: &[u8], ciphertext: &[u8]) -> Result<[u8; WRAP_TAG_LEN], CryptoError> {
        let mut mac = HmacSha512::new_from_slice(&self.mac_key).map_err(|_| CryptoError::Init)?;
        mac.update(iv);
        mac.update(ciphertext);
        let mut tag = [0u8; WRAP_TAG_LEN];
        tag.copy_from_slice(mac.finalize().into_bytes().as_slice());
        Ok(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pair(passphrase: &[u8]) -> KekPair {
        derive_kek_pair(passphrase, KdfParams::for_tests()).unwrap()
    }

    #[test]
    fn wrap_unwrap_roundtrip() {
        let kek = test_pair(b"correct horse battery staple");
        let cipher = WrapCipher::new(&kek).unwrap();

        let key = generate_key(32).unwrap();
        let wrapped = cipher.wrap(&key).unwrap();
        assert_eq!(wrapped.len(), key.len() + WRAP_EXPAND);

        let unwrapped = cipher.unwrap(&wrapped).unwrap();
        assert_eq!(key.as_bytes(), unwrapped.as_bytes());
    }

    #[test]
    fn unwrap_fails_on_tamper() {
        let kek = test_pair(b"pass phrase");
        let cipher = WrapCipher::new(&kek).unwrap();

        let key = generate_key(32).unwrap();
        let wrapped = cipher.wrap(&key).unwrap();

        for corrupt_at in [0, WRAP_IV_LEN, wrapped.len() - 1] {
            let mut bytes = wrapped.as_bytes().to_vec();
            bytes[corrupt_at] ^= 0x01;
            let tampered = CryptoKey::from_slice(&bytes).unwrap();
            assert!(matches!(cipher.unwrap(&tampered), Err(CryptoError::Auth)));
        }
    }

    #[test]
    fn unwrap_fails_under_different_passphrase() {
        let cipher_a = WrapCipher::new(&test_pair(b"first passphrase")).unwrap();
        let cipher_b = WrapCipher::new(&test_pair(b"other passphrase")).unwrap();

        let key = generate_key(32).unwrap();
        let wrapped = cipher_a.wrap(&key).unwrap();
        assert!(matches!(cipher_b.unwrap(&wrapped), Err(CryptoError::Auth)));
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = test_pair(b"same input");
        let b = test_pair(b"same input");
        assert_eq!(a.enc, b.enc);
        assert_eq!(a.mac, b.mac);

        let c = test_pair(b"same input\n");
        assert_ne!(a.enc, c.enc, "trailing newline must change the KEK");
    }

    #[test]
    fn wrapping_twice_differs() {
        // Fresh IV per wrap: same plaintext, same KEK, different blobs.
        let kek = test_pair(b"pass phrase");
        let cipher = WrapCipher::new(&kek).unwrap();

        let key = generate_key(32).unwrap();
        let w1 = cipher.wrap(&key).unwrap();
        let w2 = cipher.wrap(&key).unwrap();
        assert_ne!(w1.as_bytes(), w2.as_bytes());
    }

    #[test]
    fn key_length_bounds_enforced() {
        assert!(generate_key(0).is_err());
        assert!(generate_key(MAX_KEY_LEN + 1).is_err());
        assert!(CryptoKey::from_slice(&[0u8; WRAPPED_KEY_MAX_LEN + 1]).is_err());

        let kek = test_pair(b"pass phrase");
        let cipher = WrapCipher::new(&kek).unwrap();
        let too_short = CryptoKey::from_slice(&[0u8; WRAP_EXPAND - 1]).unwrap();
        assert!(matches!(cipher.unwrap(&too_short), Err(CryptoError::Auth)));
    }
}
