//! Boundary to the primitive cryptography the engine relies on.
//!
//! Everything above this module talks to primitives through
//! [`CryptoProvider`], passing fixed-size buffers whose lengths have already
//! been checked. [`SoftwareCrypto`] is the pure-software implementation.

mod software;
pub use software::SoftwareCrypto;

use crate::Error;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Length of an X25519 scalar, point or shared secret.
pub const X25519_KEY_LEN: usize = 32;
/// Length of an Ed25519 public key.
pub const ED25519_PUBLIC_LEN: usize = 32;
/// Length of an Ed25519 keypair encoding (seed followed by public key).
pub const ED25519_KEYPAIR_LEN: usize = 64;
/// Length of an Ed25519 signature.
pub const ED25519_SIGNATURE_LEN: usize = 64;
/// Length of the AEAD key.
pub const AEAD_KEY_LEN: usize = 32;
/// Length of the AEAD nonce.
pub const AEAD_NONCE_LEN: usize = 12;

/// Shared handle to the provider used by every component of one engine.
pub type SharedProvider = Arc<dyn CryptoProvider>;

/// Synchronous primitive operations over fixed-size buffers.
///
/// Implementations report failure through [`Error`] and never panic.
pub trait CryptoProvider: Send + Sync {
    /// Fills `out` from a cryptographically secure source.
    fn random_bytes(&self, out: &mut [u8]) -> Result<(), Error>;

    /// Computes the X25519 public key for `secret`.
    fn x25519_public(&self, secret: &[u8; X25519_KEY_LEN]) -> Result<[u8; X25519_KEY_LEN], Error>;

    /// X25519 scalar multiplication. Rejects non-contributory peer keys.
    fn x25519_dh(
        &self,
        secret: &[u8; X25519_KEY_LEN],
        public: &[u8; X25519_KEY_LEN],
    ) -> Result<Zeroizing<[u8; X25519_KEY_LEN]>, Error>;

    /// Expands a 32-byte seed into an Ed25519 keypair encoding and its public key.
    fn ed25519_from_seed(
        &self,
        seed: &[u8; 32],
    ) -> Result<(Zeroizing<[u8; ED25519_KEYPAIR_LEN]>, [u8; ED25519_PUBLIC_LEN]), Error>;

    /// Signs `message` with an Ed25519 keypair encoding.
    fn ed25519_sign(
        &self,
        keypair: &[u8; ED25519_KEYPAIR_LEN],
        message: &[u8],
    ) -> Result<[u8; ED25519_SIGNATURE_LEN], Error>;

    /// Strict Ed25519 verification. Malformed public keys verify as `false`.
    fn ed25519_verify(
        &self,
        public: &[u8; ED25519_PUBLIC_LEN],
        message: &[u8],
        signature: &[u8; ED25519_SIGNATURE_LEN],
    ) -> Result<bool, Error>;

    /// HKDF-SHA256 extract-and-expand into `out`.
    fn hkdf_sha256(
        &self,
        salt: Option<&[u8]>,
        ikm: &[u8],
        info: &[u8],
        out: &mut [u8],
    ) -> Result<(), Error>;

    /// HMAC-SHA256 of `data` under `key`.
    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> Result<Zeroizing<[u8; 32]>, Error>;

    /// AEAD encryption; the returned ciphertext carries the tag.
    fn aead_seal(
        &self,
        key: &[u8; AEAD_KEY_LEN],
        nonce: &[u8; AEAD_NONCE_LEN],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, Error>;

    /// AEAD decryption. Authentication failure is [`Error::Decrypt`].
    fn aead_open(
        &self,
        key: &[u8; AEAD_KEY_LEN],
        nonce: &[u8; AEAD_NONCE_LEN],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, Error>;

    /// Exercises every primitive once. Run before the engine is used.
    fn self_test(&self) -> Result<(), Error> {
        let alice = [0x11u8; 32];
        let bob = [0x22u8; 32];
        let alice_public = self.x25519_public(&alice)?;
        let bob_public = self.x25519_public(&bob)?;
        if *self.x25519_dh(&alice, &bob_public)? != *self.x25519_dh(&bob, &alice_public)? {
            return Err(Error::Provider("x25519 agreement mismatch".to_string()));
        }

        let (keypair, public) = self.ed25519_from_seed(&alice)?;
        let signature = self.ed25519_sign(&keypair, b"self-test")?;
        if !self.ed25519_verify(&public, b"self-test", &signature)? {
            return Err(Error::Provider("ed25519 verification failed".to_string()));
        }

        let mut key = [0u8; AEAD_KEY_LEN];
        self.hkdf_sha256(None, &bob, b"self-test", &mut key)?;
        let nonce = [0u8; AEAD_NONCE_LEN];
        let sealed = self.aead_seal(&key, &nonce, b"self-test", b"")?;
        if self.aead_open(&key, &nonce, &sealed, b"")? != b"self-test" {
            return Err(Error::Provider("aead round trip failed".to_string()));
        }

        let mut sample = [0u8; 32];
        self.random_bytes(&mut sample)?;
        if sample.iter().all(|&b| b == 0) {
            return Err(Error::Provider("random source returned zeros".to_string()));
        }

        Ok(())
    }
}

/// Draws a uniformly random `u32` from the provider.
pub(crate) fn random_u32(provider: &dyn CryptoProvider) -> Result<u32, Error> {
    let mut bytes = [0u8; 4];
    provider.random_bytes(&mut bytes)?;
    Ok(u32::from_be_bytes(bytes))
}

/// Copies `bytes` into a fixed array, failing with [`Error::InvalidInput`] on a length mismatch.
pub(crate) fn fixed_input<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N], Error> {
    <[u8; N]>::try_from(bytes).map_err(|_| {
        Error::InvalidInput(format!("{what} must be {N} bytes, got {}", bytes.len()))
    })
}
