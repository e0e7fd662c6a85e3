use crate::Error;
use crate::crypto::{
    AEAD_KEY_LEN, AEAD_NONCE_LEN, CryptoProvider, ED25519_KEYPAIR_LEN, ED25519_PUBLIC_LEN,
    ED25519_SIGNATURE_LEN, X25519_KEY_LEN,
};
use aes_gcm_siv::aead::{Aead, Payload};
use aes_gcm_siv::{Aes256GcmSiv, KeyInit, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::TryRngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Pure-software provider built on the dalek curves, RustCrypto hashes and
/// AES-256-GCM-SIV.
#[derive(Clone, Copy, Debug, Default)]
pub struct SoftwareCrypto;

impl SoftwareCrypto {
    /// Creates the provider.
    pub fn new() -> Self {
        Self
    }
}

impl CryptoProvider for SoftwareCrypto {
    fn random_bytes(&self, out: &mut [u8]) -> Result<(), Error> {
        OsRng
            .try_fill_bytes(out)
            .map_err(|err| Error::KeyGeneration(format!("secure random source failed: {err}")))
    }

    fn x25519_public(&self, secret: &[u8; X25519_KEY_LEN]) -> Result<[u8; X25519_KEY_LEN], Error> {
        let secret = StaticSecret::from(*secret);
        Ok(PublicKey::from(&secret).to_bytes())
    }

    fn x25519_dh(
        &self,
        secret: &[u8; X25519_KEY_LEN],
        public: &[u8; X25519_KEY_LEN],
    ) -> Result<Zeroizing<[u8; X25519_KEY_LEN]>, Error> {
        let secret = StaticSecret::from(*secret);
        let shared = secret.diffie_hellman(&PublicKey::from(*public));
        if !shared.was_contributory() {
            return Err(Error::PeerPubKey(
                "non-contributory X25519 public key".to_string(),
            ));
        }

        Ok(Zeroizing::new(shared.to_bytes()))
    }

    fn ed25519_from_seed(
        &self,
        seed: &[u8; 32],
    ) -> Result<(Zeroizing<[u8; ED25519_KEYPAIR_LEN]>, [u8; ED25519_PUBLIC_LEN]), Error> {
        let signing_key = SigningKey::from_bytes(seed);
        let public = signing_key.verifying_key().to_bytes();
        Ok((Zeroizing::new(signing_key.to_keypair_bytes()), public))
    }

    fn ed25519_sign(
        &self,
        keypair: &[u8; ED25519_KEYPAIR_LEN],
        message: &[u8],
    ) -> Result<[u8; ED25519_SIGNATURE_LEN], Error> {
        let signing_key = SigningKey::from_keypair_bytes(keypair)
            .map_err(|err| Error::KeyGeneration(format!("invalid Ed25519 keypair: {err}")))?;
        Ok(signing_key.sign(message).to_bytes())
    }

    fn ed25519_verify(
        &self,
        public: &[u8; ED25519_PUBLIC_LEN],
        message: &[u8],
        signature: &[u8; ED25519_SIGNATURE_LEN],
    ) -> Result<bool, Error> {
        let Ok(verifying_key) = VerifyingKey::from_bytes(public) else {
            return Ok(false);
        };
        let signature = Signature::from_bytes(signature);
        Ok(verifying_key.verify_strict(message, &signature).is_ok())
    }

    fn hkdf_sha256(
        &self,
        salt: Option<&[u8]>,
        ikm: &[u8],
        info: &[u8],
        out: &mut [u8],
    ) -> Result<(), Error> {
        Hkdf::<Sha256>::new(salt, ikm)
            .expand(info, out)
            .map_err(|_| Error::DeriveKey("HKDF expansion failed".to_string()))
    }

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> Result<Zeroizing<[u8; 32]>, Error> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
            .map_err(|_| Error::DeriveKey("HMAC initialization failed".to_string()))?;
        mac.update(data);

        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(&mac.finalize().into_bytes());
        Ok(out)
    }

    fn aead_seal(
        &self,
        key: &[u8; AEAD_KEY_LEN],
        nonce: &[u8; AEAD_NONCE_LEN],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let key = aes_gcm_siv::Key::<Aes256GcmSiv>::from_slice(key);
        let cipher = Aes256GcmSiv::new(key);

        cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| Error::DeriveKey("message encryption failed".to_string()))
    }

    fn aead_open(
        &self,
        key: &[u8; AEAD_KEY_LEN],
        nonce: &[u8; AEAD_NONCE_LEN],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let key = aes_gcm_siv::Key::<Aes256GcmSiv>::from_slice(key);
        let cipher = Aes256GcmSiv::new(key);

        Ok(cipher.decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )?)
    }
}
