use crate::crypto::CryptoProvider;
use crate::keys::{Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature, X25519KeyPair, X25519PublicKey, verify_signature};
use crate::Error;

/// A medium-term X25519 pre-key signed by the identity's Ed25519 key.
///
/// The signature covers the 32 public key bytes, so a peer holding the
/// identity's verification key can authenticate the pre-key before using it.
#[derive(Debug)]
pub struct SignedPreKey {
    id: u32,
    key_pair: X25519KeyPair,
    signature: Ed25519Signature,
}

impl SignedPreKey {
    /// Generates a pre-key with the given id and signs it.
    pub fn generate(
        id: u32,
        signer: &Ed25519KeyPair,
        provider: &dyn CryptoProvider,
    ) -> Result<Self, Error> {
        Self::sign(id, X25519KeyPair::generate(provider)?, signer, provider)
    }

    /// Signs an existing key pair.
    pub fn sign(
        id: u32,
        key_pair: X25519KeyPair,
        signer: &Ed25519KeyPair,
        provider: &dyn CryptoProvider,
    ) -> Result<Self, Error> {
        let signature = signer.sign(key_pair.public_key().as_bytes(), provider)?;
        Ok(Self {
            id,
            key_pair,
            signature,
        })
    }

    /// Reassembles a persisted pre-key. The signature is checked against `identity`.
    pub fn from_parts(
        id: u32,
        key_pair: X25519KeyPair,
        signature: Ed25519Signature,
        identity: &Ed25519PublicKey,
        provider: &dyn CryptoProvider,
    ) -> Result<Self, Error> {
        let pre_key = Self {
            id,
            key_pair,
            signature,
        };
        if !pre_key.verify(identity, provider)? {
            return Err(Error::Decode(
                "signed pre-key signature does not verify".to_string(),
            ));
        }
        Ok(pre_key)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn public_key(&self) -> X25519PublicKey {
        self.key_pair.public_key()
    }

    pub fn signature(&self) -> Ed25519Signature {
        self.signature
    }

    pub(crate) fn key_pair(&self) -> &X25519KeyPair {
        &self.key_pair
    }

    /// Checks the signature against the identity's verification key.
    pub fn verify(
        &self,
        identity: &Ed25519PublicKey,
        provider: &dyn CryptoProvider,
    ) -> Result<bool, Error> {
        verify_signature(
            identity,
            self.public_key().as_bytes(),
            &self.signature,
            provider,
        )
    }

    pub fn dispose(&mut self) {
        self.key_pair.dispose();
    }
}
