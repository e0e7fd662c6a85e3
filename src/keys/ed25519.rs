use crate::crypto::{
    CryptoProvider, ED25519_KEYPAIR_LEN, ED25519_PUBLIC_LEN, ED25519_SIGNATURE_LEN, fixed_input,
};
use crate::{Error, SecureBuffer};
use std::fmt;
use zeroize::Zeroizing;

/// Ed25519 verification key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ed25519PublicKey([u8; ED25519_PUBLIC_LEN]);

impl Ed25519PublicKey {
    pub fn as_bytes(&self) -> &[u8; ED25519_PUBLIC_LEN] {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; ED25519_PUBLIC_LEN] {
        self.0
    }
}

impl From<[u8; ED25519_PUBLIC_LEN]> for Ed25519PublicKey {
    fn from(bytes: [u8; ED25519_PUBLIC_LEN]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Ed25519PublicKey {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Ok(Self(fixed_input(bytes, "Ed25519 public key")?))
    }
}

impl fmt::Debug for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ed25519PublicKey({:02x}{:02x}{:02x}{:02x}..)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// Detached Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Ed25519Signature([u8; ED25519_SIGNATURE_LEN]);

impl Ed25519Signature {
    pub fn as_bytes(&self) -> &[u8; ED25519_SIGNATURE_LEN] {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; ED25519_SIGNATURE_LEN] {
        self.0
    }
}

impl From<[u8; ED25519_SIGNATURE_LEN]> for Ed25519Signature {
    fn from(bytes: [u8; ED25519_SIGNATURE_LEN]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Ed25519Signature {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Ok(Self(fixed_input(bytes, "Ed25519 signature")?))
    }
}

impl fmt::Debug for Ed25519Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Ed25519Signature(..)")
    }
}

/// Long-term signing key. The 64-byte keypair encoding is held in a [`SecureBuffer`].
pub struct Ed25519KeyPair {
    keypair: SecureBuffer,
    public: Ed25519PublicKey,
}

impl Ed25519KeyPair {
    /// Generates a fresh signing key.
    pub fn generate(provider: &dyn CryptoProvider) -> Result<Self, Error> {
        let mut seed = Zeroizing::new([0u8; 32]);
        provider.random_bytes(seed.as_mut_slice())?;
        Self::from_seed(&seed, provider)
    }

    /// Expands a 32-byte seed into a signing key.
    pub fn from_seed(seed: &[u8; 32], provider: &dyn CryptoProvider) -> Result<Self, Error> {
        let (keypair, public) = provider.ed25519_from_seed(seed)?;
        Ok(Self {
            keypair: SecureBuffer::from_slice(keypair.as_slice())?,
            public: Ed25519PublicKey(public),
        })
    }

    /// Rebuilds a persisted key from its keypair encoding and public key.
    pub fn from_parts(
        keypair: &[u8],
        public: &[u8],
        provider: &dyn CryptoProvider,
    ) -> Result<Self, Error> {
        if keypair.len() != ED25519_KEYPAIR_LEN {
            return Err(Error::Decode(format!(
                "Ed25519 secret has {} bytes",
                keypair.len()
            )));
        }
        let public = <[u8; ED25519_PUBLIC_LEN]>::try_from(public)
            .map_err(|_| Error::Decode(format!("Ed25519 public has {} bytes", public.len())))?;

        let mut seed = Zeroizing::new([0u8; 32]);
        seed.copy_from_slice(&keypair[..32]);
        let pair = Self::from_seed(&seed, provider)?;

        let matches = pair
            .keypair
            .with_bytes(|expected| expected == keypair)?;
        if !matches || pair.public.0 != public {
            return Err(Error::Decode(
                "Ed25519 public key does not match its secret".to_string(),
            ));
        }

        Ok(pair)
    }

    pub fn public_key(&self) -> Ed25519PublicKey {
        self.public
    }

    /// Signs `message`.
    pub fn sign(&self, message: &[u8], provider: &dyn CryptoProvider) -> Result<Ed25519Signature, Error> {
        let keypair = self.keypair.read_array::<ED25519_KEYPAIR_LEN>()?;
        Ok(Ed25519Signature(provider.ed25519_sign(&keypair, message)?))
    }

    pub(crate) fn keypair_bytes(&self) -> Result<Zeroizing<Vec<u8>>, Error> {
        self.keypair.read_bytes(ED25519_KEYPAIR_LEN)
    }

    pub fn dispose(&mut self) {
        self.keypair.dispose();
    }
}

impl fmt::Debug for Ed25519KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Checks `signature` over `message` against `public`.
pub fn verify_signature(
    public: &Ed25519PublicKey,
    message: &[u8],
    signature: &Ed25519Signature,
    provider: &dyn CryptoProvider,
) -> Result<bool, Error> {
    provider.ed25519_verify(public.as_bytes(), message, signature.as_bytes())
}
