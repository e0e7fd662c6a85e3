use crate::crypto::{CryptoProvider, X25519_KEY_LEN, fixed_input};
use crate::{Error, SecureBuffer};
use std::fmt;
use zeroize::Zeroizing;

/// Public half of an X25519 key pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct X25519PublicKey([u8; X25519_KEY_LEN]);

impl X25519PublicKey {
    /// Borrow the raw point.
    pub fn as_bytes(&self) -> &[u8; X25519_KEY_LEN] {
        &self.0
    }

    /// Copy out the raw point.
    pub fn to_bytes(&self) -> [u8; X25519_KEY_LEN] {
        self.0
    }
}

impl From<[u8; X25519_KEY_LEN]> for X25519PublicKey {
    fn from(bytes: [u8; X25519_KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for X25519PublicKey {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Ok(Self(fixed_input(bytes, "X25519 public key")?))
    }
}

impl fmt::Debug for X25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "X25519PublicKey({:02x}{:02x}{:02x}{:02x}..)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// X25519 key pair whose private scalar lives in a [`SecureBuffer`].
pub struct X25519KeyPair {
    secret: SecureBuffer,
    public: X25519PublicKey,
}

impl X25519KeyPair {
    /// Draws a fresh scalar from the provider's random source.
    pub fn generate(provider: &dyn CryptoProvider) -> Result<Self, Error> {
        let mut seed = Zeroizing::new([0u8; X25519_KEY_LEN]);
        provider.random_bytes(seed.as_mut_slice())?;
        Self::from_seed(&seed, provider)
    }

    /// Builds a key pair from a 32-byte scalar.
    pub fn from_seed(seed: &[u8; X25519_KEY_LEN], provider: &dyn CryptoProvider) -> Result<Self, Error> {
        let public = provider.x25519_public(seed)?;
        Ok(Self {
            secret: SecureBuffer::from_slice(seed)?,
            public: X25519PublicKey(public),
        })
    }

    /// Rebuilds a persisted pair, checking that the public half matches the scalar.
    pub fn from_parts(
        secret: &[u8],
        public: &[u8],
        provider: &dyn CryptoProvider,
    ) -> Result<Self, Error> {
        let secret: Zeroizing<[u8; X25519_KEY_LEN]> = Zeroizing::new(
            <[u8; X25519_KEY_LEN]>::try_from(secret).map_err(|_| {
                Error::Decode(format!("X25519 secret has {} bytes", secret.len()))
            })?,
        );
        let public = <[u8; X25519_KEY_LEN]>::try_from(public)
            .map_err(|_| Error::Decode(format!("X25519 public has {} bytes", public.len())))?;

        let pair = Self::from_seed(&secret, provider)?;
        if pair.public.0 != public {
            return Err(Error::Decode(
                "X25519 public key does not match its secret".to_string(),
            ));
        }

        Ok(pair)
    }

    /// The public half.
    pub fn public_key(&self) -> X25519PublicKey {
        self.public
    }

    /// Diffie-Hellman with a remote public key.
    pub fn dh(
        &self,
        remote: &X25519PublicKey,
        provider: &dyn CryptoProvider,
    ) -> Result<Zeroizing<[u8; X25519_KEY_LEN]>, Error> {
        let secret = self.secret.read_array::<X25519_KEY_LEN>()?;
        provider.x25519_dh(&secret, remote.as_bytes())
    }

    /// Copy of the scalar for persistence. Wiped when dropped.
    pub(crate) fn secret_bytes(&self) -> Result<Zeroizing<Vec<u8>>, Error> {
        self.secret.read_bytes(X25519_KEY_LEN)
    }

    /// Independent copy of the pair.
    pub fn try_clone(&self) -> Result<Self, Error> {
        Ok(Self {
            secret: self.secret.try_clone()?,
            public: self.public,
        })
    }

    /// Wipes the private scalar.
    pub fn dispose(&mut self) {
        self.secret.dispose();
    }

    /// Whether the private scalar has been wiped.
    pub fn is_disposed(&self) -> bool {
        self.secret.is_disposed()
    }
}

impl fmt::Debug for X25519KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X25519KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}
