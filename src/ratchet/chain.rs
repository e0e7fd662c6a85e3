use crate::crypto::CryptoProvider;
use crate::{Error, SecureBuffer};

/// HMAC input for deriving a message key from a chain key.
pub(crate) const MESSAGE_LABEL: &[u8] = b"vigil-message";
/// HMAC input for deriving the next chain key.
pub(crate) const CHAIN_LABEL: &[u8] = b"vigil-chain";

pub(crate) const CHAIN_KEY_LEN: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainKind {
    Sending,
    Receiving,
}

/// One key per message, derived from and discarded with the chain position.
#[derive(Debug)]
pub struct MessageKey {
    pub index: u32,
    pub key: SecureBuffer,
}

/// Symmetric KDF chain.
///
/// Each [`advance`](Self::advance) turns the current chain key into a message
/// key and a replacement chain key using two HMAC-SHA256 derivations under
/// distinct labels. A leaked message key reveals nothing about later chain
/// keys.
#[derive(Debug)]
pub struct ChainStep {
    kind: ChainKind,
    key: SecureBuffer,
    index: u32,
}

impl ChainStep {
    /// Starts a chain at index zero.
    pub fn new(kind: ChainKind, key: SecureBuffer) -> Result<Self, Error> {
        Self::with_index(kind, key, 0)
    }

    /// Resumes a chain at a known index.
    pub fn with_index(kind: ChainKind, key: SecureBuffer, index: u32) -> Result<Self, Error> {
        if key.len() != CHAIN_KEY_LEN {
            return Err(Error::InvalidInput(format!(
                "chain key must be {CHAIN_KEY_LEN} bytes"
            )));
        }
        Ok(Self { kind, key, index })
    }

    pub fn kind(&self) -> ChainKind {
        self.kind
    }

    /// Index of the next message key.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Derives the message key at the current index and moves to the next one.
    ///
    /// On error the chain is unchanged.
    pub fn advance(&mut self, provider: &dyn CryptoProvider) -> Result<MessageKey, Error> {
        let Some(next_index) = self.index.checked_add(1) else {
            return Err(Error::DeriveKey("chain index exhausted".to_string()));
        };

        let chain_key = self.key.read_array::<CHAIN_KEY_LEN>()?;
        let message_key = provider.hmac_sha256(chain_key.as_slice(), MESSAGE_LABEL)?;
        let next_chain_key = provider.hmac_sha256(chain_key.as_slice(), CHAIN_LABEL)?;

        let key = MessageKey {
            index: self.index,
            key: SecureBuffer::from_slice(message_key.as_slice())?,
        };
        self.key.write(next_chain_key.as_slice())?;
        self.index = next_index;

        Ok(key)
    }

    /// Whether the index has reached `threshold` and a DH ratchet is due.
    pub fn needs_ratchet(&self, threshold: u32) -> bool {
        self.index >= threshold
    }

    pub(crate) fn key_bytes(&self) -> Result<zeroize::Zeroizing<Vec<u8>>, Error> {
        self.key.read_bytes(CHAIN_KEY_LEN)
    }

    pub fn try_clone(&self) -> Result<Self, Error> {
        Ok(Self {
            kind: self.kind,
            key: self.key.try_clone()?,
            index: self.index,
        })
    }
}
