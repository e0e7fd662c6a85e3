use crate::Error;
use crate::keys::X25519PublicKey;

/// Encoded length of a [`MessageHeader`].
pub const HEADER_LEN: usize = 40;

/// Plaintext header sent with every ratchet message.
///
/// Authenticated as associated data, not encrypted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    /// Sender's current ratchet public key.
    pub dh_public: X25519PublicKey,
    /// Messages sent on the sender's previous sending chain.
    pub previous_chain_length: u32,
    /// Position of this message in the sender's current chain.
    pub chain_index: u32,
}

impl MessageHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..32].copy_from_slice(self.dh_public.as_bytes());
        bytes[32..36].copy_from_slice(&self.previous_chain_length.to_be_bytes());
        bytes[36..40].copy_from_slice(&self.chain_index.to_be_bytes());

        bytes
    }
}

impl From<[u8; HEADER_LEN]> for MessageHeader {
    fn from(bytes: [u8; HEADER_LEN]) -> Self {
        let mut dh_bytes = [0u8; 32];
        dh_bytes.copy_from_slice(&bytes[0..32]);

        let mut pn_bytes = [0u8; 4];
        pn_bytes.copy_from_slice(&bytes[32..36]);

        let mut n_bytes = [0u8; 4];
        n_bytes.copy_from_slice(&bytes[36..40]);

        Self {
            dh_public: X25519PublicKey::from(dh_bytes),
            previous_chain_length: u32::from_be_bytes(pn_bytes),
            chain_index: u32::from_be_bytes(n_bytes),
        }
    }
}

/// A message produced by the sending ratchet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RatchetMessage {
    pub header: MessageHeader,
    /// AEAD output, tag included.
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    /// Serializes the message for transmission.
    ///
    /// Format: [header length (4 bytes)][header][ciphertext]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(4 + HEADER_LEN + self.ciphertext.len());
        result.extend_from_slice(&(HEADER_LEN as u32).to_be_bytes());
        result.extend_from_slice(&self.header.to_bytes());
        result.extend_from_slice(&self.ciphertext);

        result
    }

    /// Parses a message produced by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 4 {
            return Err(Error::Decode("Invalid message format".to_string()));
        }

        let header_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if header_len != HEADER_LEN || bytes.len() < 4 + HEADER_LEN {
            return Err(Error::Decode("Invalid message header".to_string()));
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&bytes[4..4 + HEADER_LEN]);

        Ok(Self {
            header: MessageHeader::from(header),
            ciphertext: bytes[4 + HEADER_LEN..].to_vec(),
        })
    }
}
