//! Wire and storage records, encoded with protobuf.
//!
//! Records carrying private key bytes derive [`Zeroize`] so holders can wipe
//! them, and print nothing but non-secret fields through `Debug`. Every byte
//! field with a fixed size is length-checked by the code that decodes it into
//! a live object; a mismatch is [`Error::Decode`].

use crate::Error;
use prost::Message;
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

/// Current schema version of [`PersistedSession`] and [`ConnectionStateProto`].
pub const STATE_VERSION: u32 = 1;

/// Everything needed to resume one session after a restart.
#[derive(Clone, PartialEq, Message, Zeroize)]
#[prost(skip_debug)]
pub struct PersistedSession {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(message, optional, tag = "2")]
    pub identity_keys: Option<IdentityKeysState>,
    #[prost(message, optional, tag = "3")]
    pub ratchet_state: Option<ConnectionStateProto>,
}

/// Long-term identity material.
#[derive(Clone, PartialEq, Message, Zeroize)]
#[prost(skip_debug)]
pub struct IdentityKeysState {
    #[prost(bytes = "vec", tag = "1")]
    pub ed25519_public: Vec<u8>,
    /// 64-byte keypair encoding.
    #[prost(bytes = "vec", tag = "2")]
    pub ed25519_secret: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub identity_x25519_public: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub identity_x25519_secret: Vec<u8>,
    #[prost(uint32, tag = "5")]
    pub signed_pre_key_id: u32,
    #[prost(bytes = "vec", tag = "6")]
    pub signed_pre_key_public: Vec<u8>,
    #[prost(bytes = "vec", tag = "7")]
    pub signed_pre_key_secret: Vec<u8>,
    #[prost(bytes = "vec", tag = "8")]
    pub signed_pre_key_signature: Vec<u8>,
    /// Sorted by id.
    #[prost(message, repeated, tag = "9")]
    pub one_time_pre_keys: Vec<OneTimePreKeyState>,
}

#[derive(Clone, PartialEq, Message, Zeroize)]
#[prost(skip_debug)]
pub struct OneTimePreKeyState {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub public: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub secret: Vec<u8>,
}

#[derive(Clone, PartialEq, Message, Zeroize)]
#[prost(skip_debug)]
pub struct ChainStateProto {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub index: u32,
}

#[derive(Clone, PartialEq, Message, Zeroize)]
#[prost(skip_debug)]
pub struct SkippedKeyProto {
    #[prost(uint32, tag = "1")]
    pub generation: u32,
    #[prost(uint32, tag = "2")]
    pub index: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub key: Vec<u8>,
}

#[derive(Clone, PartialEq, Message, Zeroize)]
pub struct PreviousRemoteKeyProto {
    #[prost(bytes = "vec", tag = "1")]
    pub public: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub generation: u32,
}

#[derive(Clone, PartialEq, Message, Zeroize)]
pub struct ReplayGenerationProto {
    #[prost(uint32, tag = "1")]
    pub generation: u32,
    #[prost(uint32, tag = "2")]
    pub highest: u32,
    /// Sorted ascending.
    #[prost(uint32, repeated, tag = "3")]
    pub seen: Vec<u32>,
}

#[derive(Clone, PartialEq, Message, Zeroize)]
pub struct ReplayWindowProto {
    #[prost(uint32, tag = "1")]
    pub generation_floor: u32,
    #[prost(message, repeated, tag = "2")]
    pub generations: Vec<ReplayGenerationProto>,
}

/// Full double-ratchet state of one connection.
#[derive(Clone, PartialEq, Message, Zeroize)]
#[prost(skip_debug)]
pub struct ConnectionStateProto {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(uint32, tag = "2")]
    pub connection_id: u32,
    #[prost(bool, tag = "3")]
    pub is_initiator: bool,
    #[prost(bytes = "vec", tag = "4")]
    pub root_key: Vec<u8>,
    #[prost(message, optional, tag = "5")]
    pub sending_chain: Option<ChainStateProto>,
    #[prost(message, optional, tag = "6")]
    pub receiving_chain: Option<ChainStateProto>,
    #[prost(bytes = "vec", tag = "7")]
    pub dh_secret: Vec<u8>,
    #[prost(bytes = "vec", tag = "8")]
    pub dh_public: Vec<u8>,
    /// Empty when the remote ratchet key is not yet known.
    #[prost(bytes = "vec", tag = "9")]
    pub remote_dh_public: Vec<u8>,
    #[prost(uint32, tag = "10")]
    pub receiving_generation: u32,
    /// Oldest first.
    #[prost(message, repeated, tag = "11")]
    pub previous_remote_keys: Vec<PreviousRemoteKeyProto>,
    #[prost(uint32, tag = "12")]
    pub previous_sending_chain_length: u32,
    #[prost(bool, tag = "13")]
    pub sending_ratchet_pending: bool,
    /// Insertion order, oldest first.
    #[prost(message, repeated, tag = "14")]
    pub skipped_keys: Vec<SkippedKeyProto>,
    #[prost(message, optional, tag = "15")]
    pub replay: Option<ReplayWindowProto>,
    #[prost(bytes = "vec", tag = "16")]
    pub associated_data: Vec<u8>,
    #[prost(string, tag = "17")]
    pub fingerprint: String,
    #[prost(uint64, tag = "18")]
    pub ratchet_steps: u64,
    /// Remote ratchet keys whose chains were forgotten, oldest first.
    #[prost(bytes = "vec", repeated, tag = "19")]
    pub retired_remote_keys: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct OneTimePreKeyPublicProto {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub public: Vec<u8>,
}

/// Published key bundle.
#[derive(Clone, PartialEq, Message)]
pub struct PublicKeyBundleProto {
    #[prost(bytes = "vec", tag = "1")]
    pub identity_ed25519: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub identity_x25519: Vec<u8>,
    #[prost(uint32, tag = "3")]
    pub signed_pre_key_id: u32,
    #[prost(bytes = "vec", tag = "4")]
    pub signed_pre_key_public: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub signed_pre_key_signature: Vec<u8>,
    #[prost(message, repeated, tag = "6")]
    pub one_time_pre_keys: Vec<OneTimePreKeyPublicProto>,
    /// Empty when absent.
    #[prost(bytes = "vec", tag = "7")]
    pub ephemeral_x25519: Vec<u8>,
}

/// First message from initiator to responder.
#[derive(Clone, PartialEq, Message)]
pub struct HandshakeInitProto {
    #[prost(bytes = "vec", tag = "1")]
    pub identity_ed25519: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub identity_x25519: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub ephemeral_x25519: Vec<u8>,
    #[prost(uint32, tag = "4")]
    pub signed_pre_key_id: u32,
    #[prost(uint32, optional, tag = "5")]
    pub one_time_pre_key_id: Option<u32>,
    /// Empty when absent.
    #[prost(bytes = "vec", tag = "6")]
    pub ratchet_public: Vec<u8>,
}

macro_rules! redacted_debug {
    ($name:ident { $($field:ident),* }) => {
        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    $(.field(stringify!($field), &self.$field))*
                    .finish_non_exhaustive()
            }
        }
    };
}

redacted_debug!(PersistedSession { version, identity_keys, ratchet_state });
redacted_debug!(IdentityKeysState { signed_pre_key_id, one_time_pre_keys });
redacted_debug!(OneTimePreKeyState { id });
redacted_debug!(ChainStateProto { index });
redacted_debug!(SkippedKeyProto { generation, index });
redacted_debug!(ConnectionStateProto {
    version,
    connection_id,
    is_initiator,
    receiving_generation,
    sending_chain,
    receiving_chain,
    fingerprint
});

/// Encodes a session record. The buffer is wiped when dropped.
pub fn encode_persisted_session(session: &PersistedSession) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(session.encode_to_vec())
}

/// Decodes a session record and checks its schema version.
pub fn decode_persisted_session(bytes: &[u8]) -> Result<PersistedSession, Error> {
    let mut session = PersistedSession::decode(bytes)?;
    if session.version != STATE_VERSION {
        let version = session.version;
        session.zeroize();
        return Err(Error::Decode(format!(
            "Unsupported schema version: {version}"
        )));
    }
    Ok(session)
}

/// Copies a fixed-size field out of a decoded record.
pub(crate) fn fixed_field<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N], Error> {
    <[u8; N]>::try_from(bytes)
        .map_err(|_| Error::Decode(format!("{what} must be {N} bytes, got {}", bytes.len())))
}
