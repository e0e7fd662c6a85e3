//! X3DH key agreement and double-ratchet sessions with guarded key memory.
//!
//! [`IdentityKeys`] holds a party's long-term keys and runs X3DH. The shared
//! secret seeds a [`RatchetConnection`], which derives one key per message
//! and performs a DH ratchet whenever the conversation changes direction.
//! [`ProtocolSystem`] manages many connections at once and persists their
//! state through a [`SessionStore`].

mod secure;
pub use secure::{MAX_SECURE_BUFFER_LEN, SecureBuffer};

mod error;
pub use error::{ChannelSignal, Error};

mod crypto;
pub use crypto::{
    AEAD_KEY_LEN, AEAD_NONCE_LEN, CryptoProvider, ED25519_KEYPAIR_LEN, ED25519_PUBLIC_LEN,
    ED25519_SIGNATURE_LEN, SharedProvider, SoftwareCrypto, X25519_KEY_LEN,
};

pub mod keys;
pub use keys::{Ed25519PublicKey, Ed25519Signature, X25519KeyPair, X25519PublicKey};

mod config;
pub use config::{ProtocolConfig, RatchetLimits};

pub mod proto;
pub use proto::{PersistedSession, decode_persisted_session, encode_persisted_session};

mod identity;
pub use identity::{
    HandshakeInit, INITIAL_SIGNED_PRE_KEY_ID, IdentityKeys, PublicKeyBundle, X3dhInitiation,
    session_fingerprint,
};

mod ratchet;
pub use ratchet::{
    ChainKind, ChainStep, HEADER_LEN, MessageHeader, MessageKey, RatchetConnection,
    RatchetMessage, ReplayWindow, SessionSeed, SkippedKeyCache,
};

mod storage;
pub use storage::{MemorySessionStore, SessionStore};

mod system;
pub use system::{
    CancelHandle, CancelSignal, EstablishOutcome, EstablishRequest, ProtocolSystem, cancel_pair,
};
