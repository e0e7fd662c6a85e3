//! Key material types. Private halves are always held in a [`crate::SecureBuffer`].

mod ed25519;
pub use ed25519::{Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature, verify_signature};

mod x25519;
pub use x25519::{X25519KeyPair, X25519PublicKey};

mod signed_pre_key;
pub use signed_pre_key::SignedPreKey;

mod one_time_pre_key;
pub use one_time_pre_key::{
    FIRST_ONE_TIME_PRE_KEY_ID, OneTimePreKeyPublic, OneTimePreKeyRecord, OneTimePreKeyStore,
};
