#[macro_use]
extern crate afl;
use std::sync::Arc;
use vigil::{
    IdentityKeys, RatchetConnection, RatchetLimits, RatchetMessage, SessionSeed, SharedProvider,
    SoftwareCrypto,
};

fn get_connection() -> RatchetConnection {
    let provider: SharedProvider = Arc::new(SoftwareCrypto::new());

    // The victim
    let mut alice = IdentityKeys::generate(0, provider.clone()).expect("Setup failed");

    // The attacker's published bundle
    let bob = IdentityKeys::generate(1, provider.clone()).expect("Setup failed");
    let bob_bundle = bob.create_public_bundle().expect("Setup failed");

    alice.generate_ephemeral_key_pair().expect("Setup failed");
    let initiation = alice
        .x3dh_derive_shared_secret(&bob_bundle, b"fuzz-info")
        .expect("Setup failed");

    let mut connection = RatchetConnection::new(1, RatchetLimits::default(), provider);
    connection
        .establish(SessionSeed {
            shared_secret: initiation.shared_secret,
            is_initiator: true,
            remote_ratchet_key: Some(bob_bundle.signed_pre_key_public),
            local_ratchet_key: None,
            associated_data: b"fuzz-session".to_vec(),
            fingerprint: "fuzz".to_string(),
        })
        .expect("Setup failed");
    connection
}

fn main() {
    let mut connection = get_connection();
    let associated_data = b"fuzz-context";

    fuzz!(|data: &[u8]| {
        if let Ok(msg) = RatchetMessage::from_bytes(data) {
            let _ = connection.decrypt_next(&msg, associated_data);
        }
    });
}
