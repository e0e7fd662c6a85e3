#[macro_use]
extern crate afl;
use std::sync::Arc;
use vigil::{IdentityKeys, RatchetConnection, RatchetLimits, SoftwareCrypto, decode_persisted_session};

fn main() {
    let provider: vigil::SharedProvider = Arc::new(SoftwareCrypto::new());

    fuzz!(|data: &[u8]| {
        let Ok(record) = decode_persisted_session(data) else {
            return;
        };
        if let Some(identity) = record.identity_keys.as_ref() {
            let _ = IdentityKeys::from_state(identity, provider.clone());
        }
        if let Some(state) = record.ratchet_state.as_ref() {
            let _ = RatchetConnection::from_state(state, RatchetLimits::default(), provider.clone());
        }
    });
}
