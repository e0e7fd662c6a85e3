#[cfg(test)]
mod integration_tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use vigil::{
        AEAD_KEY_LEN, AEAD_NONCE_LEN, CryptoProvider, ED25519_KEYPAIR_LEN, ED25519_PUBLIC_LEN,
        ED25519_SIGNATURE_LEN, Error, HandshakeInit, IdentityKeys, MemorySessionStore,
        PersistedSession, ProtocolConfig, ProtocolSystem, RatchetConnection, RatchetLimits,
        RatchetMessage, SessionSeed, SharedProvider, SoftwareCrypto, X25519_KEY_LEN,
        decode_persisted_session, encode_persisted_session,
    };
    use zeroize::Zeroizing;

    const INFO: &[u8] = b"vigil-integration";

    fn provider() -> SharedProvider {
        Arc::new(SoftwareCrypto::new())
    }

    fn limits() -> RatchetLimits {
        RatchetLimits {
            max_skip: 50,
            max_skipped_message_keys: 64,
            replay_window: 1024,
            max_tracked_generations: 8,
            chain_ratchet_threshold: 10_000,
        }
    }

    /// Runs X3DH between two identities and seeds a connection on each side.
    fn handshake(
        alice: &mut IdentityKeys,
        bob: &mut IdentityKeys,
        provider: SharedProvider,
        limits: RatchetLimits,
    ) -> (RatchetConnection, RatchetConnection, Option<u32>) {
        let bundle = bob.create_public_bundle().unwrap();
        assert!(bundle.verify(provider.as_ref()).unwrap());

        alice.generate_ephemeral_key_pair().unwrap();
        let initiation = alice.x3dh_derive_shared_secret(&bundle, INFO).unwrap();

        let mut alice_connection = RatchetConnection::new(1, limits, provider.clone());
        alice_connection
            .establish(SessionSeed {
                shared_secret: initiation.shared_secret,
                is_initiator: true,
                remote_ratchet_key: Some(bundle.signed_pre_key_public),
                local_ratchet_key: None,
                associated_data: b"alice|bob".to_vec(),
                fingerprint: "alice-bob".to_string(),
            })
            .unwrap();

        let hello = HandshakeInit {
            identity_ed25519: alice.identity_ed25519_public(),
            identity_x25519: alice.identity_x25519_public(),
            ephemeral_x25519: initiation.ephemeral_public,
            signed_pre_key_id: initiation.signed_pre_key_id,
            one_time_pre_key_id: initiation.one_time_pre_key_id,
            ratchet_public: Some(alice_connection.local_ratchet_public().unwrap()),
        };
        let hello = HandshakeInit::from_bytes(&hello.to_bytes()).unwrap();

        let shared_secret = bob.x3dh_respond(&hello, INFO).unwrap();
        let mut bob_connection = RatchetConnection::new(1, limits, provider);
        bob_connection
            .establish(SessionSeed {
                shared_secret,
                is_initiator: false,
                remote_ratchet_key: hello.ratchet_public,
                local_ratchet_key: Some(bob.signed_pre_key_pair(hello.signed_pre_key_id).unwrap()),
                associated_data: b"alice|bob".to_vec(),
                fingerprint: "alice-bob".to_string(),
            })
            .unwrap();

        (alice_connection, bob_connection, initiation.one_time_pre_key_id)
    }

    fn send(from: &mut RatchetConnection, text: &str) -> RatchetMessage {
        let bytes = from.encrypt_next(text.as_bytes(), b"").unwrap().to_bytes();
        RatchetMessage::from_bytes(&bytes).unwrap()
    }

    fn receive(to: &mut RatchetConnection, message: &RatchetMessage) -> String {
        String::from_utf8(to.decrypt_next(message, b"").unwrap()).unwrap()
    }

    #[test]
    fn test_hello_without_one_time_pre_key() {
        let provider = provider();
        let mut alice = IdentityKeys::generate(5, provider.clone()).unwrap();
        let mut bob = IdentityKeys::generate(0, provider.clone()).unwrap();

        println!("Step 1: Alice runs X3DH against Bob's bundle, which has no one-time pre-keys...");
        let (mut alice_connection, mut bob_connection, one_time_pre_key_id) =
            handshake(&mut alice, &mut bob, provider, limits());
        assert_eq!(one_time_pre_key_id, None);

        println!("Step 2: Alice says hello...");
        let hello = send(&mut alice_connection, "hello");
        assert_eq!(receive(&mut bob_connection, &hello), "hello");
    }

    #[test]
    fn test_both_sides_derive_the_same_secret() {
        let provider = provider();
        for bob_keys in [0usize, 3] {
            let mut alice = IdentityKeys::generate(0, provider.clone()).unwrap();
            let mut bob = IdentityKeys::generate(bob_keys, provider.clone()).unwrap();
            let bundle = bob.create_public_bundle().unwrap();

            let ephemeral = alice.generate_ephemeral_key_pair().unwrap();
            let initiation = alice.x3dh_derive_shared_secret(&bundle, INFO).unwrap();
            assert_eq!(initiation.ephemeral_public, ephemeral);
            assert_eq!(initiation.one_time_pre_key_id.is_some(), bob_keys > 0);

            let hello = HandshakeInit {
                identity_ed25519: alice.identity_ed25519_public(),
                identity_x25519: alice.identity_x25519_public(),
                ephemeral_x25519: ephemeral,
                signed_pre_key_id: initiation.signed_pre_key_id,
                one_time_pre_key_id: initiation.one_time_pre_key_id,
                ratchet_public: None,
            };
            let responder_secret = bob.x3dh_respond(&hello, INFO).unwrap();
            assert!(initiation.shared_secret.ct_eq(&responder_secret).unwrap());
        }
    }

    #[test]
    fn test_one_time_pre_key_is_single_use() {
        let provider = provider();
        let mut alice = IdentityKeys::generate(0, provider.clone()).unwrap();
        let mut bob = IdentityKeys::generate(2, provider.clone()).unwrap();
        let bundle = bob.create_public_bundle().unwrap();

        alice.generate_ephemeral_key_pair().unwrap();
        let initiation = alice.x3dh_derive_shared_secret(&bundle, INFO).unwrap();
        let used = initiation.one_time_pre_key_id.unwrap();
        let hello = HandshakeInit {
            identity_ed25519: alice.identity_ed25519_public(),
            identity_x25519: alice.identity_x25519_public(),
            ephemeral_x25519: initiation.ephemeral_public,
            signed_pre_key_id: initiation.signed_pre_key_id,
            one_time_pre_key_id: Some(used),
            ratchet_public: None,
        };

        bob.x3dh_respond(&hello, INFO).unwrap();
        assert!(!bob.has_one_time_pre_key(used));
        assert_eq!(bob.one_time_pre_key_count(), 1);
        assert!(matches!(bob.x3dh_respond(&hello, INFO), Err(Error::Handshake(_))));

        let bundle = bob.create_public_bundle().unwrap();
        assert!(bundle.one_time_pre_keys.iter().all(|key| key.id != used));
    }

    fn record_of(identity: &IdentityKeys, connection: &RatchetConnection) -> PersistedSession {
        let ratchet_state = connection.export_state().unwrap();
        PersistedSession {
            version: ratchet_state.version,
            identity_keys: Some((*identity.export_state().unwrap()).clone()),
            ratchet_state: Some((*ratchet_state).clone()),
        }
    }

    /// Encodes and decodes `record`, checking every field on the way.
    fn assert_round_trip(record: &PersistedSession, provider: SharedProvider) -> PersistedSession {
        let decoded = decode_persisted_session(&encode_persisted_session(record)).unwrap();
        assert_eq!(decoded.version, record.version);

        let identity = decoded.identity_keys.as_ref().unwrap();
        let expected = record.identity_keys.as_ref().unwrap();
        assert_eq!(identity.ed25519_public, expected.ed25519_public);
        assert_eq!(identity.ed25519_secret, expected.ed25519_secret);
        assert_eq!(identity.identity_x25519_public, expected.identity_x25519_public);
        assert_eq!(identity.identity_x25519_secret, expected.identity_x25519_secret);
        assert_eq!(identity.signed_pre_key_id, expected.signed_pre_key_id);
        assert_eq!(identity.signed_pre_key_public, expected.signed_pre_key_public);
        assert_eq!(identity.signed_pre_key_secret, expected.signed_pre_key_secret);
        assert_eq!(identity.signed_pre_key_signature, expected.signed_pre_key_signature);
        assert_eq!(identity.one_time_pre_keys.len(), expected.one_time_pre_keys.len());
        for (key, expected) in identity.one_time_pre_keys.iter().zip(&expected.one_time_pre_keys) {
            assert_eq!(key.id, expected.id);
            assert_eq!(key.public, expected.public);
            assert_eq!(key.secret, expected.secret);
        }

        let state = decoded.ratchet_state.as_ref().unwrap();
        let expected = record.ratchet_state.as_ref().unwrap();
        assert_eq!(state.version, expected.version);
        assert_eq!(state.connection_id, expected.connection_id);
        assert_eq!(state.is_initiator, expected.is_initiator);
        assert_eq!(state.root_key, expected.root_key);
        assert_eq!(state.sending_chain, expected.sending_chain);
        assert_eq!(state.receiving_chain, expected.receiving_chain);
        assert_eq!(state.dh_secret, expected.dh_secret);
        assert_eq!(state.dh_public, expected.dh_public);
        assert_eq!(state.remote_dh_public, expected.remote_dh_public);
        assert_eq!(state.receiving_generation, expected.receiving_generation);
        assert_eq!(state.previous_remote_keys, expected.previous_remote_keys);
        assert_eq!(state.previous_sending_chain_length, expected.previous_sending_chain_length);
        assert_eq!(state.sending_ratchet_pending, expected.sending_ratchet_pending);
        assert_eq!(state.skipped_keys, expected.skipped_keys);
        assert_eq!(state.replay, expected.replay);
        assert_eq!(state.associated_data, expected.associated_data);
        assert_eq!(state.fingerprint, expected.fingerprint);
        assert_eq!(state.ratchet_steps, expected.ratchet_steps);
        assert_eq!(state.retired_remote_keys, expected.retired_remote_keys);
        assert!(decoded == *record);

        let restored = IdentityKeys::from_state(identity, provider.clone()).unwrap();
        assert!(*restored.export_state().unwrap() == *record.identity_keys.as_ref().unwrap());
        let restored = RatchetConnection::from_state(state, limits(), provider).unwrap();
        assert!(*restored.export_state().unwrap() == *expected);
        decoded
    }

    #[test]
    fn test_persisted_session_round_trips_field_by_field() {
        let provider = provider();
        let mut alice = IdentityKeys::generate(5, provider.clone()).unwrap();
        let mut bob = IdentityKeys::generate(5, provider.clone()).unwrap();
        let (mut alice_connection, mut bob_connection, _) =
            handshake(&mut alice, &mut bob, provider.clone(), limits());

        println!("Step 1: a fresh session...");
        assert_round_trip(&record_of(&bob, &bob_connection), provider.clone());

        println!("Step 2: two messages held back, then several DH ratchets...");
        let held: Vec<_> = (0..2)
            .map(|i| send(&mut alice_connection, &format!("held {i}")))
            .collect();
        let delivered = send(&mut alice_connection, "held 2");
        assert_eq!(receive(&mut bob_connection, &delivered), "held 2");
        for round in 0..3 {
            let pong = send(&mut bob_connection, &format!("pong {round}"));
            assert_eq!(receive(&mut alice_connection, &pong), format!("pong {round}"));
            let ping = send(&mut alice_connection, &format!("ping {round}"));
            assert_eq!(receive(&mut bob_connection, &ping), format!("ping {round}"));
        }
        assert!(bob_connection.ratchet_steps().unwrap() >= 3);
        assert_eq!(bob_connection.skipped_key_count().unwrap(), 2);

        let record = record_of(&bob, &bob_connection);
        let state = record.ratchet_state.as_ref().unwrap();
        assert!(!state.skipped_keys.is_empty());
        assert!(!state.previous_remote_keys.is_empty());
        assert!(!state.replay.as_ref().unwrap().generations.is_empty());
        let decoded = assert_round_trip(&record, provider.clone());

        println!("Step 3: the restored connection still opens the held messages...");
        let mut restored =
            RatchetConnection::from_state(decoded.ratchet_state.as_ref().unwrap(), limits(), provider)
                .unwrap();
        assert_eq!(receive(&mut restored, &held[1]), "held 1");
        assert_eq!(receive(&mut restored, &held[0]), "held 0");
        assert!(matches!(restored.decrypt_next(&held[0], b""), Err(Error::ReplayDetected)));
    }

    #[test]
    fn test_forced_ratchet_after_ten_round_trips() {
        let provider = provider();
        let mut alice = IdentityKeys::generate(5, provider.clone()).unwrap();
        let mut bob = IdentityKeys::generate(5, provider.clone()).unwrap();
        let (mut alice_connection, mut bob_connection, _) =
            handshake(&mut alice, &mut bob, provider, limits());

        println!("Step 1: ten messages delivered in order...");
        let mut first_key = None;
        for i in 0..10 {
            let message = send(&mut alice_connection, &format!("message {i}"));
            assert_eq!(message.header.chain_index, i);
            first_key.get_or_insert(message.header.dh_public);
            assert_eq!(receive(&mut bob_connection, &message), format!("message {i}"));
        }
        assert_eq!(bob_connection.receiving_index().unwrap(), Some(10));

        println!("Step 2: message 11 forces a DH ratchet...");
        alice_connection.force_ratchet().unwrap();
        let eleventh = send(&mut alice_connection, "message 10");
        assert_ne!(Some(eleventh.header.dh_public), first_key);
        assert_eq!(eleventh.header.chain_index, 0);
        assert_eq!(eleventh.header.previous_chain_length, 10);

        assert_eq!(receive(&mut bob_connection, &eleventh), "message 10");
        assert_eq!(bob_connection.receiving_generation().unwrap(), 1);
        assert_eq!(bob_connection.receiving_index().unwrap(), Some(1));
    }

    #[test]
    fn test_forced_ratchet_keeps_undelivered_keys_cached() {
        let provider = provider();
        let mut alice = IdentityKeys::generate(5, provider.clone()).unwrap();
        let mut bob = IdentityKeys::generate(5, provider.clone()).unwrap();
        let (mut alice_connection, mut bob_connection, _) =
            handshake(&mut alice, &mut bob, provider, limits());

        let held: Vec<_> = (0..10)
            .map(|i| send(&mut alice_connection, &format!("held {i}")))
            .collect();

        alice_connection.force_ratchet().unwrap();
        let eleventh = send(&mut alice_connection, "eleventh");

        assert_eq!(receive(&mut bob_connection, &eleventh), "eleventh");
        assert_eq!(bob_connection.skipped_key_count().unwrap(), 10);
        assert_eq!(bob_connection.receiving_index().unwrap(), Some(1));

        for (i, message) in held.iter().enumerate().rev() {
            assert_eq!(receive(&mut bob_connection, message), format!("held {i}"));
        }
        assert_eq!(bob_connection.skipped_key_count().unwrap(), 0);
    }

    #[test]
    fn test_out_of_order_delivery_across_ratchets() {
        let provider = provider();
        let mut alice = IdentityKeys::generate(1, provider.clone()).unwrap();
        let mut bob = IdentityKeys::generate(1, provider.clone()).unwrap();
        let (mut alice_connection, mut bob_connection, _) =
            handshake(&mut alice, &mut bob, provider, limits());

        let a1 = send(&mut alice_connection, "a1");
        let a2 = send(&mut alice_connection, "a2");
        let a3 = send(&mut alice_connection, "a3");
        assert_eq!(receive(&mut bob_connection, &a1), "a1");

        let b1 = send(&mut bob_connection, "b1");
        let b2 = send(&mut bob_connection, "b2");
        assert_eq!(receive(&mut alice_connection, &b2), "b2");

        let a4 = send(&mut alice_connection, "a4");
        assert_eq!(a4.header.previous_chain_length, 3);

        assert_eq!(receive(&mut bob_connection, &a4), "a4");
        assert_eq!(receive(&mut bob_connection, &a3), "a3");
        assert_eq!(receive(&mut alice_connection, &b1), "b1");
        assert_eq!(receive(&mut bob_connection, &a2), "a2");

        let b3 = send(&mut bob_connection, "b3");
        assert_eq!(receive(&mut alice_connection, &b3), "b3");

        assert_eq!(bob_connection.skipped_key_count().unwrap(), 0);
        assert_eq!(alice_connection.skipped_key_count().unwrap(), 0);
        assert_eq!(
            bob_connection.decrypt_next(&a2, b"").unwrap_err(),
            Error::ReplayDetected
        );
    }

    #[test]
    fn test_skipped_cache_is_bounded() {
        let provider = provider();
        let mut alice = IdentityKeys::generate(1, provider.clone()).unwrap();
        let mut bob = IdentityKeys::generate(1, provider.clone()).unwrap();
        let (mut alice_connection, mut bob_connection, _) =
            handshake(&mut alice, &mut bob, provider, limits());

        let first_chain: Vec<_> = (0..40)
            .map(|i| send(&mut alice_connection, &format!("first {i}")))
            .collect();
        receive(&mut bob_connection, &first_chain[39]);
        assert_eq!(bob_connection.skipped_key_count().unwrap(), 39);

        let reply = send(&mut bob_connection, "reply");
        receive(&mut alice_connection, &reply);

        let second_chain: Vec<_> = (0..40)
            .map(|i| send(&mut alice_connection, &format!("second {i}")))
            .collect();
        receive(&mut bob_connection, &second_chain[39]);

        let cap = limits().max_skipped_message_keys;
        assert_eq!(bob_connection.skipped_key_count().unwrap(), cap);

        // 78 keys were cached; the 14 oldest are gone for good.
        let evicted = 39 + 39 - cap;
        for message in &first_chain[..evicted] {
            assert_eq!(
                bob_connection.decrypt_next(message, b"").unwrap_err(),
                Error::ReplayDetected
            );
        }
        assert_eq!(receive(&mut bob_connection, &first_chain[evicted]), format!("first {evicted}"));
        assert_eq!(receive(&mut bob_connection, &second_chain[0]), "second 0");
    }

    #[test]
    fn test_state_survives_export_after_ratchets() {
        let provider = provider();
        let mut alice = IdentityKeys::generate(1, provider.clone()).unwrap();
        let mut bob = IdentityKeys::generate(1, provider.clone()).unwrap();
        let (mut alice_connection, mut bob_connection, _) =
            handshake(&mut alice, &mut bob, provider.clone(), limits());

        for round in 0..3 {
            let ping = send(&mut alice_connection, &format!("ping {round}"));
            receive(&mut bob_connection, &ping);
            let pong = send(&mut bob_connection, &format!("pong {round}"));
            receive(&mut alice_connection, &pong);
        }
        assert!(alice_connection.ratchet_steps().unwrap() >= 3);
        let late = send(&mut bob_connection, "late");

        let alice_state = alice_connection.export_state().unwrap();
        let mut alice_restored =
            RatchetConnection::from_state(&alice_state, limits(), provider.clone()).unwrap();
        let bob_state = bob_connection.export_state().unwrap();
        let mut bob_restored = RatchetConnection::from_state(&bob_state, limits(), provider).unwrap();

        assert_eq!(receive(&mut alice_restored, &late), "late");
        let next = send(&mut alice_restored, "after restore");
        assert_eq!(receive(&mut bob_restored, &next), "after restore");
        assert_eq!(
            alice_restored.fingerprint().unwrap(),
            alice_connection.fingerprint().unwrap()
        );
    }

    /// Delegates to [`SoftwareCrypto`] until told to fail key derivation.
    struct FailingProvider {
        inner: SoftwareCrypto,
        fail_derivation: AtomicBool,
        fail_random: AtomicBool,
    }

    impl FailingProvider {
        fn derivation_guard(&self) -> Result<(), Error> {
            if self.fail_derivation.load(Ordering::SeqCst) {
                return Err(Error::DeriveKey("injected failure".to_string()));
            }
            Ok(())
        }
    }

    impl CryptoProvider for FailingProvider {
        fn random_bytes(&self, out: &mut [u8]) -> Result<(), Error> {
            if self.fail_random.load(Ordering::SeqCst) {
                return Err(Error::KeyGeneration("injected failure".to_string()));
            }
            self.inner.random_bytes(out)
        }

        fn x25519_public(&self, secret: &[u8; X25519_KEY_LEN]) -> Result<[u8; X25519_KEY_LEN], Error> {
            self.inner.x25519_public(secret)
        }

        fn x25519_dh(
            &self,
            secret: &[u8; X25519_KEY_LEN],
            public: &[u8; X25519_KEY_LEN],
        ) -> Result<Zeroizing<[u8; X25519_KEY_LEN]>, Error> {
            self.inner.x25519_dh(secret, public)
        }

        fn ed25519_from_seed(
            &self,
            seed: &[u8; 32],
        ) -> Result<(Zeroizing<[u8; ED25519_KEYPAIR_LEN]>, [u8; ED25519_PUBLIC_LEN]), Error> {
            self.inner.ed25519_from_seed(seed)
        }

        fn ed25519_sign(
            &self,
            keypair: &[u8; ED25519_KEYPAIR_LEN],
            message: &[u8],
        ) -> Result<[u8; ED25519_SIGNATURE_LEN], Error> {
            self.inner.ed25519_sign(keypair, message)
        }

        fn ed25519_verify(
            &self,
            public: &[u8; ED25519_PUBLIC_LEN],
            message: &[u8],
            signature: &[u8; ED25519_SIGNATURE_LEN],
        ) -> Result<bool, Error> {
            self.inner.ed25519_verify(public, message, signature)
        }

        fn hkdf_sha256(
            &self,
            salt: Option<&[u8]>,
            ikm: &[u8],
            info: &[u8],
            out: &mut [u8],
        ) -> Result<(), Error> {
            self.derivation_guard()?;
            self.inner.hkdf_sha256(salt, ikm, info, out)
        }

        fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> Result<Zeroizing<[u8; 32]>, Error> {
            self.derivation_guard()?;
            self.inner.hmac_sha256(key, data)
        }

        fn aead_seal(
            &self,
            key: &[u8; AEAD_KEY_LEN],
            nonce: &[u8; AEAD_NONCE_LEN],
            plaintext: &[u8],
            aad: &[u8],
        ) -> Result<Vec<u8>, Error> {
            self.inner.aead_seal(key, nonce, plaintext, aad)
        }

        fn aead_open(
            &self,
            key: &[u8; AEAD_KEY_LEN],
            nonce: &[u8; AEAD_NONCE_LEN],
            ciphertext: &[u8],
            aad: &[u8],
        ) -> Result<Vec<u8>, Error> {
            self.inner.aead_open(key, nonce, ciphertext, aad)
        }
    }

    #[test]
    fn test_failing_provider_leaves_state_untouched() {
        let failing = Arc::new(FailingProvider {
            inner: SoftwareCrypto::new(),
            fail_derivation: AtomicBool::new(false),
            fail_random: AtomicBool::new(false),
        });
        let provider: SharedProvider = failing.clone();
        let mut alice = IdentityKeys::generate(1, provider.clone()).unwrap();
        let mut bob = IdentityKeys::generate(1, provider.clone()).unwrap();
        let (mut alice_connection, mut bob_connection, _) =
            handshake(&mut alice, &mut bob, provider, limits());

        let hello = send(&mut alice_connection, "hello");
        receive(&mut bob_connection, &hello);

        println!("Step 1: Bob's sending ratchet fails while drawing a new key...");
        failing.fail_random.store(true, Ordering::SeqCst);
        let before = bob_connection.export_state().unwrap();
        assert!(matches!(
            bob_connection.encrypt_next(b"reply", b""),
            Err(Error::KeyGeneration(_))
        ));
        assert_eq!(*bob_connection.export_state().unwrap(), *before);
        failing.fail_random.store(false, Ordering::SeqCst);

        println!("Step 2: Alice's receiving ratchet fails during derivation...");
        let reply = send(&mut bob_connection, "reply");
        failing.fail_derivation.store(true, Ordering::SeqCst);
        let before = alice_connection.export_state().unwrap();
        assert!(matches!(
            alice_connection.decrypt_next(&reply, b""),
            Err(Error::DeriveKey(_))
        ));
        failing.fail_derivation.store(false, Ordering::SeqCst);
        assert_eq!(*alice_connection.export_state().unwrap(), *before);

        println!("Step 3: both sides recover once the provider does...");
        assert_eq!(receive(&mut alice_connection, &reply), "reply");
        let next = send(&mut alice_connection, "next");
        assert_eq!(receive(&mut bob_connection, &next), "next");
    }

    #[test]
    fn test_broken_provider_is_refused_at_start() {
        let failing = Arc::new(FailingProvider {
            inner: SoftwareCrypto::new(),
            fail_derivation: AtomicBool::new(false),
            fail_random: AtomicBool::new(false),
        });
        let provider: SharedProvider = failing.clone();
        let identity = IdentityKeys::generate(1, provider.clone()).unwrap();

        failing.fail_derivation.store(true, Ordering::SeqCst);
        let result = ProtocolSystem::new(
            identity,
            Arc::new(MemorySessionStore::new()),
            ProtocolConfig::default(),
            provider,
        );
        assert!(matches!(result, Err(Error::Provider(_))));
    }

    #[test]
    fn test_master_key_derivation_is_reproducible() {
        let provider = provider();
        let master = [0x5Au8; 32];
        let first = IdentityKeys::derive_from_master_key(&master, b"member-7", 4, provider.clone())
            .unwrap()
            .create_public_bundle()
            .unwrap();
        let second = IdentityKeys::derive_from_master_key(&master, b"member-7", 4, provider.clone())
            .unwrap()
            .create_public_bundle()
            .unwrap();
        let other = IdentityKeys::derive_from_master_key(&master, b"member-8", 4, provider)
            .unwrap()
            .create_public_bundle()
            .unwrap();

        assert_eq!(first, second);
        assert_ne!(first.identity_x25519, other.identity_x25519);
    }
}
