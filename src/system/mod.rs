//! Async session manager tying the identity, the connections and storage together.
//!
//! Each connection sits behind its own mutex so unrelated connections make
//! progress in parallel. The identity sits behind one more mutex, which
//! serializes one-time pre-key consumption. Lock order is identity, then
//! connection.
//!
//! The store holds one identity record and one record per connection.
//! Connection records carry no identity keys: the identity record is
//! rewritten before any change to the identity takes effect, so a restart
//! through [`ProtocolSystem::open`] never revives a consumed one-time
//! pre-key.

mod cancel;
pub use cancel::{CancelHandle, CancelSignal, cancel_pair};

mod persist;
use persist::{Persister, RecordSlot, connection_record, identity_record};

use crate::config::{ProtocolConfig, RatchetLimits};
use crate::crypto::SharedProvider;
use crate::identity::{HandshakeInit, IdentityKeys, PublicKeyBundle, session_fingerprint};
use crate::keys::X25519PublicKey;
use crate::ratchet::{RatchetConnection, RatchetMessage, SessionSeed};
use crate::storage::SessionStore;
use crate::Error;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use zeroize::Zeroizing;

type SharedConnection = Arc<Mutex<RatchetConnection>>;

/// How a session is to be established.
#[derive(Clone, Debug)]
pub enum EstablishRequest {
    /// Start a session against the peer's published bundle.
    Initiate(PublicKeyBundle),
    /// Accept a session the peer started.
    Respond(HandshakeInit),
}

#[derive(Clone, Debug)]
pub enum EstablishOutcome {
    /// Deliver this to the responder.
    Initiated(HandshakeInit),
    Responded,
}

/// Owns the local identity and every live connection.
pub struct ProtocolSystem {
    config: ProtocolConfig,
    limits: RatchetLimits,
    provider: SharedProvider,
    identity: Mutex<IdentityKeys>,
    connections: RwLock<HashMap<u32, SharedConnection>>,
    persister: Persister,
}

impl ProtocolSystem {
    /// Validates `config` and runs the provider self-test.
    ///
    /// A failed self-test is fatal: the system refuses to start with
    /// [`Error::Provider`].
    pub fn new(
        identity: IdentityKeys,
        store: Arc<dyn SessionStore>,
        config: ProtocolConfig,
        provider: SharedProvider,
    ) -> Result<Self, Error> {
        config.validate()?;
        provider
            .self_test()
            .map_err(|err| Error::Provider(format!("self-test failed: {err}")))?;
        info!(
            signed_pre_key_id = identity.signed_pre_key_id(),
            one_time_pre_keys = identity.one_time_pre_key_count(),
            "protocol system started"
        );

        Ok(Self {
            limits: config.ratchet_limits(),
            persister: Persister::new(
                store,
                config.critical_save_attempts,
                config.critical_save_backoff,
                config.save_debounce,
            ),
            config,
            provider,
            identity: Mutex::new(identity),
            connections: RwLock::new(HashMap::new()),
        })
    }

    /// Restarts from the identity record in `store`.
    ///
    /// Connections are brought back one by one with
    /// [`restore_session`](Self::restore_session).
    pub async fn open(
        store: Arc<dyn SessionStore>,
        config: ProtocolConfig,
        provider: SharedProvider,
    ) -> Result<Self, Error> {
        let record = Zeroizing::new(store.load_identity().await?);
        let Some(state) = record.identity_keys.as_ref() else {
            return Err(Error::Decode("identity record has no identity keys".to_string()));
        };
        let identity = IdentityKeys::from_state(state, provider.clone())?;
        Self::new(identity, store, config, provider)
    }

    /// Writes the identity record.
    ///
    /// Needed once for a freshly generated identity; afterwards every change
    /// to the identity saves it before taking effect.
    pub async fn save_identity(&self, cancel: &CancelSignal) -> Result<(), Error> {
        let identity = self.identity.lock().await;
        let record = identity_record(identity.export_state()?);
        self.persister.save_critical(RecordSlot::Identity, &record, cancel).await
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// The bundle peers need to initiate a session with us.
    pub async fn export_public_bundle(&self) -> Result<PublicKeyBundle, Error> {
        self.identity.lock().await.create_public_bundle()
    }

    pub async fn one_time_pre_key_count(&self) -> usize {
        self.identity.lock().await.one_time_pre_key_count()
    }

    /// Runs X3DH and installs a new connection under `connection_id`.
    ///
    /// The new state is saved before it becomes visible; if the save fails or
    /// `cancel` fires first, nothing changes and no one-time pre-key is
    /// consumed. The one exception is a responder whose identity record was
    /// saved but whose connection record was not: the one-time pre-key stays
    /// consumed and the handshake has to be restarted. An existing connection
    /// with the same id is superseded and closed.
    pub async fn establish_session(
        &self,
        connection_id: u32,
        request: EstablishRequest,
        cancel: &CancelSignal,
    ) -> Result<EstablishOutcome, Error> {
        cancel.check()?;
        let (connection, outcome) = match request {
            EstablishRequest::Initiate(bundle) => {
                self.initiate(connection_id, &bundle, cancel).await?
            }
            EstablishRequest::Respond(hello) => {
                (self.respond(connection_id, &hello, cancel).await?, EstablishOutcome::Responded)
            }
        };

        let superseded = self
            .connections
            .write()
            .await
            .insert(connection_id, Arc::new(Mutex::new(connection)));
        if let Some(superseded) = superseded {
            superseded.lock().await.close();
            info!(connection_id, "superseded existing connection");
        }
        Ok(outcome)
    }

    async fn initiate(
        &self,
        connection_id: u32,
        bundle: &PublicKeyBundle,
        cancel: &CancelSignal,
    ) -> Result<(RatchetConnection, EstablishOutcome), Error> {
        let mut identity = self.identity.lock().await;
        identity.generate_ephemeral_key_pair()?;
        let initiation = identity.x3dh_derive_shared_secret(bundle, &self.config.protocol_info)?;

        let local_identity = identity.identity_x25519_public();
        let fingerprint = session_fingerprint(
            &local_identity,
            &bundle.identity_x25519,
            &initiation.ephemeral_public,
        );

        let mut connection = RatchetConnection::new(connection_id, self.limits, self.provider.clone());
        connection.establish(SessionSeed {
            shared_secret: initiation.shared_secret,
            is_initiator: true,
            remote_ratchet_key: Some(bundle.signed_pre_key_public),
            local_ratchet_key: None,
            associated_data: session_associated_data(&local_identity, &bundle.identity_x25519),
            fingerprint: fingerprint.clone(),
        })?;

        let hello = HandshakeInit {
            identity_ed25519: identity.identity_ed25519_public(),
            identity_x25519: local_identity,
            ephemeral_x25519: initiation.ephemeral_public,
            signed_pre_key_id: initiation.signed_pre_key_id,
            one_time_pre_key_id: initiation.one_time_pre_key_id,
            ratchet_public: Some(connection.local_ratchet_public()?),
        };

        drop(identity);

        cancel.check()?;
        let record = connection_record(connection.export_state()?);
        self.persister
            .save_critical(RecordSlot::Connection(connection_id), &record, cancel)
            .await?;

        info!(connection_id, %fingerprint, "initiated session");
        Ok((connection, EstablishOutcome::Initiated(hello)))
    }

    async fn respond(
        &self,
        connection_id: u32,
        hello: &HandshakeInit,
        cancel: &CancelSignal,
    ) -> Result<RatchetConnection, Error> {
        let mut identity = self.identity.lock().await;
        let shared_secret = identity.x3dh_respond_secret(hello, &self.config.protocol_info)?;

        let local_identity = identity.identity_x25519_public();
        let fingerprint = session_fingerprint(
            &hello.identity_x25519,
            &local_identity,
            &hello.ephemeral_x25519,
        );

        let mut connection = RatchetConnection::new(connection_id, self.limits, self.provider.clone());
        connection.establish(SessionSeed {
            shared_secret,
            is_initiator: false,
            remote_ratchet_key: hello.ratchet_public,
            local_ratchet_key: Some(identity.signed_pre_key_pair(hello.signed_pre_key_id)?),
            associated_data: session_associated_data(&hello.identity_x25519, &local_identity),
            fingerprint: fingerprint.clone(),
        })?;

        cancel.check()?;

        let mut staged = identity.try_clone()?;
        if let Some(id) = hello.one_time_pre_key_id {
            staged.consume_one_time_pre_key(id);
        }
        if staged.one_time_pre_key_count() < self.config.min_one_time_pre_keys {
            let added = staged.replenish_one_time_pre_keys(self.config.one_time_pre_key_count)?;
            debug!(connection_id, added = added.len(), "replenished one-time pre-keys");
        }

        let record = identity_record(staged.export_state()?);
        self.persister
            .save_critical(RecordSlot::Identity, &record, cancel)
            .await?;
        *identity = staged;
        drop(identity);

        let record = connection_record(connection.export_state()?);
        self.persister
            .save_critical(RecordSlot::Connection(connection_id), &record, cancel)
            .await?;

        info!(connection_id, %fingerprint, "accepted session");
        Ok(connection)
    }

    async fn connection(&self, connection_id: u32) -> Result<SharedConnection, Error> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .cloned()
            .ok_or(Error::SessionNotFound(connection_id))
    }

    /// Encrypts a message on an established connection.
    ///
    /// A message that triggers a DH ratchet is only released once the new
    /// state has been saved. Other messages are saved in the background.
    pub async fn encrypt(
        &self,
        connection_id: u32,
        plaintext: &[u8],
        associated_data: &[u8],
        cancel: &CancelSignal,
    ) -> Result<RatchetMessage, Error> {
        let shared = self.connection(connection_id).await?;
        let mut connection = shared.lock().await;

        let (message, staged) = connection.stage_encrypt(plaintext, associated_data)?;
        match staged.ratchet_state(connection_id)? {
            Some(ratchet_state) => {
                cancel.check()?;
                let record = connection_record(ratchet_state);
                self.persister
                    .save_critical(RecordSlot::Connection(connection_id), &record, cancel)
                    .await?;
                connection.commit(staged);
            }
            None => {
                connection.commit(staged);
                drop(connection);
                self.persister.schedule(connection_id, shared).await;
            }
        }
        Ok(message)
    }

    /// Decrypts a message on an established connection.
    ///
    /// Rejected messages leave the connection untouched.
    pub async fn decrypt(
        &self,
        connection_id: u32,
        message: &RatchetMessage,
        associated_data: &[u8],
        cancel: &CancelSignal,
    ) -> Result<Vec<u8>, Error> {
        let shared = self.connection(connection_id).await?;
        let mut connection = shared.lock().await;

        let (plaintext, staged) = match connection.stage_decrypt(message, associated_data) {
            Ok(staged) => staged,
            Err(err) => {
                debug!(connection_id, error = %err, "rejected incoming message");
                return Err(err);
            }
        };
        match staged.ratchet_state(connection_id)? {
            Some(ratchet_state) => {
                cancel.check()?;
                let record = connection_record(ratchet_state);
                self.persister
                    .save_critical(RecordSlot::Connection(connection_id), &record, cancel)
                    .await?;
                connection.commit(staged);
            }
            None => {
                connection.commit(staged);
                drop(connection);
                self.persister.schedule(connection_id, shared).await;
            }
        }
        Ok(plaintext)
    }

    /// Loads a connection from the store and makes it live.
    pub async fn restore_session(&self, connection_id: u32) -> Result<(), Error> {
        let record = Zeroizing::new(self.persister.load(connection_id).await?);
        let Some(state) = record.ratchet_state.as_ref() else {
            return Err(Error::Decode("record has no ratchet state".to_string()));
        };
        if state.connection_id != connection_id {
            return Err(Error::Decode(format!(
                "record belongs to connection {}",
                state.connection_id
            )));
        }

        let connection = RatchetConnection::from_state(state, self.limits, self.provider.clone())?;
        let superseded = self
            .connections
            .write()
            .await
            .insert(connection_id, Arc::new(Mutex::new(connection)));
        if let Some(superseded) = superseded {
            superseded.lock().await.close();
        }

        info!(connection_id, "restored session");
        Ok(())
    }

    /// Closes a connection and wipes its state. A pending background save is
    /// dropped.
    pub async fn close_session(&self, connection_id: u32) -> Result<(), Error> {
        let connection = self
            .connections
            .write()
            .await
            .remove(&connection_id)
            .ok_or(Error::SessionNotFound(connection_id))?;
        self.persister.discard(connection_id).await;
        connection.lock().await.close();

        info!(connection_id, "closed session");
        Ok(())
    }

    /// Makes the next message on the connection start a new DH ratchet step.
    ///
    /// Do not force a ratchet while the peer may be ratcheting too: the two
    /// root chains would diverge.
    pub async fn force_ratchet(&self, connection_id: u32) -> Result<(), Error> {
        let connection = self.connection(connection_id).await?;
        let mut connection = connection.lock().await;
        connection.force_ratchet()
    }

    /// Replaces the signed pre-key.
    ///
    /// The rotation only takes effect once the identity record has been
    /// saved. Connection records are untouched: they carry no identity keys.
    pub async fn rotate_signed_pre_key(&self, cancel: &CancelSignal) -> Result<u32, Error> {
        let mut identity = self.identity.lock().await;

        let mut staged = identity.try_clone()?;
        let id = staged.rotate_signed_pre_key()?;
        let record = identity_record(staged.export_state()?);
        self.persister
            .save_critical(RecordSlot::Identity, &record, cancel)
            .await?;

        *identity = staged;
        info!(signed_pre_key_id = id, "rotated signed pre-key");
        Ok(id)
    }

    /// Waits for every background save to land.
    pub async fn flush(&self) {
        self.persister.flush().await;
    }

    /// Background saves scheduled but not yet written.
    pub async fn pending_saves(&self) -> usize {
        self.persister.pending_saves().await
    }

    pub async fn session_fingerprint(&self, connection_id: u32) -> Result<String, Error> {
        let connection = self.connection(connection_id).await?;
        let connection = connection.lock().await;
        Ok(connection.fingerprint()?.to_string())
    }

    pub async fn has_session(&self, connection_id: u32) -> bool {
        self.connections.read().await.contains_key(&connection_id)
    }

    /// Runs `f` against a live connection, for inspection.
    pub async fn with_connection<R>(
        &self,
        connection_id: u32,
        f: impl FnOnce(&RatchetConnection) -> R,
    ) -> Result<R, Error> {
        let connection = self.connection(connection_id).await?;
        let connection = connection.lock().await;
        Ok(f(&connection))
    }

    /// Closes every connection and wipes the identity.
    pub async fn shutdown(&self) {
        self.flush().await;
        let connections: Vec<SharedConnection> =
            self.connections.write().await.drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.lock().await.close();
        }
        self.identity.lock().await.dispose();
        info!("protocol system shut down");
    }
}

/// Associated data bound into every message: initiator identity key, then
/// responder identity key.
fn session_associated_data(initiator: &X25519PublicKey, responder: &X25519PublicKey) -> Vec<u8> {
    let mut associated_data = Vec::with_capacity(64);
    associated_data.extend_from_slice(initiator.as_bytes());
    associated_data.extend_from_slice(responder.as_bytes());
    associated_data
}

