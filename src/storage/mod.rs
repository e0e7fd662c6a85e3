//! Storage boundary for persisted sessions.
//!
//! A store holds two kinds of [`PersistedSession`] record: one per connection
//! id carrying only ratchet state, and a single identity record carrying only
//! the identity keys. The identity record is the one source of truth for
//! which one-time pre-keys remain.

use crate::Error;
use crate::proto::{PersistedSession, decode_persisted_session, encode_persisted_session};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

/// Durable home for [`PersistedSession`] records.
///
/// Implementations must be safe to call from several connections at once.
/// A write either replaces the previous record completely or fails.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn persist_state(&self, connection_id: u32, state: &PersistedSession) -> Result<(), Error>;

    /// Returns [`Error::NotFound`] when nothing was stored for the id.
    async fn load_state(&self, connection_id: u32) -> Result<PersistedSession, Error>;

    /// Replaces the identity record.
    async fn persist_identity(&self, identity: &PersistedSession) -> Result<(), Error>;

    /// Returns [`Error::NotFound`] when no identity was stored yet.
    async fn load_identity(&self) -> Result<PersistedSession, Error>;
}

/// Keeps encoded records in memory. Buffers are wiped when replaced or dropped.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    records: Mutex<HashMap<u32, Zeroizing<Vec<u8>>>>,
    identity: Mutex<Option<Zeroizing<Vec<u8>>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, connection_id: u32) -> bool {
        self.records.lock().await.contains_key(&connection_id)
    }

    pub async fn remove(&self, connection_id: u32) -> bool {
        self.records.lock().await.remove(&connection_id).is_some()
    }

    /// Number of connection records. The identity record is not counted.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn has_identity(&self) -> bool {
        self.identity.lock().await.is_some()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn persist_state(&self, connection_id: u32, state: &PersistedSession) -> Result<(), Error> {
        let encoded = encode_persisted_session(state);
        self.records.lock().await.insert(connection_id, encoded);
        Ok(())
    }

    async fn load_state(&self, connection_id: u32) -> Result<PersistedSession, Error> {
        let records = self.records.lock().await;
        let encoded = records.get(&connection_id).ok_or(Error::NotFound)?;
        decode_persisted_session(encoded)
    }

    async fn persist_identity(&self, identity: &PersistedSession) -> Result<(), Error> {
        let encoded = encode_persisted_session(identity);
        *self.identity.lock().await = Some(encoded);
        Ok(())
    }

    async fn load_identity(&self) -> Result<PersistedSession, Error> {
        let identity = self.identity.lock().await;
        let encoded = identity.as_ref().ok_or(Error::NotFound)?;
        decode_persisted_session(encoded)
    }
}
