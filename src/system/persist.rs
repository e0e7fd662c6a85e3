use crate::Error;
use crate::proto::{ConnectionStateProto, IdentityKeysState, PersistedSession, STATE_VERSION};
use crate::ratchet::RatchetConnection;
use crate::storage::SessionStore;
use crate::system::cancel::CancelSignal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Which record a save replaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RecordSlot {
    Identity,
    Connection(u32),
}

/// Writes records to the store.
///
/// Critical saves are awaited and retried with exponential backoff.
/// Non-critical saves are debounced per connection: scheduling a new one
/// replaces the one still waiting, and the connection is only exported when
/// the save finally runs.
pub(crate) struct Persister {
    store: Arc<dyn SessionStore>,
    attempts: u32,
    backoff: Duration,
    debounce: Duration,
    pending: Mutex<HashMap<u32, JoinHandle<()>>>,
}

impl Persister {
    pub(crate) fn new(
        store: Arc<dyn SessionStore>,
        attempts: u32,
        backoff: Duration,
        debounce: Duration,
    ) -> Self {
        Self {
            store,
            attempts: attempts.max(1),
            backoff,
            debounce,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Persists `record` before the caller commits the state it describes.
    ///
    /// Any debounced save for the connection is dropped first so an older
    /// snapshot can never land after this one.
    pub(crate) async fn save_critical(
        &self,
        slot: RecordSlot,
        record: &PersistedSession,
        cancel: &CancelSignal,
    ) -> Result<(), Error> {
        if let RecordSlot::Connection(connection_id) = slot {
            self.discard(connection_id).await;
        }

        let mut delay = self.backoff;
        let mut last_error = None;
        for attempt in 1..=self.attempts {
            cancel.check()?;
            match self.write(slot, record).await {
                Ok(()) => {
                    debug!(?slot, attempt, "critical save completed");
                    return Ok(());
                }
                Err(err) => {
                    warn!(?slot, attempt, error = %err, "critical save failed");
                    last_error = Some(err);
                }
            }

            if attempt < self.attempts {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                }
                delay = delay.saturating_mul(2);
            }
        }

        let reason = last_error.map_or_else(String::new, |err| err.to_string());
        Err(Error::Storage(format!(
            "critical save of {slot:?} gave up after {} attempts: {reason}",
            self.attempts
        )))
    }

    async fn write(&self, slot: RecordSlot, record: &PersistedSession) -> Result<(), Error> {
        match slot {
            RecordSlot::Identity => self.store.persist_identity(record).await,
            RecordSlot::Connection(connection_id) => {
                self.store.persist_state(connection_id, record).await
            }
        }
    }

    pub(crate) async fn load(&self, connection_id: u32) -> Result<PersistedSession, Error> {
        self.store.load_state(connection_id).await
    }

    /// Schedules a best-effort save of `connection` after the debounce delay.
    pub(crate) async fn schedule(&self, connection_id: u32, connection: Arc<Mutex<RatchetConnection>>) {
        let store = Arc::clone(&self.store);
        let attempts = self.attempts;
        let backoff = self.backoff;
        let debounce = self.debounce;

        let task = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;

            let exported = connection.lock().await.export_state();
            let record = match exported {
                Ok(state) => connection_record(state),
                Err(err) => {
                    debug!(connection_id, error = %err, "connection gone before debounced save");
                    return;
                }
            };
            drop(connection);

            let mut delay = backoff;
            for attempt in 1..=attempts {
                match store.persist_state(connection_id, &record).await {
                    Ok(()) => {
                        debug!(connection_id, attempt, "debounced save completed");
                        return;
                    }
                    Err(err) if attempt < attempts => {
                        debug!(connection_id, attempt, error = %err, "debounced save failed, retrying");
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                    Err(err) => {
                        warn!(connection_id, error = %err, "debounced save abandoned");
                    }
                }
            }
        });

        let previous = self.pending.lock().await.insert(connection_id, task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Drops the pending debounced save of a connection, if any.
    pub(crate) async fn discard(&self, connection_id: u32) {
        let previous = self.pending.lock().await.remove(&connection_id);
        if let Some(previous) = previous {
            previous.abort();
            // Wait until the aborted task can no longer touch the store.
            let _ = previous.await;
        }
    }

    /// Waits for every scheduled save to finish.
    pub(crate) async fn flush(&self) {
        let pending: Vec<(u32, JoinHandle<()>)> = self.pending.lock().await.drain().collect();
        for (connection_id, task) in pending {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!(connection_id, error = %err, "debounced save task failed");
                }
            }
        }
    }

    pub(crate) async fn pending_saves(&self) -> usize {
        self.pending
            .lock()
            .await
            .values()
            .filter(|task| !task.is_finished())
            .count()
    }
}

/// A connection record: ratchet state only.
pub(crate) fn connection_record(
    mut ratchet_state: Zeroizing<ConnectionStateProto>,
) -> Zeroizing<PersistedSession> {
    Zeroizing::new(PersistedSession {
        version: STATE_VERSION,
        identity_keys: None,
        ratchet_state: Some(std::mem::take(&mut *ratchet_state)),
    })
}

/// The identity record: identity keys only.
pub(crate) fn identity_record(
    mut identity: Zeroizing<IdentityKeysState>,
) -> Zeroizing<PersistedSession> {
    Zeroizing::new(PersistedSession {
        version: STATE_VERSION,
        identity_keys: Some(std::mem::take(&mut *identity)),
        ratchet_state: None,
    })
}
