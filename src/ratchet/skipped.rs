use crate::proto::SkippedKeyProto;
use crate::ratchet::chain::CHAIN_KEY_LEN;
use crate::{Error, SecureBuffer};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

type SlotId = (u32, u32);

/// Message keys derived ahead of delivery, keyed by `(generation, index)`.
///
/// Hard-capped; once full the oldest insertion is evicted and the message it
/// belonged to can no longer be decrypted.
#[derive(Debug)]
pub struct SkippedKeyCache {
    capacity: usize,
    keys: HashMap<SlotId, SecureBuffer>,
    order: VecDeque<SlotId>,
}

impl SkippedKeyCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            keys: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, generation: u32, index: u32) -> bool {
        self.keys.contains_key(&(generation, index))
    }

    /// Caches a key, evicting the oldest entries beyond capacity.
    pub fn insert(&mut self, generation: u32, index: u32, key: SecureBuffer) {
        if self.capacity == 0 {
            return;
        }
        if self.keys.insert((generation, index), key).is_none() {
            self.order.push_back((generation, index));
        }

        let mut evicted = 0usize;
        while self.keys.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.keys.remove(&oldest).is_some() {
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, "skipped message key cache full, evicted oldest keys");
        }
    }

    pub fn get(&self, generation: u32, index: u32) -> Option<&SecureBuffer> {
        self.keys.get(&(generation, index))
    }

    /// Removes and returns the key for `(generation, index)`.
    pub fn take(&mut self, generation: u32, index: u32) -> Option<SecureBuffer> {
        let key = self.keys.remove(&(generation, index))?;
        self.order.retain(|slot| *slot != (generation, index));
        Some(key)
    }

    /// Drops every key belonging to `generation`.
    pub fn remove_generation(&mut self, generation: u32) -> usize {
        let before = self.keys.len();
        self.keys.retain(|(g, _), _| *g != generation);
        self.order.retain(|(g, _)| *g != generation);
        before - self.keys.len()
    }

    pub fn try_clone(&self) -> Result<Self, Error> {
        let mut keys = HashMap::with_capacity(self.keys.len());
        for (slot, key) in &self.keys {
            keys.insert(*slot, key.try_clone()?);
        }
        Ok(Self {
            capacity: self.capacity,
            keys,
            order: self.order.clone(),
        })
    }

    /// Entries oldest first.
    pub(crate) fn to_proto(&self) -> Result<Vec<SkippedKeyProto>, Error> {
        let mut entries = Vec::with_capacity(self.order.len());
        for (generation, index) in &self.order {
            if let Some(key) = self.keys.get(&(*generation, *index)) {
                entries.push(SkippedKeyProto {
                    generation: *generation,
                    index: *index,
                    key: key.read_bytes(CHAIN_KEY_LEN)?.to_vec(),
                });
            }
        }
        Ok(entries)
    }

    pub(crate) fn from_proto(entries: &[SkippedKeyProto], capacity: usize) -> Result<Self, Error> {
        let mut cache = Self::new(capacity);
        for entry in entries {
            if entry.key.len() != CHAIN_KEY_LEN {
                return Err(Error::Decode(format!(
                    "skipped message key has {} bytes",
                    entry.key.len()
                )));
            }
            cache.insert(entry.generation, entry.index, SecureBuffer::from_slice(&entry.key)?);
        }
        Ok(cache)
    }
}
