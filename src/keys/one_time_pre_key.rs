use crate::crypto::{CryptoProvider, random_u32};
use crate::keys::{X25519KeyPair, X25519PublicKey};
use crate::Error;
use std::collections::{BTreeMap, BTreeSet};

/// First id handed out to the initial batch of one-time pre-keys.
pub const FIRST_ONE_TIME_PRE_KEY_ID: u32 = 2;

const MAX_ID_ATTEMPTS: usize = 64;

/// One-time pre-key: consumed by at most one responder handshake.
#[derive(Debug)]
pub struct OneTimePreKeyRecord {
    id: u32,
    key_pair: X25519KeyPair,
}

impl OneTimePreKeyRecord {
    pub fn new(id: u32, key_pair: X25519KeyPair) -> Self {
        Self { id, key_pair }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn public_key(&self) -> X25519PublicKey {
        self.key_pair.public_key()
    }

    pub(crate) fn key_pair(&self) -> &X25519KeyPair {
        &self.key_pair
    }

    pub fn dispose(&mut self) {
        self.key_pair.dispose();
    }
}

/// Public half of a one-time pre-key as published in a bundle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OneTimePreKeyPublic {
    pub id: u32,
    pub public_key: X25519PublicKey,
}

/// Ordered collection of unused one-time pre-keys.
#[derive(Debug, Default)]
pub struct OneTimePreKeyStore {
    keys: BTreeMap<u32, OneTimePreKeyRecord>,
}

impl OneTimePreKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates `count` keys with sequential ids starting at
    /// [`FIRST_ONE_TIME_PRE_KEY_ID`], skipping any id in `reserved`.
    pub(crate) fn generate_initial(
        &mut self,
        count: usize,
        reserved: &BTreeSet<u32>,
        provider: &dyn CryptoProvider,
    ) -> Result<Vec<u32>, Error> {
        let mut batch = Vec::with_capacity(count);
        let mut id = FIRST_ONE_TIME_PRE_KEY_ID;
        while batch.len() < count {
            if !reserved.contains(&id) && !self.keys.contains_key(&id) {
                self.insert(OneTimePreKeyRecord::new(id, X25519KeyPair::generate(provider)?));
                batch.push(id);
            }
            id = id
                .checked_add(1)
                .ok_or_else(|| Error::KeyGeneration("one-time pre-key ids exhausted".to_string()))?;
        }
        Ok(batch)
    }

    /// Generates `count` keys with random ids that collide with neither the
    /// store nor `reserved`.
    pub(crate) fn generate_random(
        &mut self,
        count: usize,
        reserved: &BTreeSet<u32>,
        provider: &dyn CryptoProvider,
    ) -> Result<Vec<u32>, Error> {
        let mut batch = Vec::with_capacity(count);
        for _ in 0..count {
            let id = self.unused_random_id(reserved, provider)?;
            self.insert(OneTimePreKeyRecord::new(id, X25519KeyPair::generate(provider)?));
            batch.push(id);
        }
        Ok(batch)
    }

    fn unused_random_id(
        &self,
        reserved: &BTreeSet<u32>,
        provider: &dyn CryptoProvider,
    ) -> Result<u32, Error> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = random_u32(provider)?;
            if id >= FIRST_ONE_TIME_PRE_KEY_ID
                && !reserved.contains(&id)
                && !self.keys.contains_key(&id)
            {
                return Ok(id);
            }
        }
        Err(Error::KeyGeneration(
            "could not find an unused one-time pre-key id".to_string(),
        ))
    }

    pub(crate) fn insert(&mut self, record: OneTimePreKeyRecord) {
        self.keys.insert(record.id, record);
    }

    pub fn get(&self, id: u32) -> Option<&OneTimePreKeyRecord> {
        self.keys.get(&id)
    }

    /// Removes and returns the key, so it can never be used again.
    pub fn take(&mut self, id: u32) -> Option<OneTimePreKeyRecord> {
        self.keys.remove(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.keys.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OneTimePreKeyRecord> {
        self.keys.values()
    }

    /// Public halves in id order.
    pub fn public_keys(&self) -> Vec<OneTimePreKeyPublic> {
        self.keys
            .values()
            .map(|record| OneTimePreKeyPublic {
                id: record.id,
                public_key: record.public_key(),
            })
            .collect()
    }

    pub fn dispose(&mut self) {
        for record in self.keys.values_mut() {
            record.dispose();
        }
        self.keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SoftwareCrypto;

    #[test]
    fn test_initial_batch_is_sequential_from_two() {
        let provider = SoftwareCrypto::new();
        let mut store = OneTimePreKeyStore::new();
        let ids = store
            .generate_initial(5, &BTreeSet::new(), &provider)
            .unwrap();

        assert_eq!(ids, vec![2, 3, 4, 5, 6]);
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn test_initial_batch_skips_reserved_ids() {
        let provider = SoftwareCrypto::new();
        let mut store = OneTimePreKeyStore::new();
        let reserved = BTreeSet::from([3]);
        let ids = store.generate_initial(3, &reserved, &provider).unwrap();

        assert_eq!(ids, vec![2, 4, 5]);
    }

    #[test]
    fn test_random_batch_has_unique_ids() {
        let provider = SoftwareCrypto::new();
        let mut store = OneTimePreKeyStore::new();
        store
            .generate_initial(10, &BTreeSet::new(), &provider)
            .unwrap();
        let added = store
            .generate_random(20, &BTreeSet::new(), &provider)
            .unwrap();

        assert_eq!(store.len(), 30);
        assert!(added.iter().all(|id| *id >= FIRST_ONE_TIME_PRE_KEY_ID));
    }

    #[test]
    fn test_take_consumes_once() {
        let provider = SoftwareCrypto::new();
        let mut store = OneTimePreKeyStore::new();
        store
            .generate_initial(2, &BTreeSet::new(), &provider)
            .unwrap();

        assert!(store.take(2).is_some());
        assert!(store.take(2).is_none());
        assert!(!store.contains(2));
        assert_eq!(store.public_keys().len(), 1);
    }
}
