use std::collections::HashMap;
use time::{Duration, SteadyTime};

use crate::key::Key;

/// A stored value and the bookkeeping needed to expire and republish it.
#[derive(Clone, Debug)]
pub struct StoredValue {
    pub value: String,
    /// `true` if this node is the original author of the pair.
    pub is_publisher: bool,
    expire_deadline: SteadyTime,
}

/// The key-value pairs held by a node. Every pair expires `expiration` after it was last stored.
pub struct Storage {
    data: HashMap<Key, StoredValue>,
    expiration: Duration,
}

impl Storage {
    pub fn new(expiration: u64) -> Self {
        Storage {
            data: HashMap::new(),
            expiration: Duration::milliseconds(expiration as i64),
        }
    }

    /// Removes every pair whose deadline has passed and returns their keys.
    pub fn remove_expired(&mut self) -> Vec<Key> {
        let now = SteadyTime::now();
        let expired: Vec<Key> = self
            .data
            .iter()
            .filter(|(_, stored)| stored.expire_deadline <= now)
            .map(|(key, _)| *key)
            .collect();

        for key in &expired {
            info!("Removed expired {:?}", key);
            self.data.remove(key);
        }
        expired
    }

    /// Removes the pair at `key` if its deadline has passed. A pair that was stored again since
    /// the deadline was set carries the new deadline and survives.
    pub fn expire(&mut self, key: &Key) -> bool {
        let now = SteadyTime::now();
        match self.data.get(key) {
            Some(stored) if stored.expire_deadline <= now => {
                self.data.remove(key);
                true
            },
            _ => false,
        }
    }

    /// Inserts or replaces the pair at `key` and restarts its expiration. Storing the value a
    /// node already published does not clear the publisher flag.
    pub fn insert(&mut self, key: Key, value: String, is_publisher: bool) {
        self.remove_expired();
        let is_publisher = is_publisher
            || self
                .data
                .get(&key)
                .map_or(false, |stored| stored.is_publisher && stored.value == value);

        self.data.insert(
            key,
            StoredValue {
                value,
                is_publisher,
                expire_deadline: SteadyTime::now() + self.expiration,
            },
        );
    }

    pub fn get(&mut self, key: &Key) -> Option<&String> {
        self.expire(key);
        self.data.get(key).map(|stored| &stored.value)
    }

    /// Returns every held pair.
    pub fn get_entries(&self) -> Vec<(Key, String)> {
        self.data
            .iter()
            .map(|(key, stored)| (*key, stored.value.clone()))
            .collect()
    }

    /// Returns the pairs this node published.
    pub fn get_publisher_entries(&self) -> Vec<(Key, String)> {
        self.data
            .iter()
            .filter(|(_, stored)| stored.is_publisher)
            .map(|(key, stored)| (*key, stored.value.clone()))
            .collect()
    }

    /// Returns every held pair with its bookkeeping.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &StoredValue)> {
        self.data.iter()
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}
