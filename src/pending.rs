// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Pending Set
//!
//! The bookkeeping structure behind both trackers: an ordered map from a
//! sequence number or correlation token to the operation still awaiting its
//! resolution. Keys are unique, every entry leaves the set exactly once.
//!
//! The set itself is not synchronized; each tracker guards it with its own lock.

use crate::errors::TrackerError;
use std::{
    collections::BTreeMap,
    fmt::Display,
    time::{Duration, Instant},
};

/// One outbound operation awaiting resolution.
#[derive(Debug, Clone)]
pub struct PendingEntry<P> {
    /// Handle to whatever the owner needs once the entry resolves.
    pub payload: P,
    pub created_at: Instant,
}

impl<P> PendingEntry<P> {
    pub fn new(payload: P) -> Self {
        PendingEntry {
            payload,
            created_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Ordered mapping from key to [`PendingEntry`].
#[derive(Debug)]
pub struct PendingSet<K, P> {
    entries: BTreeMap<K, PendingEntry<P>>,
}

impl<K, P> Default for PendingSet<K, P> {
    fn default() -> Self {
        PendingSet {
            entries: BTreeMap::new(),
        }
    }
}

impl<K, P> PendingSet<K, P>
where
    K: Ord + Clone + Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new entry.
    ///
    /// # Returns
    /// `DuplicateKey` if the key is already pending; the existing entry is kept.
    pub fn insert(&mut self, key: K, payload: P) -> Result<(), TrackerError> {
        if self.entries.contains_key(&key) {
            return Err(TrackerError::DuplicateKey(key.to_string()));
        }

        self.entries.insert(key, PendingEntry::new(payload));
        Ok(())
    }

    pub fn remove(&mut self, key: &K) -> Option<PendingEntry<P>> {
        self.entries.remove(key)
    }

    /// Removes every entry whose key is less than or equal to `key`.
    ///
    /// Entries come back in ascending key order.
    pub fn remove_up_to(&mut self, key: &K) -> Vec<(K, PendingEntry<P>)> {
        let mut upper = self.entries.split_off(key);
        let mut lower = std::mem::take(&mut self.entries);

        if let Some(entry) = upper.remove(key) {
            lower.insert(key.clone(), entry);
        }

        self.entries = upper;
        lower.into_iter().collect()
    }

    /// Removes entries that have been pending for at least `max_age`.
    pub fn evict_older_than(&mut self, max_age: Duration) -> Vec<(K, PendingEntry<P>)> {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.age() >= max_age)
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|entry| (key, entry)))
            .collect()
    }

    /// Empties the set, handing back everything that was pending.
    pub fn drain(&mut self) -> Vec<(K, PendingEntry<P>)> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.keys().cloned().collect()
    }
}
