// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Session registry (spec §4.6): dedup and lifecycle of input/output
//! session objects keyed by a session specifier. Grounded on the
//! `DashMap<u16, Arc<Session>>` cache-by-key pattern in
//! `client/pool_sessions.rs::Pool`, generalized from a TSIH key to an
//! arbitrary hashable specifier.

use std::{hash::Hash, sync::Arc};

use dashmap::DashMap;

use crate::error::TransportResult;

/// Maps session specifiers to lazily-constructed, cached session objects.
///
/// The single-threaded cooperative contract (spec §5) means the registry is
/// never mutated concurrently; `DashMap` is kept here for the same reason
/// the teacher crate uses it in `Pool` — cheap cloning of the session table
/// and a familiar `entry`-style API — not for thread-safety the transport
/// does not need.
pub struct SessionRegistry<K, V> {
    sessions: DashMap<K, Arc<V>>,
}

impl<K, V> SessionRegistry<K, V>
where K: Eq + Hash + Clone
{
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.sessions.get(key).map(|entry| entry.clone())
    }

    /// Returns the cached session for `key`, or constructs one via
    /// `construct`, storing it on success. On construction failure the
    /// partial entry is never inserted (spec §4.6).
    pub fn get_or_try_insert_with(
        &self,
        key: K,
        construct: impl FnOnce() -> TransportResult<V>,
    ) -> TransportResult<Arc<V>> {
        if let Some(existing) = self.sessions.get(&key) {
            return Ok(existing.clone());
        }
        let session = Arc::new(construct()?);
        self.sessions.insert(key, session.clone());
        Ok(session)
    }

    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.sessions.remove(key).map(|(_, v)| v)
    }

    pub fn values(&self) -> Vec<Arc<V>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl<K, V> Default for SessionRegistry<K, V>
where K: Eq + Hash + Clone
{
    fn default() -> Self {
        Self::new()
    }
}
