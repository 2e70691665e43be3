//! Per-dispatcher registry of connection handler chains.
//!
//! Slab keys double as mio tokens, so lookup on readiness is O(1).

use slab::Slab;
use std::sync::{Arc, OnceLock};

use crate::io::{IoHandler, IoHandlerCallback};
use crate::runtime::flush::FlushTracker;
use mio::Token;

/// Slot through which the application side learns the dispatcher token of
/// its connection once the registration has been processed.
pub type TokenCell = Arc<OnceLock<Token>>;

/// A connection as owned by its dispatcher.
pub struct Registration {
    /// The handler chain, outermost handler first.
    pub chain: Box<dyn IoHandler>,
    /// Upward callback handed to the chain on init.
    pub callback: Arc<dyn IoHandlerCallback>,
    pub token: TokenCell,
    pub flush: Arc<FlushTracker>,
    /// Highest flush sequence handed to the chain so far.
    pub last_flush_seq: u64,
}

impl Registration {
    pub fn new(
        chain: Box<dyn IoHandler>,
        callback: Arc<dyn IoHandlerCallback>,
        token: TokenCell,
        flush: Arc<FlushTracker>,
    ) -> Self {
        Self {
            chain,
            callback,
            token,
            flush,
            last_flush_seq: 0,
        }
    }
}

/// Registry of active registrations using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry<T = Registration> {
    connections: Slab<T>,
    max_connections: usize,
}

impl<T> ConnectionRegistry<T> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a new entry into the registry.
    ///
    /// Hands the entry back if the registry is at capacity.
    pub fn insert(&mut self, entry: T) -> Result<usize, T> {
        if self.connections.len() >= self.max_connections {
            return Err(entry);
        }
        Ok(self.connections.insert(entry))
    }

    pub fn get(&self, id: usize) -> Option<&T> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        self.connections.get_mut(id)
    }

    pub fn remove(&mut self, id: usize) -> Option<T> {
        self.connections.try_remove(id)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active entries.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of entries allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Snapshot of the current keys, for passes that may remove entries.
    pub fn keys(&self) -> Vec<usize> {
        self.connections.iter().map(|(key, _)| key).collect()
    }

    /// Remove and return every entry.
    pub fn drain(&mut self) -> Vec<T> {
        self.connections.drain().collect()
    }
}
