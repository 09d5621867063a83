//! Diff suppression for per-destination pushes.

use crate::hasher::compute_payload_hash;
use crate::types::Hash;
use serde_json::Value;
use std::collections::HashMap;
use std::hash::Hash as StdHash;

/// Independent push channels of a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Data,
    Status,
}

/// Last delivered payload hash per `(destination, channel)`.
#[derive(Debug, Clone)]
pub struct ChangeCache<D> {
    hashes: HashMap<(D, Channel), Hash>,
}

impl<D> Default for ChangeCache<D> {
    fn default() -> Self {
        Self {
            hashes: HashMap::new(),
        }
    }
}

impl<D: Eq + StdHash + Clone> ChangeCache<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `emit` only if `payload` differs from what `destination` last
    /// received on `channel`. Returns whether it emitted.
    pub fn maybe_emit<F>(&mut self, destination: &D, channel: Channel, payload: &Value, emit: F) -> bool
    where
        F: FnOnce(&D, &Value),
    {
        let hash = compute_payload_hash(payload);
        let slot = (destination.clone(), channel);
        if self.hashes.get(&slot) == Some(&hash) {
            return false;
        }
        self.hashes.insert(slot, hash);
        emit(destination, payload);
        true
    }

    /// Drop every channel of a destination; its next push is treated as first contact.
    pub fn forget(&mut self, destination: &D) {
        self.hashes.retain(|(dest, _), _| dest != destination);
    }

    pub fn contains(&self, destination: &D, channel: Channel) -> bool {
        self.hashes.contains_key(&(destination.clone(), channel))
    }

    pub fn clear(&mut self) {
        self.hashes.clear();
    }
}
