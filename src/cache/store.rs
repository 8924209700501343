//! Keyed object storage.
//!
//! One slot per key: either an object or a hit-for-pass marker. Slots are
//! sharded by `DashMap`, so unrelated keys never contend on one lock.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::cache::entry::CacheEntry;
use crate::cache::key::CacheKey;

/// Contents of a key.
#[derive(Debug, Clone)]
pub enum Slot {
    Object(Arc<CacheEntry>),
    /// Every request for the key is passed until `created_at + ttl`.
    HitForPass { created_at: Instant, ttl: Duration },
}

impl Slot {
    /// True once the slot can no longer be used for anything.
    fn is_dead(&self, now: Instant) -> bool {
        match self {
            Slot::Object(entry) => entry.age(now) >= entry.retention(),
            Slot::HitForPass { created_at, ttl } => now.saturating_duration_since(*created_at) >= *ttl,
        }
    }
}

#[derive(Debug, Default)]
pub struct CacheStore {
    slots: DashMap<CacheKey, Slot>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<Slot> {
        self.slots.get(key).map(|r| r.value().clone())
    }

    /// Insert, replacing whatever the key held.
    pub fn insert(&self, key: CacheKey, slot: Slot) {
        self.slots.insert(key, slot);
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.slots.remove(key).is_some()
    }

    /// Drop every slot that is past all of its windows.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_dead(now));
        before.saturating_sub(self.slots.len())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
