//! idcache kvstore: in-process stand-in for the shared key-value identity allocator.
//!
//! Holds the allocator's local cache of `id -> key` entries and fans change events out
//! to subscribers. Subscribing replays the current cache as `Create` events before any
//! live event (list+watch), all under the same lock, so a subscriber never sees a live
//! event for an entry it has not been told about.

#![forbid(unsafe_code)]

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use idcache_core::config::Config;
use idcache_core::{
    AllocatorError, AllocatorEvent, AllocatorKey, EventReceiver, EventSender, IdentityAllocator, LabelArray,
    NumericIdentity, MAXIMAL_ALLOCATION_IDENTITY, MINIMAL_ALLOCATION_IDENTITY,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Default)]
struct KvState {
    cache: FxHashMap<NumericIdentity, AllocatorKey>,
    by_labels: FxHashMap<LabelArray, NumericIdentity>,
    subscribers: Vec<EventSender>,
    closed: bool,
}

impl KvState {
    /// Fan out to live subscribers, pruning the ones that went away.
    fn emit(&mut self, ev: AllocatorEvent) {
        counter!("kvstore_events_total", 1u64);
        self.subscribers.retain(|tx| tx.send(ev.clone()).is_ok());
    }

    /// The first id stored for a label set stays its owner.
    fn index(&mut self, id: NumericIdentity, key: &AllocatorKey) {
        if let Some(labels) = key.labels() {
            self.by_labels.entry(labels.clone()).or_insert(id);
        }
    }

    /// Call after `cache` no longer maps `id` to `key`. Ownership passes to the
    /// lowest remaining id holding the same labels, if any.
    fn unindex(&mut self, id: NumericIdentity, key: &AllocatorKey) {
        let Some(labels) = key.labels() else {
            return;
        };
        if self.by_labels.get(labels) != Some(&id) {
            return;
        }
        let heir = self
            .cache
            .iter()
            .filter(|(_, k)| k.labels() == Some(labels))
            .map(|(other, _)| *other)
            .min();
        match heir {
            Some(other) => {
                self.by_labels.insert(labels.clone(), other);
            }
            None => {
                self.by_labels.remove(labels);
            }
        }
    }
}

pub struct KvAllocator {
    state: RwLock<KvState>,
    min_id: NumericIdentity,
    max_id: NumericIdentity,
}

impl Default for KvAllocator {
    fn default() -> Self { Self::new(MINIMAL_ALLOCATION_IDENTITY, MAXIMAL_ALLOCATION_IDENTITY) }
}

impl KvAllocator {
    pub fn new(min_id: NumericIdentity, max_id: NumericIdentity) -> Self {
        Self { state: RwLock::new(KvState::default()), min_id, max_id }
    }

    pub fn from_config(cfg: &Config) -> Self { Self::new(cfg.min_id, cfg.max_id) }

    fn read(&self) -> RwLockReadGuard<'_, KvState> { self.state.read().unwrap_or_else(|e| e.into_inner()) }
    fn write(&self) -> RwLockWriteGuard<'_, KvState> { self.state.write().unwrap_or_else(|e| e.into_inner()) }

    pub fn len(&self) -> usize { self.read().cache.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Get-or-allocate the lowest free id in range. Returns the id and whether it is new.
    pub fn allocate(&self, labels: LabelArray) -> Result<(NumericIdentity, bool), AllocatorError> {
        let mut st = self.write();
        if st.closed {
            return Err(AllocatorError::Closed);
        }
        if let Some(id) = st.by_labels.get(&labels).copied() {
            return Ok((id, false));
        }
        let id = (self.min_id.get()..=self.max_id.get())
            .map(NumericIdentity)
            .find(|id| !st.cache.contains_key(id))
            .ok_or(AllocatorError::Exhausted { min: self.min_id, max: self.max_id })?;
        let key = AllocatorKey::Global(labels);
        st.index(id, &key);
        st.cache.insert(id, key.clone());
        st.emit(AllocatorEvent::create(id, key));
        counter!("kvstore_allocations_total", 1u64);
        info!(id = %id, "identity allocated");
        Ok((id, true))
    }

    /// Remove an entry. Returns `Ok(false)` when the id was not present.
    pub fn release(&self, id: NumericIdentity) -> Result<bool, AllocatorError> {
        let mut st = self.write();
        if st.closed {
            return Err(AllocatorError::Closed);
        }
        let Some(key) = st.cache.remove(&id) else {
            return Ok(false);
        };
        st.unindex(id, &key);
        st.emit(AllocatorEvent::delete(id));
        info!(id = %id, "identity released");
        Ok(true)
    }

    /// Upsert any payload under `id`, as another writer in the cluster would.
    /// Emits `Create` for a new id and `Modify` for an existing one.
    pub fn insert_raw(&self, id: NumericIdentity, key: AllocatorKey) -> Result<(), AllocatorError> {
        let mut st = self.write();
        if st.closed {
            return Err(AllocatorError::Closed);
        }
        let prev = st.cache.insert(id, key.clone());
        if let Some(old) = &prev {
            st.unindex(id, old);
        }
        st.index(id, &key);
        if prev.is_some() {
            st.emit(AllocatorEvent::modify(id, key));
        } else {
            st.emit(AllocatorEvent::create(id, key));
        }
        debug!(id = %id, existed = prev.is_some(), "raw entry stored");
        Ok(())
    }

    /// Upstream shutdown: every subscriber channel closes and later calls fail.
    pub fn close(&self) {
        let mut st = self.write();
        st.closed = true;
        let n = st.subscribers.len();
        st.subscribers.clear();
        warn!(subscribers = n, "kvstore allocator closed");
    }
}

#[async_trait::async_trait]
impl IdentityAllocator for KvAllocator {
    async fn get(&self, labels: &LabelArray) -> Result<Option<NumericIdentity>, AllocatorError> {
        let st = self.read();
        if st.closed {
            return Err(AllocatorError::Closed);
        }
        Ok(st.by_labels.get(labels).copied())
    }

    async fn get_by_id(&self, id: NumericIdentity) -> Result<Option<AllocatorKey>, AllocatorError> {
        let st = self.read();
        if st.closed {
            return Err(AllocatorError::Closed);
        }
        Ok(st.cache.get(&id).cloned())
    }

    fn foreach_cache(&self, visit: &mut dyn FnMut(NumericIdentity, Option<&AllocatorKey>)) {
        let st = self.read();
        for (id, key) in st.cache.iter() {
            visit(*id, Some(key));
        }
    }

    fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut st = self.write();
        if st.closed {
            return rx;
        }
        for (id, key) in st.cache.iter() {
            let _ = tx.send(AllocatorEvent::create(*id, key.clone()));
        }
        debug!(replayed = st.cache.len(), "subscriber registered");
        st.subscribers.push(tx);
        rx
    }
}
