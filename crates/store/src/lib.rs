//! idcache store: node-local identities (CIDR-style) living in the local scope.
//!
//! Writers serialize on a mutex and publish an immutable snapshot; lookups read the
//! snapshot without locking.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use idcache_core::{Identity, LabelArray, LocalIdentityStore, NumericIdentity, LOCAL_IDENTITY_FLAG};
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tracing::{debug, info};

/// Largest local index; the flag bit sits just above it.
pub const MAX_LOCAL_INDEX: u32 = LOCAL_IDENTITY_FLAG - 1;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LocalError {
    #[error("local identity space exhausted ({0} in use)")]
    Exhausted(usize),
    #[error("labels must not be empty")]
    EmptyLabels,
}

#[derive(Debug, Default)]
struct LocalSnapshot {
    by_id: FxHashMap<NumericIdentity, Identity>,
    by_labels: FxHashMap<LabelArray, NumericIdentity>,
}

struct Entry {
    identity: Identity,
    refs: u64,
}

struct LocalState {
    entries: FxHashMap<NumericIdentity, Entry>,
    by_labels: FxHashMap<LabelArray, NumericIdentity>,
    next: u32,
    max: u32,
}

impl LocalState {
    fn publish(&self) -> Arc<LocalSnapshot> {
        let by_id = self.entries.iter().map(|(id, e)| (*id, e.identity.clone())).collect();
        Arc::new(LocalSnapshot { by_id, by_labels: self.by_labels.clone() })
    }

    /// Scan from the cursor for a free index, wrapping once.
    fn next_free(&mut self) -> Option<NumericIdentity> {
        for _ in 0..self.max {
            let idx = self.next;
            self.next = if self.next >= self.max { 1 } else { self.next + 1 };
            let id = NumericIdentity(LOCAL_IDENTITY_FLAG | idx);
            if !self.entries.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }
}

/// Reference-counted node-local identity allocator.
pub struct LocalIdentities {
    snap: ArcSwap<LocalSnapshot>,
    state: Mutex<LocalState>,
}

impl Default for LocalIdentities {
    fn default() -> Self { Self::with_max(MAX_LOCAL_INDEX) }
}

impl LocalIdentities {
    pub fn new() -> Self { Self::default() }

    pub fn with_max(max: u32) -> Self {
        let max = max.clamp(1, MAX_LOCAL_INDEX);
        Self {
            snap: ArcSwap::from_pointee(LocalSnapshot::default()),
            state: Mutex::new(LocalState {
                entries: FxHashMap::default(),
                by_labels: FxHashMap::default(),
                next: 1,
                max,
            }),
        }
    }

    pub fn len(&self) -> usize { self.snap.load().by_id.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Get-or-allocate. Returns the identity and whether it was newly created.
    pub fn allocate(&self, labels: LabelArray) -> Result<(Identity, bool), LocalError> {
        if labels.is_empty() {
            return Err(LocalError::EmptyLabels);
        }
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(id) = st.by_labels.get(&labels).copied() {
            if let Some(e) = st.entries.get_mut(&id) {
                e.refs += 1;
                debug!(id = %id, refs = e.refs, "local identity reused");
                return Ok((e.identity.clone(), false));
            }
        }
        let id = st.next_free().ok_or(LocalError::Exhausted(st.entries.len()))?;
        let identity = Identity::new(id, labels.clone());
        st.entries.insert(id, Entry { identity: identity.clone(), refs: 1 });
        st.by_labels.insert(labels, id);
        self.snap.store(st.publish());
        counter!("local_identity_allocations_total", 1u64);
        gauge!("local_identities", st.entries.len() as f64);
        info!(id = %id, labels = %identity.labels, "local identity allocated");
        Ok((identity, true))
    }

    /// Drop one reference. Returns true when the identity was removed.
    pub fn release(&self, id: NumericIdentity) -> bool {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let remove = match st.entries.get_mut(&id) {
            Some(e) if e.refs > 1 => {
                e.refs -= 1;
                false
            }
            Some(_) => true,
            None => return false,
        };
        if remove {
            if let Some(e) = st.entries.remove(&id) {
                st.by_labels.remove(&e.identity.labels);
            }
            self.snap.store(st.publish());
            gauge!("local_identities", st.entries.len() as f64);
            info!(id = %id, "local identity released");
        }
        remove
    }
}

impl LocalIdentityStore for LocalIdentities {
    fn lookup(&self, labels: &LabelArray) -> Option<Identity> {
        let snap = self.snap.load();
        snap.by_labels.get(labels).and_then(|id| snap.by_id.get(id)).cloned()
    }

    fn lookup_by_id(&self, id: NumericIdentity) -> Option<Identity> {
        if !id.has_local_scope() {
            return None;
        }
        self.snap.load().by_id.get(&id).cloned()
    }

    fn get_identities(&self) -> Vec<Identity> { self.snap.load().by_id.values().cloned().collect() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idcache_core::Label;

    fn cidr(prefix: &str) -> LabelArray { LabelArray::new([Label::new("cidr", prefix, "")]) }

    #[test]
    fn allocate_is_refcounted() {
        let s = LocalIdentities::new();
        let (a, new_a) = s.allocate(cidr("10.0.0.0/8")).unwrap();
        let (b, new_b) = s.allocate(cidr("10.0.0.0/8")).unwrap();
        assert!(new_a && !new_b);
        assert_eq!(a, b);
        assert!(a.id.has_local_scope());

        assert!(!s.release(a.id));
        assert!(s.lookup(&cidr("10.0.0.0/8")).is_some());
        assert!(s.release(a.id));
        assert!(s.lookup(&cidr("10.0.0.0/8")).is_none());
        assert!(s.lookup_by_id(a.id).is_none());
        assert!(!s.release(a.id));
    }

    #[test]
    fn distinct_labels_get_distinct_ids() {
        let s = LocalIdentities::new();
        let (a, _) = s.allocate(cidr("10.0.0.0/8")).unwrap();
        let (b, _) = s.allocate(cidr("192.168.0.0/16")).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(s.get_identities().len(), 2);
        assert_eq!(s.lookup_by_id(b.id).unwrap().labels, cidr("192.168.0.0/16"));
    }

    #[test]
    fn exhaustion_and_reuse() {
        let s = LocalIdentities::with_max(2);
        let (a, _) = s.allocate(cidr("1.0.0.0/8")).unwrap();
        s.allocate(cidr("2.0.0.0/8")).unwrap();
        assert_eq!(s.allocate(cidr("3.0.0.0/8")), Err(LocalError::Exhausted(2)));
        assert!(s.release(a.id));
        let (c, created) = s.allocate(cidr("3.0.0.0/8")).unwrap();
        assert!(created);
        assert_eq!(c.id, a.id);
    }

    #[test]
    fn rejects_empty_and_global_ids() {
        let s = LocalIdentities::new();
        assert_eq!(s.allocate(LabelArray::empty()), Err(LocalError::EmptyLabels));
        assert!(s.lookup_by_id(NumericIdentity(300)).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_readers_see_published_state() {
        let s = Arc::new(LocalIdentities::new());
        let (id, _) = s.allocate(cidr("10.1.0.0/16")).unwrap();
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let s = Arc::clone(&s);
            tasks.push(tokio::spawn(async move { s.lookup(&cidr("10.1.0.0/16")).map(|i| i.id) }));
        }
        for t in tasks {
            assert_eq!(t.await.unwrap(), Some(id.id));
        }
    }
}
