//! idcache API façade: a caching identity allocator.
//!
//! Merges three sources into one read path, in this order:
//! 1. compiled-in reserved identities,
//! 2. the node-local identity store,
//! 3. the distributed allocator (optional; absent means local-only mode).
//!
//! No call here returns an error. Misses and allocator failures both come back as `None`.

#![forbid(unsafe_code)]

use std::sync::Arc;

use idcache_core::{
    lookup_reserved_identity, lookup_reserved_identity_by_labels, reserved_identities, unknown_identity,
    AllocatorKey, EventReceiver, Identity, IdentityAllocator, IdentityCache, IdentityModel, LabelArray,
    LocalIdentityStore, NumericIdentity, IDENTITY_UNKNOWN,
};
use metrics::counter;
use tracing::{debug, info, warn};

pub mod watcher;

pub use watcher::{collect_event, IdentityAllocatorOwner, IdentityUpdate, IdentityWatcher};

pub struct CachingIdentityAllocator {
    allocator: Option<Arc<dyn IdentityAllocator>>,
    local: Arc<dyn LocalIdentityStore>,
}

impl CachingIdentityAllocator {
    pub fn new(allocator: Option<Arc<dyn IdentityAllocator>>, local: Arc<dyn LocalIdentityStore>) -> Self {
        if allocator.is_none() {
            info!("identity cache running without a distributed allocator (local-only)");
        }
        Self { allocator, local }
    }

    pub fn local_only(local: Arc<dyn LocalIdentityStore>) -> Self { Self::new(None, local) }

    pub fn is_local_only(&self) -> bool { self.allocator.is_none() }

    /// Walk the allocator's cached label-bearing entries. Unrecognized payloads are logged and skipped.
    fn foreach_global(&self, mut visit: impl FnMut(NumericIdentity, &LabelArray)) {
        let Some(alloc) = &self.allocator else {
            return;
        };
        alloc.foreach_cache(&mut |id: NumericIdentity, key: Option<&AllocatorKey>| match key {
            Some(AllocatorKey::Global(labels)) => visit(id, labels),
            Some(other) => {
                counter!("identity_cache_unknown_key_total", 1u64);
                warn!(id = %id, kind = %other.kind(), "ignoring unknown identity type");
            }
            None => {}
        });
    }

    /// Fresh id → labels view over all three sources. Reads cached/local state only.
    pub fn get_identity_cache(&self) -> IdentityCache {
        debug!("building identity cache");
        let mut cache = IdentityCache::default();
        self.foreach_global(|id, labels| {
            cache.insert(id, labels.clone());
        });
        for identity in reserved_identities() {
            cache.insert(identity.id, identity.labels.clone());
        }
        for identity in self.local.get_identities() {
            cache.insert(identity.id, identity.labels);
        }
        cache
    }

    /// All known identities as presentation records, sorted by id.
    pub fn get_identities(&self) -> Vec<IdentityModel> {
        let mut out = Vec::new();
        self.foreach_global(|id, labels| out.push(Identity::new(id, labels.clone()).model()));
        out.extend(reserved_identities().map(Identity::model));
        out.extend(self.local.get_identities().iter().map(Identity::model));
        out.sort_by_key(|m| m.id);
        out
    }

    /// Resolve labels to an identity without allocating.
    pub async fn lookup_identity(&self, labels: &LabelArray) -> Option<Identity> {
        if let Some(reserved) = lookup_reserved_identity_by_labels(labels) {
            return Some(reserved.clone());
        }
        if let Some(local) = self.local.lookup(labels) {
            return Some(local);
        }
        let alloc = self.allocator.as_ref()?;
        match alloc.get(labels).await {
            Ok(Some(id)) => Some(Identity::new(id, labels.clone())),
            Ok(None) => None,
            Err(e) => {
                debug!(error = %e, labels = %labels, "allocator lookup failed");
                None
            }
        }
    }

    pub async fn lookup_identity_by_id(&self, id: NumericIdentity) -> Option<Identity> {
        if id == IDENTITY_UNKNOWN {
            return Some(unknown_identity().clone());
        }
        if let Some(reserved) = lookup_reserved_identity(id) {
            return Some(reserved.clone());
        }
        if let Some(local) = self.local.lookup_by_id(id) {
            return Some(local);
        }
        let alloc = self.allocator.as_ref()?;
        match alloc.get_by_id(id).await {
            Ok(Some(AllocatorKey::Global(labels))) => Some(Identity::new(id, labels)),
            Ok(Some(other)) => {
                debug!(id = %id, kind = %other.kind(), "identity has unrecognized payload");
                None
            }
            Ok(None) => None,
            Err(e) => {
                debug!(id = %id, error = %e, "allocator lookup by id failed");
                None
            }
        }
    }

    /// Start a watcher delivering allocator changes to `owner`. `None` in local-only mode.
    /// Must be called from within a tokio runtime.
    pub fn watch(&self, owner: Arc<dyn IdentityAllocatorOwner>) -> Option<IdentityWatcher> {
        let alloc = self.allocator.as_ref()?;
        Some(IdentityWatcher::spawn(alloc.subscribe(), owner))
    }

    /// Start a watcher over an event stream supplied by the caller.
    pub fn watch_events(&self, events: EventReceiver, owner: Arc<dyn IdentityAllocatorOwner>) -> IdentityWatcher {
        IdentityWatcher::spawn(events, owner)
    }
}
