//! Collaborator seams: the distributed allocator and the node-local identity store.
//!
//! The cache never assigns identities itself. It reads from whichever authority owns a
//! sub-range and consumes the allocator's change stream.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{Identity, LabelArray, NumericIdentity};

/// Value stored under an identity key in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocatorKey {
    /// A label-bearing global identity.
    Global(LabelArray),
    /// Anything else found in the keyspace; kept so callers can report it.
    Unrecognized { kind: String, raw: String },
}

impl AllocatorKey {
    pub fn labels(&self) -> Option<&LabelArray> {
        match self {
            AllocatorKey::Global(l) => Some(l),
            AllocatorKey::Unrecognized { .. } => None,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            AllocatorKey::Global(_) => "global",
            AllocatorKey::Unrecognized { kind, .. } => kind,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Delete,
    Modify,
}

/// Raw change notification for one identity key. Only `Create` is guaranteed to carry a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorEvent {
    pub kind: EventKind,
    pub id: NumericIdentity,
    pub key: Option<AllocatorKey>,
}

impl AllocatorEvent {
    pub fn create(id: NumericIdentity, key: AllocatorKey) -> Self {
        Self { kind: EventKind::Create, id, key: Some(key) }
    }

    pub fn modify(id: NumericIdentity, key: AllocatorKey) -> Self {
        Self { kind: EventKind::Modify, id, key: Some(key) }
    }

    pub fn delete(id: NumericIdentity) -> Self { Self { kind: EventKind::Delete, id, key: None } }
}

pub type EventSender = mpsc::UnboundedSender<AllocatorEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<AllocatorEvent>;

#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    #[error("no free identity in range {min}..={max}")]
    Exhausted { min: NumericIdentity, max: NumericIdentity },
    #[error("allocator closed")]
    Closed,
}

/// Read and watch interface of the cluster-wide allocator.
#[async_trait::async_trait]
pub trait IdentityAllocator: Send + Sync {
    /// Pure lookup; never allocates. `Ok(None)` means no identity is assigned to these labels.
    async fn get(&self, labels: &LabelArray) -> Result<Option<NumericIdentity>, AllocatorError>;

    async fn get_by_id(&self, id: NumericIdentity) -> Result<Option<AllocatorKey>, AllocatorError>;

    /// Visit every entry in the allocator's local cache. No remote calls.
    fn foreach_cache(&self, visit: &mut dyn FnMut(NumericIdentity, Option<&AllocatorKey>));

    /// New event stream for the identity keyspace. Each call yields an independent receiver.
    fn subscribe(&self) -> EventReceiver;
}

/// Node-local identities that never need cluster-wide agreement.
pub trait LocalIdentityStore: Send + Sync {
    fn lookup(&self, labels: &LabelArray) -> Option<Identity>;
    fn lookup_by_id(&self, id: NumericIdentity) -> Option<Identity>;
    fn get_identities(&self) -> Vec<Identity>;
}
