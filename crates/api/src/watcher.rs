//! Identity event watcher.
//!
//! Turns the allocator's raw create/delete stream into batches of disjoint `added` and
//! `deleted` sets. Each iteration blocks for the first applicable event, then drains
//! whatever else is already queued without waiting, and hands the batch to the owner in
//! one synchronous call. A slow owner therefore holds events in the channel instead of
//! dropping them.

use std::sync::Arc;

use idcache_core::{AllocatorEvent, AllocatorKey, EventKind, EventReceiver, IdentityCache, LabelArray};
use metrics::{counter, histogram};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receiver of incremental identity changes. Batches must be applied cumulatively.
pub trait IdentityAllocatorOwner: Send + Sync {
    /// `added` and `deleted` never share a key. `deleted` values are empty.
    fn update_identities(&self, added: IdentityCache, deleted: IdentityCache);
}

/// One delivered batch, for owners that prefer a channel over a callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityUpdate {
    pub added: IdentityCache,
    pub deleted: IdentityCache,
}

impl IdentityAllocatorOwner for mpsc::UnboundedSender<IdentityUpdate> {
    fn update_identities(&self, added: IdentityCache, deleted: IdentityCache) {
        if self.send(IdentityUpdate { added, deleted }).is_err() {
            debug!("owner channel closed; batch dropped");
        }
    }
}

/// Record `event` into exactly one of `added`/`deleted`.
///
/// Returns false when the event contributed nothing to the batch.
pub fn collect_event(event: AllocatorEvent, added: &mut IdentityCache, deleted: &mut IdentityCache) -> bool {
    let id = event.id;
    match event.kind {
        EventKind::Create => match event.key {
            Some(AllocatorKey::Global(labels)) => {
                // A delete seen earlier in this batch is undone by the re-create.
                deleted.remove(&id);
                added.insert(id, labels);
                true
            }
            other => {
                let kind = other.as_ref().map(AllocatorKey::kind).unwrap_or("none");
                warn!(id = %id, kind = %kind, "collect: ignoring unknown identity type");
                false
            }
        },
        EventKind::Delete => {
            added.remove(&id);
            // Always recorded: the id may predate this watcher.
            deleted.insert(id, LabelArray::empty());
            true
        }
        EventKind::Modify => false,
    }
}

fn is_create_or_delete(ev: &AllocatorEvent) -> bool { matches!(ev.kind, EventKind::Create | EventKind::Delete) }

/// Handle to a running watcher task. Dropping it also stops the task.
pub struct IdentityWatcher {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl IdentityWatcher {
    /// Spawn the watcher on the current tokio runtime.
    pub fn spawn(events: EventReceiver, owner: Arc<dyn IdentityAllocatorOwner>) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run(events, stop_rx, owner));
        Self { stop_tx, task }
    }

    /// Signal cancellation. Consumes the handle, so it can only happen once.
    /// Await the returned handle to wait for the task to exit.
    pub fn stop(self) -> JoinHandle<()> {
        let _ = self.stop_tx.send(());
        self.task
    }
}

async fn run(mut events: EventReceiver, mut stop_rx: oneshot::Receiver<()>, owner: Arc<dyn IdentityAllocatorOwner>) {
    info!("identity watcher started");
    loop {
        let mut added = IdentityCache::default();
        let mut deleted = IdentityCache::default();

        // Idle: wait for the first applicable event, or stop.
        loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => {
                    info!("identity watcher stopped");
                    return;
                }
                ev = events.recv() => match ev {
                    Some(ev) => {
                        counter!("identity_watcher_events_total", 1u64);
                        if is_create_or_delete(&ev) && collect_event(ev, &mut added, &mut deleted) {
                            break;
                        }
                    }
                    None => {
                        info!("identity event channel closed; watcher exiting");
                        return;
                    }
                },
            }
        }

        // Draining: take whatever is already queued, never wait.
        let mut closed = false;
        loop {
            match events.try_recv() {
                Ok(ev) => {
                    counter!("identity_watcher_events_total", 1u64);
                    if is_create_or_delete(&ev) {
                        collect_event(ev, &mut added, &mut deleted);
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    closed = true;
                    break;
                }
            }
        }

        // Flush
        let size = added.len() + deleted.len();
        debug!(added = added.len(), deleted = deleted.len(), "delivering identity batch");
        counter!("identity_watcher_batches_total", 1u64);
        histogram!("identity_watcher_batch_size", size as f64);
        owner.update_identities(added, deleted);

        if closed {
            info!("identity event channel closed; watcher exiting after final batch");
            return;
        }
    }
}
