//! Observable sync status.
//!
//! [`StatusPublisher`] owns the current [`SyncSnapshot`]. The orchestrator
//! rebuilds the snapshot after every operation terminal-state change and
//! every state transition and publishes it; listeners are called
//! synchronously, in subscription order.

use crate::queue::Rejection;
use fieldsync_protocol::{Conflict, OperationId, ResourceKey, Timestamp};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::warn;

/// The orchestrator's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SyncState {
    /// Not syncing and nothing awaits a decision.
    #[default]
    Idle,
    /// A sync pass is running.
    Syncing,
    /// Not syncing; at least one conflict awaits a decision.
    IdleWithConflicts,
}

impl SyncState {
    /// Returns true while a pass is running.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Syncing)
    }

    /// Returns true if a new pass may start.
    pub fn can_start_sync(&self) -> bool {
        !self.is_active()
    }
}

/// Progress of the running pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    /// Operations in the pass.
    pub total: usize,
    /// Operations settled so far.
    pub completed: usize,
    /// Resource being processed.
    pub current: Option<ResourceKey>,
}

impl SyncProgress {
    /// Completion in percent.
    pub fn percentage(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.completed.min(self.total) * 100) / self.total) as u8
    }
}

/// A queued operation that keeps failing transiently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistentError {
    /// The failing operation.
    pub operation_id: OperationId,
    /// Its resource.
    pub key: ResourceKey,
    /// Failed attempts so far.
    pub attempt_count: u32,
    /// Last failure.
    pub last_error: Option<String>,
}

/// Everything a status consumer needs. Derived, never stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncSnapshot {
    /// Connectivity.
    pub is_online: bool,
    /// Whether a pass is running.
    pub is_syncing: bool,
    /// Orchestrator state.
    pub state: SyncState,
    /// Pending operations.
    pub queued_count: usize,
    /// Pending operations per resource type.
    pub pending_by_type: BTreeMap<String, usize>,
    /// Conflicts awaiting a decision.
    pub conflicts: Vec<Conflict>,
    /// Rejections awaiting acknowledgement.
    pub rejections: Vec<Rejection>,
    /// Operations past the retry limit.
    pub persistent_errors: Vec<PersistentError>,
    /// Completion time of the last successful pass.
    pub last_sync_at: Option<Timestamp>,
    /// Progress of the running pass.
    pub progress: Option<SyncProgress>,
}

type Listener = Arc<dyn Fn(&SyncSnapshot) + Send + Sync>;

struct Inner {
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_id: Mutex<u64>,
    current: Mutex<SyncSnapshot>,
    watch: watch::Sender<SyncSnapshot>,
}

/// Publishes snapshots to subscribers.
#[derive(Clone)]
pub struct StatusPublisher {
    inner: Arc<Inner>,
}

impl StatusPublisher {
    /// Creates a publisher holding `initial`.
    pub fn new(initial: SyncSnapshot) -> Self {
        let (watch, _) = watch::channel(initial.clone());
        Self {
            inner: Arc::new(Inner {
                listeners: Mutex::new(Vec::new()),
                next_id: Mutex::new(0),
                current: Mutex::new(initial),
                watch,
            }),
        }
    }

    /// Returns the latest snapshot.
    pub fn snapshot(&self) -> SyncSnapshot {
        self.inner.current.lock().clone()
    }

    /// A watch receiver for async consumers.
    pub fn watch(&self) -> watch::Receiver<SyncSnapshot> {
        self.inner.watch.subscribe()
    }

    /// Registers a listener. It stays registered until the returned
    /// [`Subscription`] is used to unsubscribe.
    #[must_use = "dropping the subscription keeps the listener registered forever"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncSnapshot) + Send + Sync + 'static,
    {
        let id = {
            let mut next = self.inner.next_id.lock();
            *next += 1;
            *next
        };
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        Subscription {
            id,
            publisher: Arc::downgrade(&self.inner),
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Stores and emits a snapshot.
    ///
    /// A panicking listener is logged and skipped; the others are still
    /// called.
    pub fn publish(&self, snapshot: SyncSnapshot) {
        *self.inner.current.lock() = snapshot.clone();
        self.inner.watch.send_replace(snapshot.clone());

        let listeners: Vec<_> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(id, l)| (*id, Arc::clone(l)))
            .collect();

        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&snapshot))).is_err() {
                warn!(listener = id, "status listener panicked");
            }
        }
    }
}

/// Handle returned by [`StatusPublisher::subscribe`].
pub struct Subscription {
    id: u64,
    publisher: Weak<Inner>,
}

impl Subscription {
    /// Removes the listener.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.publisher.upgrade() {
            inner.listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted(counter: &Arc<AtomicUsize>) -> impl Fn(&SyncSnapshot) + Send + Sync + 'static {
        let counter = Arc::clone(counter);
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn every_subscriber_sees_each_publish() {
        let publisher = StatusPublisher::new(SyncSnapshot::default());
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let _sa = publisher.subscribe(counted(&a));
        let _sb = publisher.subscribe(counted(&b));

        publisher.publish(SyncSnapshot {
            queued_count: 3,
            ..Default::default()
        });

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.snapshot().queued_count, 3);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let publisher = StatusPublisher::new(SyncSnapshot::default());
        let after = Arc::new(AtomicUsize::new(0));
        let _bad = publisher.subscribe(|_| panic!("listener bug"));
        let _good = publisher.subscribe(counted(&after));

        publisher.publish(SyncSnapshot::default());
        publisher.publish(SyncSnapshot::default());

        assert_eq!(after.load(Ordering::SeqCst), 2);
        assert_eq!(publisher.listener_count(), 2);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let publisher = StatusPublisher::new(SyncSnapshot::default());
        let count = Arc::new(AtomicUsize::new(0));
        let sub = publisher.subscribe(counted(&count));

        publisher.publish(SyncSnapshot::default());
        sub.unsubscribe();
        publisher.publish(SyncSnapshot::default());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.listener_count(), 0);
    }

    #[test]
    fn watch_receives_latest() {
        let publisher = StatusPublisher::new(SyncSnapshot::default());
        let rx = publisher.watch();
        publisher.publish(SyncSnapshot {
            is_online: true,
            ..Default::default()
        });
        assert!(rx.borrow().is_online);
    }

    #[test]
    fn progress_percentage() {
        let progress = SyncProgress {
            total: 4,
            completed: 1,
            current: None,
        };
        assert_eq!(progress.percentage(), 25);
        assert_eq!(
            SyncProgress {
                total: 0,
                completed: 0,
                current: None
            }
            .percentage(),
            100
        );
    }

    #[test]
    fn sync_state_helpers() {
        assert!(SyncState::Syncing.is_active());
        assert!(!SyncState::Syncing.can_start_sync());
        assert!(SyncState::IdleWithConflicts.can_start_sync());
    }
}
