// ============================================================================
// Resource Tracker
// ============================================================================
//
// Ordered set of open child resources owned by a parent (session or
// transaction). Closing the parent closes every child in insertion order,
// collecting every failure instead of stopping at the first one.
//
// ============================================================================

use crate::core::{Result, TxError};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::{Level, event};

pub type ResourceId = u64;

/// Anything holding server-side state that must be released.
pub trait ServerResource: Send + Sync {
    fn close(&self) -> Result<()>;

    fn describe(&self) -> String {
        "resource".to_string()
    }
}

struct Members {
    next_id: ResourceId,
    open: BTreeMap<ResourceId, Arc<dyn ServerResource>>,
    closed: bool,
}

pub struct ResourceTracker {
    owner: String,
    members: Mutex<Members>,
}

impl ResourceTracker {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            members: Mutex::new(Members {
                next_id: 1,
                open: BTreeMap::new(),
                closed: false,
            }),
        }
    }

    /// Track a child.
    ///
    /// # Errors
    /// `AlreadyClosed` once the tracker has finished closing its children.
    pub fn add(&self, resource: Arc<dyn ServerResource>) -> Result<ResourceId> {
        let mut members = self.members.lock()?;
        if members.closed {
            return Err(TxError::already_closed(&self.owner));
        }
        let id = members.next_id;
        members.next_id += 1;
        members.open.insert(id, resource);
        Ok(id)
    }

    /// Track a child and hand back the non-owning reference it uses to
    /// deregister itself.
    pub fn register(self: &Arc<Self>, resource: Arc<dyn ServerResource>) -> Result<TrackedBy> {
        let id = self.add(resource)?;
        Ok(TrackedBy {
            owner: Arc::downgrade(self),
            id,
        })
    }

    /// Stop tracking a child. Removing an unknown id is a no-op.
    pub fn remove(&self, id: ResourceId) -> bool {
        match self.members.lock() {
            Ok(mut members) => members.open.remove(&id).is_some(),
            Err(poisoned) => poisoned.into_inner().open.remove(&id).is_some(),
        }
    }

    pub fn len(&self) -> usize {
        self.members.lock().map(|m| m.open.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.members.lock().map(|m| m.closed).unwrap_or(true)
    }

    /// Close every child, oldest first, and stop accepting new ones.
    ///
    /// Children added while another child is closing are closed in the same
    /// pass. Returns every close failure in the order they occurred.
    pub fn close_all(&self) -> Vec<TxError> {
        let mut errors = Vec::new();
        loop {
            let next = {
                let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
                match members.open.pop_first() {
                    Some(entry) => entry,
                    None => {
                        members.closed = true;
                        break;
                    }
                }
            };
            let (id, resource) = next;
            if let Err(error) = resource.close() {
                event!(
                    Level::DEBUG,
                    owner = %self.owner,
                    resource = %resource.describe(),
                    id,
                    error = %error,
                    "child close failed"
                );
                errors.push(error);
            }
        }
        errors
    }

    /// Close every child, then run the owner's own close.
    ///
    /// If `own_close` fails, its error is raised with the child failures
    /// suppressed on it; otherwise child failures are raised as one
    /// aggregated error.
    pub fn close_all_with<F>(&self, own_close: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let errors = self.close_all();
        match own_close() {
            Err(mut own) => {
                for error in errors {
                    own.add_suppressed(error);
                }
                Err(own)
            }
            Ok(()) => match TxError::aggregate(errors) {
                Some(aggregated) => Err(aggregated),
                None => Ok(()),
            },
        }
    }
}

/// Non-owning back-reference from a child to the tracker that owns it.
#[derive(Clone)]
pub struct TrackedBy {
    owner: Weak<ResourceTracker>,
    id: ResourceId,
}

impl TrackedBy {
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Deregister from the owner, if it is still alive.
    pub fn release(&self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeChild {
        name: String,
        fail: bool,
        closes: Arc<AtomicUsize>,
        order: Arc<Mutex<Vec<String>>>,
    }

    impl ServerResource for FakeChild {
        fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(self.name.clone());
            if self.fail {
                Err(TxError::internal(format!("{} failed", self.name)))
            } else {
                Ok(())
            }
        }
    }

    fn fake_children(
        tracker: &ResourceTracker,
        count: usize,
        failing: usize,
    ) -> (Arc<AtomicUsize>, Arc<Mutex<Vec<String>>>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..count {
            tracker
                .add(Arc::new(FakeChild {
                    name: format!("r{}", i),
                    fail: i < failing,
                    closes: Arc::clone(&closes),
                    order: Arc::clone(&order),
                }))
                .unwrap();
        }
        (closes, order)
    }

    #[test]
    fn test_close_all_reports_every_failure() {
        for failing in 0..=4 {
            let tracker = ResourceTracker::new("tx");
            let (closes, _) = fake_children(&tracker, 4, failing);

            let errors = tracker.close_all();
            assert_eq!(closes.load(Ordering::SeqCst), 4);
            assert_eq!(errors.len(), failing);
            assert!(tracker.is_empty());
            assert!(tracker.is_closed());
        }
    }

    #[test]
    fn test_close_in_insertion_order() {
        let tracker = ResourceTracker::new("tx");
        let (_, order) = fake_children(&tracker, 3, 0);
        tracker.close_all();
        assert_eq!(*order.lock().unwrap(), vec!["r0", "r1", "r2"]);
    }

    struct Spawner {
        tracker: Weak<ResourceTracker>,
        spawned: Arc<AtomicUsize>,
    }

    impl ServerResource for Spawner {
        fn close(&self) -> Result<()> {
            let tracker = self.tracker.upgrade().unwrap();
            tracker.add(Arc::new(FakeChild {
                name: "late".into(),
                fail: false,
                closes: Arc::clone(&self.spawned),
                order: Arc::new(Mutex::new(Vec::new())),
            }))?;
            Ok(())
        }
    }

    #[test]
    fn test_children_added_during_close_are_closed() {
        let tracker = Arc::new(ResourceTracker::new("tx"));
        let spawned = Arc::new(AtomicUsize::new(0));
        tracker
            .add(Arc::new(Spawner {
                tracker: Arc::downgrade(&tracker),
                spawned: Arc::clone(&spawned),
            }))
            .unwrap();

        assert!(tracker.close_all().is_empty());
        assert_eq!(spawned.load(Ordering::SeqCst), 1);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_own_close_failure_is_primary() {
        let tracker = ResourceTracker::new("tx");
        fake_children(&tracker, 2, 2);

        let err = tracker
            .close_all_with(|| Err(TxError::internal("own close")))
            .unwrap_err();
        assert_eq!(err.message(), "own close");
        assert_eq!(err.suppressed().len(), 2);
    }

    #[test]
    fn test_child_failures_aggregated_when_own_close_succeeds() {
        let tracker = ResourceTracker::new("tx");
        fake_children(&tracker, 3, 2);

        let err = tracker.close_all_with(|| Ok(())).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::AggregatedClose);
        assert_eq!(err.cause().unwrap().message(), "r0 failed");
        assert_eq!(err.suppressed().len(), 1);

        let clean = ResourceTracker::new("tx");
        fake_children(&clean, 2, 0);
        assert!(clean.close_all_with(|| Ok(())).is_ok());
    }

    #[test]
    fn test_remove_is_idempotent_and_add_after_close_fails() {
        let tracker = Arc::new(ResourceTracker::new("session"));
        let (closes, _) = fake_children(&tracker, 0, 0);
        let tracked = tracker
            .register(Arc::new(FakeChild {
                name: "x".into(),
                fail: false,
                closes: Arc::clone(&closes),
                order: Arc::new(Mutex::new(Vec::new())),
            }))
            .unwrap();

        tracked.release();
        tracked.release();
        assert!(!tracker.remove(tracked.id()));
        assert!(tracker.is_empty());

        tracker.close_all();
        let err = tracker
            .add(Arc::new(FakeChild {
                name: "y".into(),
                fail: false,
                closes,
                order: Arc::new(Mutex::new(Vec::new())),
            }))
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::AlreadyClosed);
    }
}
