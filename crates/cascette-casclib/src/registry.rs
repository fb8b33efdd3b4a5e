//! Per-storage tracking of live files and finders.
//!
//! A storage owns one [`Registry`]. Every file it opens, and every finder
//! once it binds a native cursor, is recorded under its native handle with a
//! weak reference. The registry therefore never keeps a child alive: a child
//! the host drops runs its own close and unregisters itself. When the
//! storage closes, [`Registry::close`] force-closes whatever is still live
//! before the storage handle is released.

use crate::Result;
use crate::engine::{FileHandle, FindHandle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Weak;
use tracing::{debug, trace, warn};

/// Key of a registry entry: the child's native handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ChildHandle {
    File(FileHandle),
    Finder(FindHandle),
}

/// Close hook of an object tracked by a registry.
pub(crate) trait Tracked: Send + Sync {
    /// Release the native handle. Must tolerate the object being closed
    /// already.
    fn close_tracked(&self) -> Result<bool>;
}

/// Weak handle-to-object mapping owned by one storage.
#[derive(Default)]
pub(crate) struct Registry {
    entries: Mutex<HashMap<ChildHandle, Weak<dyn Tracked>>>,
}

impl Registry {
    /// Create the empty registry of a freshly opened storage.
    pub(crate) fn open() -> Self {
        Self::default()
    }

    /// Track `object` under `handle`. Inserting an existing handle again
    /// leaves the entry as it was.
    pub(crate) fn insert(&self, handle: ChildHandle, object: Weak<dyn Tracked>) {
        let mut entries = self.entries.lock();
        if entries.contains_key(&handle) {
            return;
        }
        trace!("Tracking {:?}", handle);
        entries.insert(handle, object);
    }

    /// Stop tracking `handle`. Removing an absent handle does nothing.
    pub(crate) fn remove(&self, handle: ChildHandle) {
        if self.entries.lock().remove(&handle).is_some() {
            trace!("Untracked {:?}", handle);
        }
    }

    /// Number of tracked children that are still alive.
    pub(crate) fn live_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|object| object.strong_count() > 0)
            .count()
    }

    /// Close every live child and discard the mapping.
    ///
    /// Children unregister themselves while closing, so the entries are
    /// snapshotted and the lock released before any close runs. Failures are
    /// logged and skipped.
    pub(crate) fn close(&self) {
        let snapshot: Vec<(ChildHandle, Weak<dyn Tracked>)> = self
            .entries
            .lock()
            .iter()
            .map(|(handle, object)| (*handle, Weak::clone(object)))
            .collect();

        debug!("Closing {} tracked children", snapshot.len());

        for (handle, object) in snapshot {
            let Some(object) = object.upgrade() else {
                trace!("{:?} already dropped", handle);
                continue;
            };

            if let Err(e) = object.close_tracked() {
                warn!("Failed to close {:?} during storage close: {}", handle, e);
            }
        }

        self.entries.lock().clear();
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::CascLibError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe {
        closes: AtomicUsize,
        fail: bool,
    }

    impl Probe {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                closes: AtomicUsize::new(0),
                fail,
            })
        }
    }

    impl Tracked for Probe {
        fn close_tracked(&self) -> Result<bool> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(CascLibError::InvalidHandle)
            } else {
                Ok(true)
            }
        }
    }

    fn weak(probe: &Arc<Probe>) -> Weak<dyn Tracked> {
        Arc::downgrade(probe) as Weak<dyn Tracked>
    }

    #[test]
    fn test_insert_and_remove_are_idempotent() {
        let registry = Registry::open();
        let probe = Probe::new(false);
        let handle = ChildHandle::File(FileHandle::from_raw(1));

        registry.insert(handle, weak(&probe));
        registry.insert(handle, weak(&probe));
        assert_eq!(registry.live_count(), 1);

        registry.remove(handle);
        registry.remove(handle);
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_file_and_finder_keys_are_distinct() {
        let registry = Registry::open();
        let file = Probe::new(false);
        let finder = Probe::new(false);

        registry.insert(ChildHandle::File(FileHandle::from_raw(7)), weak(&file));
        registry.insert(ChildHandle::Finder(FindHandle::from_raw(7)), weak(&finder));
        assert_eq!(registry.live_count(), 2);
    }

    #[test]
    fn test_close_reaches_every_child_despite_failures() {
        let registry = Registry::open();
        let probes: Vec<_> = (0..4).map(|i| Probe::new(i % 2 == 0)).collect();

        for (i, probe) in probes.iter().enumerate() {
            registry.insert(ChildHandle::File(FileHandle::from_raw(i as u64 + 1)), weak(probe));
        }

        registry.close();

        for probe in &probes {
            assert_eq!(probe.closes.load(Ordering::SeqCst), 1);
        }
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_weak_entries_do_not_keep_children_alive() {
        let registry = Registry::open();
        let probe = Probe::new(false);
        let object = weak(&probe);
        registry.insert(ChildHandle::Finder(FindHandle::from_raw(3)), object.clone());

        drop(probe);
        assert!(object.upgrade().is_none());
        assert_eq!(registry.live_count(), 0);

        // Closing skips the dropped entry.
        registry.close();
    }
}
