//! Lazy enumeration of entry names.
//!
//! A [`Finder`] starts unbound: no native cursor exists until the first
//! step. The first step opens the cursor with the configured mask and
//! registers the finder with its storage; later steps advance it. Names the
//! filter rejects are skipped. The finder closes itself at the end of the
//! sequence or on the first engine error, and stays closed.

use crate::engine::{Engine, FindData, FindHandle};
use crate::registry::{ChildHandle, Tracked};
use crate::storage::StorageInner;
use crate::{CascLibError, Result};
use parking_lot::Mutex;
use regex::Regex;
use std::fmt;
use std::iter::FusedIterator;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Display name of finders.
pub const FINDER_TYPE_NAME: &str = "Casc Finder";

/// Host-side filter applied to every enumerated name.
#[derive(Debug, Clone)]
pub enum NameFilter {
    /// Accept everything.
    All,
    /// Accept names containing this literal text.
    Plain(String),
    /// Accept names the expression matches anywhere.
    Pattern(Regex),
}

impl NameFilter {
    /// Build a filter from an optional pattern. With `plain`, the pattern is
    /// literal text; otherwise it must be a valid regular expression.
    pub fn new(pattern: Option<&str>, plain: bool) -> Result<Self> {
        match pattern {
            None => Ok(Self::All),
            Some(text) if plain => Ok(Self::Plain(text.to_string())),
            Some(text) => Regex::new(text)
                .map(Self::Pattern)
                .map_err(|e| CascLibError::argument("files", format!("malformed pattern ({e})"))),
        }
    }

    /// Whether `name` passes the filter.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Plain(text) => name.contains(text.as_str()),
            Self::Pattern(regex) => regex.is_match(name),
        }
    }
}

enum FinderState {
    Unbound(Weak<StorageInner>),
    Bound {
        handle: FindHandle,
        storage: Weak<StorageInner>,
    },
    Closed,
}

enum Step {
    First(Weak<StorageInner>),
    Next(FindHandle),
}

pub(crate) struct FinderInner {
    engine: Arc<dyn Engine>,
    mask: String,
    filter: NameFilter,
    state: Mutex<FinderState>,
}

impl FinderInner {
    fn advance(self: &Arc<Self>) -> Result<Option<FindData>> {
        let step = match &*self.state.lock() {
            FinderState::Unbound(storage) => Step::First(Weak::clone(storage)),
            FinderState::Bound { handle, .. } => Step::Next(*handle),
            FinderState::Closed => return Ok(None),
        };

        match step {
            Step::Next(handle) => Ok(self.engine.find_next(handle)?),
            Step::First(weak) => {
                let storage = weak.upgrade().ok_or(CascLibError::InvalidHandle)?;
                let storage_handle = storage.handle()?;

                let Some((handle, data)) = self.engine.find_first(storage_handle, &self.mask)?
                else {
                    return Ok(None);
                };

                debug!("Opened find cursor {} on storage {}", handle, storage_handle);
                *self.state.lock() = FinderState::Bound {
                    handle,
                    storage: weak,
                };
                storage.registry().insert(
                    ChildHandle::Finder(handle),
                    Arc::downgrade(self) as Weak<dyn Tracked>,
                );

                Ok(Some(data))
            }
        }
    }

    /// Next accepted name, or `None` once the sequence ends.
    fn step(self: &Arc<Self>) -> Result<Option<String>> {
        loop {
            match self.advance() {
                Ok(Some(data)) if self.filter.matches(&data.name) => return Ok(Some(data.name)),
                Ok(Some(data)) => trace!("Filtered out {}", data.name),
                Ok(None) => {
                    self.finish();
                    return Ok(None);
                }
                Err(e) => {
                    self.finish();
                    return Err(e);
                }
            }
        }
    }

    fn finish(&self) {
        let bound = matches!(*self.state.lock(), FinderState::Bound { .. });
        if !bound {
            *self.state.lock() = FinderState::Closed;
            return;
        }
        if let Err(e) = self.close() {
            warn!("Failed to release find cursor: {}", e);
        }
    }

    fn is_open(&self) -> bool {
        !matches!(*self.state.lock(), FinderState::Closed)
    }

    fn close(&self) -> Result<bool> {
        let previous = std::mem::replace(&mut *self.state.lock(), FinderState::Closed);

        let FinderState::Bound { handle, storage } = previous else {
            return Err(CascLibError::InvalidHandle);
        };

        if let Some(storage) = storage.upgrade() {
            storage.registry().remove(ChildHandle::Finder(handle));
        }
        self.engine.find_close(handle)?;

        debug!("Closed find cursor {}", handle);
        Ok(true)
    }
}

impl Tracked for FinderInner {
    fn close_tracked(&self) -> Result<bool> {
        self.close()
    }
}

impl Drop for FinderInner {
    fn drop(&mut self) {
        if !matches!(self.state.get_mut(), FinderState::Bound { .. }) {
            return;
        }
        if let Err(e) = self.close() {
            warn!("Failed to close dropped finder: {}", e);
        }
    }
}

/// Iterator over the entry names of a storage.
///
/// Yields `Err` once if the engine fails, then ends. Closing the owning
/// storage closes a bound finder; an unbound one fails with
/// [`CascLibError::InvalidHandle`] on its first step.
pub struct Finder {
    inner: Arc<FinderInner>,
}

impl Finder {
    pub(crate) fn new(storage: &Arc<StorageInner>, filter: NameFilter) -> Self {
        Self {
            inner: Arc::new(FinderInner {
                engine: Arc::clone(storage.engine()),
                mask: storage.config().find_mask.clone(),
                filter,
                state: Mutex::new(FinderState::Unbound(Arc::downgrade(storage))),
            }),
        }
    }

    /// Release the native cursor.
    ///
    /// Fails with `InvalidHandle` unless a cursor is bound; the finder is
    /// closed afterwards either way.
    pub fn close(&self) -> Result<bool> {
        self.inner.close()
    }

    /// Whether the finder can still yield names.
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Whether a native cursor is currently held.
    pub fn is_bound(&self) -> bool {
        matches!(*self.inner.state.lock(), FinderState::Bound { .. })
    }
}

impl Iterator for Finder {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.step().transpose()
    }
}

impl FusedIterator for Finder {}

impl fmt::Display for Finder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{FINDER_TYPE_NAME} ({:p})", Arc::as_ptr(&self.inner))?;
        if !self.is_open() {
            f.write_str(" (Closed)")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Finder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.state.lock() {
            FinderState::Unbound(_) => "unbound".to_string(),
            FinderState::Bound { handle, .. } => format!("bound {handle}"),
            FinderState::Closed => "closed".to_string(),
        };
        f.debug_struct("Finder")
            .field("mask", &self.inner.mask)
            .field("filter", &self.inner.filter)
            .field("state", &state)
            .finish()
    }
}
