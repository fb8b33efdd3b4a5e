//! Storage root: owns the native storage handle and its child registry

use crate::config::CascLibConfig;
use crate::engine::{Engine, StorageHandle, StorageKind};
use crate::file::File;
use crate::finder::{Finder, NameFilter};
use crate::registry::Registry;
use crate::{CascLibError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Display name of storages.
pub const STORAGE_TYPE_NAME: &str = "Casc Storage";

/// Mode a file is opened with.
///
/// Storages are read-only; the binary flag is accepted and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// `"r"`
    #[default]
    Read,
    /// `"rb"`
    ReadBinary,
}

impl FromStr for OpenMode {
    type Err = CascLibError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" => Ok(Self::Read),
            "rb" => Ok(Self::ReadBinary),
            other => Err(CascLibError::argument(
                "open",
                format!("invalid option '{other}'"),
            )),
        }
    }
}

/// Shared state of an open storage.
///
/// Files and finders hold a `Weak` to this; only the [`Storage`] value owns
/// it, so dropping the storage finalizes it even while children live.
pub(crate) struct StorageInner {
    engine: Arc<dyn Engine>,
    config: Arc<CascLibConfig>,
    handle: Mutex<Option<StorageHandle>>,
    registry: Registry,
}

impl StorageInner {
    /// Native handle, or `InvalidHandle` once closed.
    pub(crate) fn handle(&self) -> Result<StorageHandle> {
        (*self.handle.lock()).ok_or(CascLibError::InvalidHandle)
    }

    pub(crate) fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub(crate) fn config(&self) -> &Arc<CascLibConfig> {
        &self.config
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    fn close(&self) -> Result<bool> {
        let handle = self
            .handle
            .lock()
            .take()
            .ok_or(CascLibError::InvalidHandle)?;

        // Children see the storage as closed from here on; release them
        // before the storage handle itself.
        self.registry.close();
        self.engine.close_storage(handle)?;

        debug!("Closed storage {}", handle);
        Ok(true)
    }
}

impl Drop for StorageInner {
    fn drop(&mut self) {
        if self.handle.get_mut().is_none() {
            return;
        }
        if let Err(e) = self.close() {
            warn!("Failed to close dropped storage: {}", e);
        }
    }
}

/// An open archive storage.
///
/// Closing or dropping the storage closes every file and bound finder it
/// created that is still open; their later operations fail with
/// [`CascLibError::InvalidHandle`].
pub struct Storage {
    inner: Arc<StorageInner>,
}

impl Storage {
    /// Open the storage at `path` with the default configuration.
    pub fn open(engine: Arc<dyn Engine>, path: &str, kind: StorageKind) -> Result<Self> {
        Self::open_with_config(engine, path, kind, CascLibConfig::default())
    }

    /// Open the storage at `path`.
    pub fn open_with_config(
        engine: Arc<dyn Engine>,
        path: &str,
        kind: StorageKind,
        config: CascLibConfig,
    ) -> Result<Self> {
        config.validate()?;
        Self::open_shared(engine, Arc::new(config), path, kind)
    }

    pub(crate) fn open_shared(
        engine: Arc<dyn Engine>,
        config: Arc<CascLibConfig>,
        path: &str,
        kind: StorageKind,
    ) -> Result<Self> {
        let handle = engine.open_storage(path, kind)?;
        debug!("Opened {} storage {} at {}", kind.as_str(), handle, path);

        Ok(Self {
            inner: Arc::new(StorageInner {
                engine,
                config,
                handle: Mutex::new(Some(handle)),
                registry: Registry::open(),
            }),
        })
    }

    /// Enumerate entry names, optionally filtered.
    ///
    /// `pattern` is a regular expression searched for anywhere in the name.
    /// With `plain`, it is instead a literal substring. No native cursor is
    /// opened until the finder is first advanced.
    pub fn files(&self, pattern: Option<&str>, plain: bool) -> Result<Finder> {
        self.inner.handle()?;
        let filter = NameFilter::new(pattern, plain)?;
        Ok(Finder::new(&self.inner, filter))
    }

    /// Open the entry called `name`.
    pub fn open_file(&self, name: &str, _mode: OpenMode) -> Result<File> {
        File::open(&self.inner, name)
    }

    /// Close the storage and every child still open.
    ///
    /// Fails with `InvalidHandle` if the storage is already closed.
    pub fn close(&self) -> Result<bool> {
        self.inner.close()
    }

    /// Whether the storage is still open.
    pub fn is_open(&self) -> bool {
        self.inner.handle.lock().is_some()
    }

    /// Number of live files and bound finders tracked for cascading close.
    pub fn tracked_children(&self) -> usize {
        self.inner.registry.live_count()
    }

    /// Configuration shared with this storage's children.
    pub fn config(&self) -> &CascLibConfig {
        &self.inner.config
    }
}

impl fmt::Display for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{STORAGE_TYPE_NAME} ({:p})", Arc::as_ptr(&self.inner))?;
        if !self.is_open() {
            f.write_str(" (Closed)")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("handle", &*self.inner.handle.lock())
            .field("tracked", &self.tracked_children())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::{MemoryArchive, MemoryEngine};

    fn engine() -> Arc<MemoryEngine> {
        Arc::new(MemoryEngine::new().with_archive(
            "data",
            MemoryArchive::new().with_entry("a.txt", "alpha"),
        ))
    }

    #[test]
    fn test_open_mode_parsing() {
        assert_eq!("r".parse::<OpenMode>().ok(), Some(OpenMode::Read));
        assert_eq!("rb".parse::<OpenMode>().ok(), Some(OpenMode::ReadBinary));
        let err = "w".parse::<OpenMode>().expect_err("write mode rejected");
        assert!(err.is_argument_error());
    }

    #[test]
    fn test_close_twice() {
        let storage = Storage::open(engine(), "data", StorageKind::Local).expect("open");
        assert!(storage.close().expect("first close"));
        assert!(storage.close().expect_err("second close").is_invalid_handle());
    }

    #[test]
    fn test_operations_after_close() {
        let storage = Storage::open(engine(), "data", StorageKind::Local).expect("open");
        storage.close().expect("close");

        assert!(
            storage
                .open_file("a.txt", OpenMode::Read)
                .expect_err("closed storage")
                .is_invalid_handle()
        );
        assert!(
            storage
                .files(None, false)
                .expect_err("closed storage")
                .is_invalid_handle()
        );
    }

    #[test]
    fn test_display_reports_state() {
        let storage = Storage::open(engine(), "data", StorageKind::Local).expect("open");
        let open = storage.to_string();
        assert!(open.starts_with("Casc Storage (0x"));
        assert!(!open.ends_with("(Closed)"));

        storage.close().expect("close");
        assert!(storage.to_string().ends_with(" (Closed)"));
    }

    #[test]
    fn test_drop_releases_native_handle() {
        let engine = engine();
        let storage = Storage::open(engine.clone(), "data", StorageKind::Local).expect("open");
        assert_eq!(engine.open_handles(), 1);
        drop(storage);
        assert_eq!(engine.open_handles(), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = Storage::open_with_config(
            engine(),
            "data",
            StorageKind::Local,
            CascLibConfig::new().with_read_buffer_size(0),
        )
        .expect_err("zero buffer");
        assert!(matches!(err, CascLibError::Config(_)));
    }
}
