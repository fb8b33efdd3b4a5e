//! Handle-safe access to read-only CASC archive storages.
//!
//! This crate wraps a CascLib-style archive engine in three resource types
//! that a scripting host can hand out freely:
//!
//! - **[`Storage`]**: an open archive root. Owns the native storage handle
//!   and tracks every child it created.
//! - **[`File`]**: a stream over one archive entry with multi-format reads
//!   and line iteration.
//! - **[`Finder`]**: a lazy iterator over entry names with an optional
//!   filter.
//!
//! Children hold only a weak reference to their storage. Closing or dropping
//! a storage closes every child still open, and any later operation on them
//! fails with [`CascLibError::InvalidHandle`] instead of touching a released
//! native handle. Children can equally be closed or dropped first, in any
//! order.
//!
//! The archive engine itself sits behind the [`Engine`] trait. Two engines
//! ship with the crate: [`MemoryEngine`] for archives held in memory and
//! [`DirectoryEngine`] for directories of loose files.
//!
//! # Example
//!
//! ```rust
//! use cascette_casclib::{CascLib, Format, MemoryArchive, MemoryEngine, OpenMode, StorageKind};
//! use std::sync::Arc;
//!
//! # fn main() -> cascette_casclib::Result<()> {
//! let engine = MemoryEngine::new().with_archive(
//!     "World of Warcraft",
//!     MemoryArchive::new().with_entry("readme.txt", "first\nsecond\n"),
//! );
//! let casclib = CascLib::new(Arc::new(engine));
//!
//! let storage = casclib.open("World of Warcraft", StorageKind::Local)?;
//! let names: Vec<String> = storage.files(Some(r"\.txt$"), false)?.collect::<Result<_, _>>()?;
//! assert_eq!(names, ["readme.txt"]);
//!
//! let file = storage.open_file("readme.txt", OpenMode::Read)?;
//! let line = file.read(&[Format::Line])?;
//! assert_eq!(line[0].as_deref(), Some(&b"first"[..]));
//!
//! // Closing the storage closes the file too.
//! storage.close()?;
//! assert!(!file.is_open());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

// Configuration
pub mod config;

// Archive engine interface and bundled engines
pub mod engine;

// Error types
pub mod error;

// Entry streams
pub mod file;

// Name enumeration
pub mod finder;

// Child tracking for cascading close
mod registry;

// Storage root
pub mod storage;

use std::sync::Arc;

pub use config::CascLibConfig;
pub use engine::{
    DirectoryEngine, Engine, EngineOp, FileHandle, FindData, FindHandle, MemoryArchive,
    MemoryEngine, StorageHandle, StorageKind, Whence,
};
pub use error::{CascLibError, EngineError, ErrorResult, Result};
pub use file::{BufferMode, File, Format, Lines, ReadResults};
pub use finder::{Finder, NameFilter};
pub use storage::{OpenMode, Storage};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Module object handed to a host: an engine plus the configuration every
/// storage it opens shares.
#[derive(Clone)]
pub struct CascLib {
    engine: Arc<dyn Engine>,
    config: Arc<CascLibConfig>,
}

impl CascLib {
    /// Create a module object with the default configuration.
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            config: Arc::new(CascLibConfig::default()),
        }
    }

    /// Create a module object with a custom configuration.
    pub fn with_config(engine: Arc<dyn Engine>, config: CascLibConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            engine,
            config: Arc::new(config),
        })
    }

    /// Open the storage at `path`.
    pub fn open(&self, path: &str, kind: StorageKind) -> Result<Storage> {
        Storage::open_shared(Arc::clone(&self.engine), Arc::clone(&self.config), path, kind)
    }

    /// Engine storages are opened with.
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Configuration shared by every storage opened here.
    pub fn config(&self) -> &CascLibConfig {
        &self.config
    }
}

impl std::fmt::Debug for CascLib {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CascLib")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Open the storage at `path` with the default configuration.
pub fn open(engine: Arc<dyn Engine>, path: &str, kind: StorageKind) -> Result<Storage> {
    Storage::open(engine, path, kind)
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_rejected() {
        let err = CascLib::with_config(
            Arc::new(MemoryEngine::new()),
            CascLibConfig::new().with_find_mask(""),
        )
        .expect_err("empty mask");
        assert!(matches!(err, CascLibError::Config(_)));
    }

    #[test]
    fn test_storages_share_config() {
        let engine = MemoryEngine::new().with_archive("data", MemoryArchive::new());
        let casclib = CascLib::with_config(
            Arc::new(engine),
            CascLibConfig::new().with_read_buffer_size(16),
        )
        .expect("valid config");

        let storage = casclib.open("data", StorageKind::Local).expect("open");
        assert_eq!(storage.config().read_buffer_size, 16);
    }

    #[test]
    fn test_free_open_reports_engine_error() {
        let err = open(Arc::new(MemoryEngine::new()), "missing", StorageKind::Online)
            .expect_err("missing archive");
        let result = err.to_error_result().expect("engine error result");
        assert_eq!(result.code, error::codes::ERROR_FILE_NOT_FOUND);
    }
}
