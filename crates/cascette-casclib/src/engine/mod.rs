//! Archive engine interface.
//!
//! The engine is the component that actually understands an archive: it
//! opens storages, resolves entry names, decodes content and enumerates
//! names. Storages, files and finders only ever talk to it through the
//! [`Engine`] trait, handing back the opaque handles it issued.
//!
//! Every call is blocking and fallible. A read that returns `Ok(0)` means end
//! of stream; enumeration reports the end of the sequence as `Ok(None)`.
//!
//! Two engines ship with the crate:
//! - [`MemoryEngine`]: archives held in memory, with fault injection
//! - [`DirectoryEngine`]: a directory of loose files as a local storage

use crate::error::{CascLibError, EngineError, EngineResult};
use regex::{Regex, RegexBuilder};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

pub mod directory;
pub mod memory;

pub use directory::DirectoryEngine;
pub use memory::{EngineOp, MemoryArchive, MemoryEngine};

macro_rules! native_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw engine handle value.
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// Raw engine handle value.
            pub const fn as_raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    };
}

native_handle!(
    /// Engine handle for an open storage.
    StorageHandle
);
native_handle!(
    /// Engine handle for an open archive entry.
    FileHandle
);
native_handle!(
    /// Engine handle for an enumeration cursor.
    FindHandle
);

/// Which kind of storage to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageKind {
    /// Installed game data on local disk.
    #[default]
    Local,
    /// Storage streamed from a CDN.
    Online,
}

impl StorageKind {
    /// Host-facing name of the kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Online => "online",
        }
    }
}

impl FromStr for StorageKind {
    type Err = CascLibError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "online" => Ok(Self::Online),
            other => Err(CascLibError::argument(
                "open",
                format!("invalid option '{other}'"),
            )),
        }
    }
}

/// Base for a file pointer move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Whence {
    /// From the beginning of the entry.
    Set,
    /// From the current position.
    #[default]
    Cur,
    /// From the end of the entry.
    End,
}

impl FromStr for Whence {
    type Err = CascLibError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "set" => Ok(Self::Set),
            "cur" => Ok(Self::Cur),
            "end" => Ok(Self::End),
            other => Err(CascLibError::argument(
                "seek",
                format!("invalid option '{other}'"),
            )),
        }
    }
}

/// One enumerated entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindData {
    /// Full entry name.
    pub name: String,
    /// Decoded size of the entry.
    pub file_size: u64,
}

/// Blocking archive engine primitives.
pub trait Engine: Send + Sync {
    /// Open the storage at `path`.
    fn open_storage(&self, path: &str, kind: StorageKind) -> EngineResult<StorageHandle>;

    /// Release a storage handle.
    fn close_storage(&self, storage: StorageHandle) -> EngineResult<()>;

    /// Open the entry called `name` inside `storage`.
    fn open_file(&self, storage: StorageHandle, name: &str) -> EngineResult<FileHandle>;

    /// Release a file handle.
    fn close_file(&self, file: FileHandle) -> EngineResult<()>;

    /// Read up to `buf.len()` bytes at the file pointer; `Ok(0)` is end of stream.
    fn read_file(&self, file: FileHandle, buf: &mut [u8]) -> EngineResult<usize>;

    /// Move the file pointer and return the new absolute position.
    fn set_file_pointer(&self, file: FileHandle, offset: i64, whence: Whence)
    -> EngineResult<u64>;

    /// Size of the entry behind `file`.
    fn file_size(&self, file: FileHandle) -> EngineResult<u64>;

    /// Open an enumeration cursor and return the first entry matching `mask`.
    ///
    /// `Ok(None)` means the storage has no matching entry; no cursor is left
    /// open in that case.
    fn find_first(
        &self,
        storage: StorageHandle,
        mask: &str,
    ) -> EngineResult<Option<(FindHandle, FindData)>>;

    /// Advance an enumeration cursor; `Ok(None)` is the end of the sequence.
    fn find_next(&self, find: FindHandle) -> EngineResult<Option<FindData>>;

    /// Release an enumeration cursor.
    fn find_close(&self, find: FindHandle) -> EngineResult<()>;
}

/// Monotonic source of non-zero handle values.
#[derive(Debug)]
pub struct HandleAllocator {
    next: AtomicU64,
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleAllocator {
    /// Create an allocator starting at 1.
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Next unused raw handle value.
    pub fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Apply a seek request to a current position and entry size.
///
/// Positions before the start are rejected; positions past the end are kept
/// and read as end of stream.
pub fn resolve_position(current: u64, size: u64, offset: i64, whence: Whence) -> EngineResult<u64> {
    let base = match whence {
        Whence::Set => 0,
        Whence::Cur => current,
        Whence::End => size,
    };

    let target = i128::from(base) + i128::from(offset);
    u64::try_from(target).map_err(|_| EngineError::invalid_parameter())
}

/// Compile an engine wildcard mask.
///
/// `*` matches any run of characters (separators included) and `?` any
/// single character. Matching is case-insensitive and covers the whole name.
pub fn mask_to_regex(mask: &str) -> EngineResult<Regex> {
    let mut pattern = String::with_capacity(mask.len() + 2);
    pattern.push('^');

    for ch in mask.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            ch => {
                let mut buf = [0u8; 4];
                pattern.push_str(&regex::escape(ch.encode_utf8(&mut buf)));
            }
        }
    }

    pattern.push('$');

    RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .build()
        .map_err(|_| EngineError::invalid_parameter())
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_position() {
        assert_eq!(resolve_position(5, 10, 0, Whence::Cur), Ok(5));
        assert_eq!(resolve_position(5, 10, 2, Whence::Set), Ok(2));
        assert_eq!(resolve_position(5, 10, -3, Whence::End), Ok(7));
        assert_eq!(resolve_position(5, 10, 20, Whence::Cur), Ok(25));
        assert_eq!(
            resolve_position(5, 10, -6, Whence::Cur),
            Err(EngineError::invalid_parameter())
        );
    }

    #[test]
    fn test_mask_to_regex() {
        let all = mask_to_regex("*").expect("valid mask");
        assert!(all.is_match("world/maps/azeroth.wdt"));
        assert!(all.is_match(""));

        let txt = mask_to_regex("*.TXT").expect("valid mask");
        assert!(txt.is_match("readme.txt"));
        assert!(txt.is_match("docs/readme.txt"));
        assert!(!txt.is_match("readme.txt.bak"));

        let single = mask_to_regex("a?c").expect("valid mask");
        assert!(single.is_match("abc"));
        assert!(!single.is_match("abbc"));

        let literal = mask_to_regex("a+b(1).dat").expect("valid mask");
        assert!(literal.is_match("a+b(1).dat"));
        assert!(!literal.is_match("aab1.dat"));
    }

    #[test]
    fn test_option_parsing() {
        assert_eq!("local".parse::<StorageKind>().ok(), Some(StorageKind::Local));
        assert_eq!("online".parse::<StorageKind>().ok(), Some(StorageKind::Online));
        assert!("remote".parse::<StorageKind>().is_err());

        assert_eq!("set".parse::<Whence>().ok(), Some(Whence::Set));
        assert_eq!("end".parse::<Whence>().ok(), Some(Whence::End));
        let err = "start".parse::<Whence>().expect_err("unknown whence");
        assert!(err.is_argument_error());
        assert_eq!(Whence::default(), Whence::Cur);
    }

    #[test]
    fn test_handle_allocator() {
        let allocator = HandleAllocator::new();
        let first = allocator.allocate();
        let second = allocator.allocate();
        assert_eq!(first, 1);
        assert!(second > first);
        assert_eq!(FileHandle::from_raw(255).to_string(), "0xff");
    }
}
