//! In-memory archive engine.
//!
//! Archives are registered under a path and hold an ordered list of named
//! entries; enumeration follows registration order. The engine can be told
//! to fail the next call of a given operation, and to cap how many bytes a
//! single read returns, which lets callers exercise error and partial-read
//! paths without a real archive.

use super::{
    Engine, FileHandle, FindData, FindHandle, HandleAllocator, StorageHandle, StorageKind, Whence,
    mask_to_regex, resolve_position,
};
use crate::error::{EngineError, EngineResult};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Ordered set of named entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryArchive {
    entries: Vec<(String, Bytes)>,
}

impl MemoryArchive {
    /// Create an empty archive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. Duplicate names are all enumerated; lookups return the
    /// first.
    #[must_use]
    pub fn with_entry(mut self, name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.entries.push((name.into(), data.into()));
        self
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the archive has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry names in enumeration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    fn lookup(&self, name: &str) -> Option<&Bytes> {
        self.entries
            .iter()
            .find(|(candidate, _)| names_equal(candidate, name))
            .map(|(_, data)| data)
    }

    fn find_from(&self, start: usize, mask: &Regex) -> Option<(usize, FindData)> {
        self.entries
            .iter()
            .enumerate()
            .skip(start)
            .find(|(_, (name, _))| mask.is_match(name))
            .map(|(index, (name, data))| {
                (
                    index,
                    FindData {
                        name: name.clone(),
                        file_size: data.len() as u64,
                    },
                )
            })
    }
}

/// Entry names compare case-insensitively with either path separator.
fn names_equal(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.bytes().zip(b.bytes()).all(|(x, y)| {
            let x = if x == b'\\' { b'/' } else { x };
            let y = if y == b'\\' { b'/' } else { y };
            x.eq_ignore_ascii_case(&y)
        })
}

/// Engine operation, used to target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    /// [`Engine::open_storage`]
    OpenStorage,
    /// [`Engine::close_storage`]
    CloseStorage,
    /// [`Engine::open_file`]
    OpenFile,
    /// [`Engine::close_file`]
    CloseFile,
    /// [`Engine::read_file`]
    ReadFile,
    /// [`Engine::set_file_pointer`]
    SetFilePointer,
    /// [`Engine::file_size`]
    FileSize,
    /// [`Engine::find_first`]
    FindFirst,
    /// [`Engine::find_next`]
    FindNext,
    /// [`Engine::find_close`]
    FindClose,
}

struct OpenEntry {
    data: Bytes,
    position: u64,
}

struct Fault {
    skip: usize,
    error: EngineError,
}

struct Cursor {
    archive: Arc<MemoryArchive>,
    mask: Regex,
    next: usize,
}

/// Engine serving archives held in memory.
pub struct MemoryEngine {
    archives: DashMap<String, Arc<MemoryArchive>>,
    storages: DashMap<u64, Arc<MemoryArchive>>,
    files: DashMap<u64, OpenEntry>,
    finds: DashMap<u64, Cursor>,
    faults: Mutex<HashMap<EngineOp, Fault>>,
    read_limit: Option<usize>,
    handles: HandleAllocator,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Create an engine with no archives.
    pub fn new() -> Self {
        Self {
            archives: DashMap::new(),
            storages: DashMap::new(),
            files: DashMap::new(),
            finds: DashMap::new(),
            faults: Mutex::new(HashMap::new()),
            read_limit: None,
            handles: HandleAllocator::new(),
        }
    }

    /// Register `archive` under `path`.
    #[must_use]
    pub fn with_archive(self, path: impl Into<String>, archive: MemoryArchive) -> Self {
        self.archives.insert(path.into(), Arc::new(archive));
        self
    }

    /// Return at most `limit` bytes from any single read call.
    #[must_use]
    pub const fn with_read_limit(mut self, limit: usize) -> Self {
        self.read_limit = Some(limit);
        self
    }

    /// Make the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: EngineOp, error: EngineError) {
        self.fail_after(op, 0, error);
    }

    /// Let `skip` calls of `op` succeed, then fail the one after with
    /// `error`. Replaces any fault already armed for `op`.
    pub fn fail_after(&self, op: EngineOp, skip: usize, error: EngineError) {
        self.faults.lock().insert(op, Fault { skip, error });
    }

    /// Number of storage, file and cursor handles still open.
    pub fn open_handles(&self) -> usize {
        self.storages.len() + self.files.len() + self.finds.len()
    }

    /// Number of file handles still open.
    pub fn open_files(&self) -> usize {
        self.files.len()
    }

    /// Number of enumeration cursors still open.
    pub fn open_finds(&self) -> usize {
        self.finds.len()
    }

    fn check_fault(&self, op: EngineOp) -> EngineResult<()> {
        let mut faults = self.faults.lock();
        let Some(fault) = faults.get_mut(&op) else {
            return Ok(());
        };

        if fault.skip > 0 {
            fault.skip -= 1;
            return Ok(());
        }

        match faults.remove(&op) {
            Some(Fault { error, .. }) => {
                trace!("Injected {:?} failure: {}", op, error);
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn storage(&self, storage: StorageHandle) -> EngineResult<Arc<MemoryArchive>> {
        self.storages
            .get(&storage.as_raw())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(EngineError::invalid_handle)
    }
}

impl Engine for MemoryEngine {
    fn open_storage(&self, path: &str, _kind: StorageKind) -> EngineResult<StorageHandle> {
        self.check_fault(EngineOp::OpenStorage)?;

        let archive = self
            .archives
            .get(path)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(EngineError::not_found)?;

        let raw = self.handles.allocate();
        self.storages.insert(raw, archive);
        Ok(StorageHandle::from_raw(raw))
    }

    fn close_storage(&self, storage: StorageHandle) -> EngineResult<()> {
        self.check_fault(EngineOp::CloseStorage)?;
        self.storages
            .remove(&storage.as_raw())
            .map(|_| ())
            .ok_or_else(EngineError::invalid_handle)
    }

    fn open_file(&self, storage: StorageHandle, name: &str) -> EngineResult<FileHandle> {
        self.check_fault(EngineOp::OpenFile)?;

        let archive = self.storage(storage)?;
        let data = archive.lookup(name).cloned().ok_or_else(EngineError::not_found)?;

        let raw = self.handles.allocate();
        self.files.insert(raw, OpenEntry { data, position: 0 });
        Ok(FileHandle::from_raw(raw))
    }

    fn close_file(&self, file: FileHandle) -> EngineResult<()> {
        self.check_fault(EngineOp::CloseFile)?;
        self.files
            .remove(&file.as_raw())
            .map(|_| ())
            .ok_or_else(EngineError::invalid_handle)
    }

    fn read_file(&self, file: FileHandle, buf: &mut [u8]) -> EngineResult<usize> {
        self.check_fault(EngineOp::ReadFile)?;

        let mut entry = self
            .files
            .get_mut(&file.as_raw())
            .ok_or_else(EngineError::invalid_handle)?;

        let len = entry.data.len();
        let start = usize::try_from(entry.position).unwrap_or(usize::MAX).min(len);
        let mut count = buf.len().min(len - start);
        if let Some(limit) = self.read_limit {
            count = count.min(limit);
        }

        buf[..count].copy_from_slice(&entry.data[start..start + count]);
        entry.position += count as u64;
        Ok(count)
    }

    fn set_file_pointer(
        &self,
        file: FileHandle,
        offset: i64,
        whence: Whence,
    ) -> EngineResult<u64> {
        self.check_fault(EngineOp::SetFilePointer)?;

        let mut entry = self
            .files
            .get_mut(&file.as_raw())
            .ok_or_else(EngineError::invalid_handle)?;

        let size = entry.data.len() as u64;
        entry.position = resolve_position(entry.position, size, offset, whence)?;
        Ok(entry.position)
    }

    fn file_size(&self, file: FileHandle) -> EngineResult<u64> {
        self.check_fault(EngineOp::FileSize)?;
        self.files
            .get(&file.as_raw())
            .map(|entry| entry.data.len() as u64)
            .ok_or_else(EngineError::invalid_handle)
    }

    fn find_first(
        &self,
        storage: StorageHandle,
        mask: &str,
    ) -> EngineResult<Option<(FindHandle, FindData)>> {
        self.check_fault(EngineOp::FindFirst)?;

        let archive = self.storage(storage)?;
        let mask = mask_to_regex(mask)?;

        let Some((index, data)) = archive.find_from(0, &mask) else {
            return Ok(None);
        };

        let raw = self.handles.allocate();
        self.finds.insert(
            raw,
            Cursor {
                archive,
                mask,
                next: index + 1,
            },
        );
        Ok(Some((FindHandle::from_raw(raw), data)))
    }

    fn find_next(&self, find: FindHandle) -> EngineResult<Option<FindData>> {
        self.check_fault(EngineOp::FindNext)?;

        let mut cursor = self
            .finds
            .get_mut(&find.as_raw())
            .ok_or_else(EngineError::invalid_handle)?;

        let found = cursor.archive.find_from(cursor.next, &cursor.mask);
        match found {
            Some((index, data)) => {
                cursor.next = index + 1;
                Ok(Some(data))
            }
            None => {
                cursor.next = cursor.archive.len();
                Ok(None)
            }
        }
    }

    fn find_close(&self, find: FindHandle) -> EngineResult<()> {
        self.check_fault(EngineOp::FindClose)?;
        self.finds
            .remove(&find.as_raw())
            .map(|_| ())
            .ok_or_else(EngineError::invalid_handle)
    }
}
