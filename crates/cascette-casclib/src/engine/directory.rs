//! Loose-file engine for local storages.
//!
//! Treats every regular file below a root directory as an archive entry,
//! named by its path relative to the root with `/` separators. Online
//! storages are not supported.

use super::{
    Engine, FileHandle, FindData, FindHandle, HandleAllocator, StorageHandle, StorageKind, Whence,
    mask_to_regex, resolve_position,
};
use crate::error::{EngineError, EngineResult, codes};
use dashmap::DashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::vec::IntoIter;
use tracing::{debug, trace};
use walkdir::WalkDir;

struct OpenFile {
    file: File,
    size: u64,
    position: u64,
}

/// Engine exposing directories of loose files as storages.
#[derive(Default)]
pub struct DirectoryEngine {
    storages: DashMap<u64, PathBuf>,
    files: DashMap<u64, OpenFile>,
    finds: DashMap<u64, IntoIter<FindData>>,
    handles: HandleAllocator,
}

impl DirectoryEngine {
    /// Create an engine with nothing open.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of storage, file and cursor handles still open.
    pub fn open_handles(&self) -> usize {
        self.storages.len() + self.files.len() + self.finds.len()
    }

    fn root(&self, storage: StorageHandle) -> EngineResult<PathBuf> {
        self.storages
            .get(&storage.as_raw())
            .map(|entry| entry.value().clone())
            .ok_or_else(EngineError::invalid_handle)
    }

    /// Map an entry name onto a path below `root`, refusing anything that
    /// would leave it.
    fn entry_path(root: &Path, name: &str) -> EngineResult<PathBuf> {
        let normalized = name.replace('\\', "/");
        let relative = Path::new(&normalized);

        let mut path = root.to_path_buf();
        for component in relative.components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(EngineError::from_code(codes::ERROR_ACCESS_DENIED));
                }
            }
        }

        if path == root {
            return Err(EngineError::not_found());
        }
        Ok(path)
    }

    fn entry_name(root: &Path, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(root).ok()?;
        let parts: Vec<&str> = relative
            .components()
            .map(|component| component.as_os_str().to_str())
            .collect::<Option<_>>()?;
        Some(parts.join("/"))
    }

    fn scan(root: &Path, mask: &str) -> EngineResult<Vec<FindData>> {
        let mask = mask_to_regex(mask)?;
        let mut entries = Vec::new();

        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(walk_error)?;

            if !entry.file_type().is_file() {
                continue;
            }

            let Some(name) = Self::entry_name(root, entry.path()) else {
                trace!("Skipping non UTF-8 entry {:?}", entry.path());
                continue;
            };

            if mask.is_match(&name) {
                let file_size = entry.metadata().map_err(walk_error)?.len();
                entries.push(FindData { name, file_size });
            }
        }

        Ok(entries)
    }
}

fn walk_error(err: walkdir::Error) -> EngineError {
    err.into_io_error()
        .map_or_else(|| EngineError::from_code(codes::ERROR_READ_FAULT), EngineError::from)
}

impl Engine for DirectoryEngine {
    fn open_storage(&self, path: &str, kind: StorageKind) -> EngineResult<StorageHandle> {
        if kind != StorageKind::Local {
            return Err(EngineError::not_supported());
        }

        let root = PathBuf::from(path);
        if !root.is_dir() {
            return Err(EngineError::not_found());
        }
        // Entries are resolved against the canonical root.
        let root = root.canonicalize()?;

        let raw = self.handles.allocate();
        debug!("Opened loose-file storage {:?} as {:#x}", root, raw);
        self.storages.insert(raw, root);
        Ok(StorageHandle::from_raw(raw))
    }

    fn close_storage(&self, storage: StorageHandle) -> EngineResult<()> {
        self.storages
            .remove(&storage.as_raw())
            .map(|_| ())
            .ok_or_else(EngineError::invalid_handle)
    }

    fn open_file(&self, storage: StorageHandle, name: &str) -> EngineResult<FileHandle> {
        let root = self.root(storage)?;
        let path = Self::entry_path(&root, name)?;

        if !path.is_file() {
            return Err(EngineError::not_found());
        }

        // Symlinks may point anywhere; only targets below the root are entries.
        let resolved = path.canonicalize()?;
        if !resolved.starts_with(&root) {
            trace!("Refusing {} resolved outside the root to {:?}", name, resolved);
            return Err(EngineError::from_code(codes::ERROR_ACCESS_DENIED));
        }

        let file = File::open(&resolved)?;
        let size = file.metadata()?.len();

        let raw = self.handles.allocate();
        self.files.insert(
            raw,
            OpenFile {
                file,
                size,
                position: 0,
            },
        );
        Ok(FileHandle::from_raw(raw))
    }

    fn close_file(&self, file: FileHandle) -> EngineResult<()> {
        self.files
            .remove(&file.as_raw())
            .map(|_| ())
            .ok_or_else(EngineError::invalid_handle)
    }

    fn read_file(&self, file: FileHandle, buf: &mut [u8]) -> EngineResult<usize> {
        let mut entry = self
            .files
            .get_mut(&file.as_raw())
            .ok_or_else(EngineError::invalid_handle)?;

        // The entry is fixed at its size when opened.
        let remaining = entry.size.saturating_sub(entry.position);
        let wanted = usize::try_from(remaining).unwrap_or(usize::MAX).min(buf.len());
        if wanted == 0 {
            return Ok(0);
        }

        let read = entry.file.read(&mut buf[..wanted])?;
        entry.position += read as u64;
        Ok(read)
    }

    fn set_file_pointer(
        &self,
        file: FileHandle,
        offset: i64,
        whence: Whence,
    ) -> EngineResult<u64> {
        let mut entry = self
            .files
            .get_mut(&file.as_raw())
            .ok_or_else(EngineError::invalid_handle)?;

        let position = resolve_position(entry.position, entry.size, offset, whence)?;
        entry.file.seek(SeekFrom::Start(position))?;
        entry.position = position;
        Ok(position)
    }

    fn file_size(&self, file: FileHandle) -> EngineResult<u64> {
        self.files
            .get(&file.as_raw())
            .map(|entry| entry.size)
            .ok_or_else(EngineError::invalid_handle)
    }

    fn find_first(
        &self,
        storage: StorageHandle,
        mask: &str,
    ) -> EngineResult<Option<(FindHandle, FindData)>> {
        let root = self.root(storage)?;
        let mut entries = Self::scan(&root, mask)?.into_iter();

        let Some(first) = entries.next() else {
            return Ok(None);
        };

        let raw = self.handles.allocate();
        self.finds.insert(raw, entries);
        Ok(Some((FindHandle::from_raw(raw), first)))
    }

    fn find_next(&self, find: FindHandle) -> EngineResult<Option<FindData>> {
        self.finds
            .get_mut(&find.as_raw())
            .map(|mut entries| entries.next())
            .ok_or_else(EngineError::invalid_handle)
    }

    fn find_close(&self, find: FindHandle) -> EngineResult<()> {
        self.finds
            .remove(&find.as_raw())
            .map(|_| ())
            .ok_or_else(EngineError::invalid_handle)
    }
}
