//! Read-only stream over one archive entry.
//!
//! [`File`] layers a buffered, multi-format read protocol on the engine's
//! random-access primitives:
//!
//! - [`Format::All`] reads everything from the current position and yields
//!   an empty buffer at end of stream.
//! - [`Format::Line`] and [`Format::LineWithTerminator`] read up to the next
//!   `\n`, yielding `None` at end of stream.
//! - [`Format::Count`] reads up to `n` bytes, yielding `None` at end of
//!   stream.
//!
//! Native reads are issued in chunks of at most the configured
//! `read_buffer_size`. A line read that overshoots the terminator moves the
//! file pointer back to just after it.

use crate::config::CascLibConfig;
use crate::engine::{Engine, FileHandle, Whence};
use crate::error::EngineError;
use crate::registry::{ChildHandle, Tracked};
use crate::storage::StorageInner;
use crate::{CascLibError, Result};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::iter::FusedIterator;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Display name of files.
pub const FILE_TYPE_NAME: &str = "Casc File";

/// What a single read step consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// `"a"`: everything up to the end of the entry.
    All,
    /// `"l"`: the next line without its terminator.
    Line,
    /// `"L"`: the next line with its terminator, if present.
    LineWithTerminator,
    /// Up to this many bytes.
    Count(u64),
}

impl Format {
    /// Byte-count format from a host integer; negative counts are rejected.
    pub fn count(n: i64) -> Result<Self> {
        u64::try_from(n)
            .map(Self::Count)
            .map_err(|_| CascLibError::argument("read", "invalid format"))
    }
}

impl From<u64> for Format {
    fn from(n: u64) -> Self {
        Self::Count(n)
    }
}

impl FromStr for Format {
    type Err = CascLibError;

    /// Only the first character is significant, after an optional `*`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.strip_prefix('*').unwrap_or(s);
        match s.as_bytes().first() {
            Some(b'a') => Ok(Self::All),
            Some(b'l') => Ok(Self::Line),
            Some(b'L') => Ok(Self::LineWithTerminator),
            _ => Err(CascLibError::argument("read", "invalid format")),
        }
    }
}

/// Buffering mode accepted by [`File::setvbuf`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    /// `"no"`
    No,
    /// `"full"`
    Full,
    /// `"line"`
    Line,
}

impl FromStr for BufferMode {
    type Err = CascLibError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "no" => Ok(Self::No),
            "full" => Ok(Self::Full),
            "line" => Ok(Self::Line),
            other => Err(CascLibError::argument(
                "setvbuf",
                format!("invalid option '{other}'"),
            )),
        }
    }
}

/// Results of one read call, one per attempted format.
///
/// The list stops at the first format that could not be read, which is
/// reported as `None`.
pub type ReadResults = Vec<Option<Bytes>>;

struct FileState {
    handle: Option<FileHandle>,
    storage: Weak<StorageInner>,
}

pub(crate) struct FileInner {
    engine: Arc<dyn Engine>,
    config: Arc<CascLibConfig>,
    state: Mutex<FileState>,
}

impl FileInner {
    fn handle(&self) -> Result<FileHandle> {
        self.state.lock().handle.ok_or(CascLibError::InvalidHandle)
    }

    fn is_open(&self) -> bool {
        self.state.lock().handle.is_some()
    }

    fn seek(&self, whence: Whence, offset: i64) -> Result<u64> {
        let handle = self.handle()?;
        Ok(self.engine.set_file_pointer(handle, offset, whence)?)
    }

    fn read(&self, formats: &[Format]) -> Result<ReadResults> {
        let handle = self.handle()?;
        let size = self.engine.file_size(handle)?;

        let formats = if formats.is_empty() {
            &[Format::Line][..]
        } else {
            formats
        };

        let mut results = Vec::with_capacity(formats.len());

        for format in formats {
            let result = match *format {
                Format::All => Some(self.read_count(handle, size)?),
                Format::Line => self.read_line(handle, false)?,
                Format::LineWithTerminator => self.read_line(handle, true)?,
                Format::Count(0) => {
                    let position = self.engine.set_file_pointer(handle, 0, Whence::Cur)?;
                    (position < size).then(BytesMut::new)
                }
                Format::Count(count) => {
                    let data = self.read_count(handle, count)?;
                    (!data.is_empty()).then_some(data)
                }
            };

            let exhausted = result.is_none();
            results.push(result.map(BytesMut::freeze));
            if exhausted {
                break;
            }
        }

        Ok(results)
    }

    /// Read up to `count` bytes, fewer if end of stream comes first.
    fn read_count(&self, handle: FileHandle, count: u64) -> Result<BytesMut> {
        let chunk_size = self.config.read_buffer_size;
        let mut data = BytesMut::new();
        let mut remaining = count;

        while remaining > 0 {
            let wanted = usize::try_from(remaining).map_or(chunk_size, |r| r.min(chunk_size));
            let start = data.len();
            data.resize(start + wanted, 0);

            let read = self.engine.read_file(handle, &mut data[start..])?;
            data.truncate(start + read);
            trace!("Read {} of {} bytes from {}", read, wanted, handle);

            if read == 0 {
                break;
            }
            remaining -= read as u64;
        }

        Ok(data)
    }

    /// Read through the next `\n`, or to end of stream. `None` when end of
    /// stream comes before any byte.
    fn read_line(&self, handle: FileHandle, keep_terminator: bool) -> Result<Option<BytesMut>> {
        let mut line = BytesMut::new();
        let mut chunk = vec![0u8; self.config.read_buffer_size];

        loop {
            let read = self.engine.read_file(handle, &mut chunk)?;
            if read == 0 {
                return Ok((!line.is_empty()).then_some(line));
            }

            let filled = &chunk[..read];
            let Some(index) = filled.iter().position(|&b| b == b'\n') else {
                line.extend_from_slice(filled);
                continue;
            };

            let end = if keep_terminator { index + 1 } else { index };
            line.extend_from_slice(&filled[..end]);

            // Give back what was read past the terminator.
            let overshoot = read - index - 1;
            if overshoot > 0 {
                let rewind =
                    i64::try_from(overshoot).map_err(|_| EngineError::invalid_parameter())?;
                self.engine.set_file_pointer(handle, -rewind, Whence::Cur)?;
            }

            return Ok(Some(line));
        }
    }

    fn close(&self) -> Result<bool> {
        let (handle, storage) = {
            let mut state = self.state.lock();
            let handle = state.handle.take().ok_or(CascLibError::InvalidHandle)?;
            (handle, std::mem::take(&mut state.storage))
        };

        if let Some(storage) = storage.upgrade() {
            storage.registry().remove(ChildHandle::File(handle));
        }
        self.engine.close_file(handle)?;

        debug!("Closed file {}", handle);
        Ok(true)
    }
}

impl Tracked for FileInner {
    fn close_tracked(&self) -> Result<bool> {
        self.close()
    }
}

impl Drop for FileInner {
    fn drop(&mut self) {
        if self.state.get_mut().handle.is_none() {
            return;
        }
        if let Err(e) = self.close() {
            warn!("Failed to close dropped file: {}", e);
        }
    }
}

/// An open archive entry.
///
/// Dropping the file closes it. Closing the owning storage closes it too,
/// after which every operation fails with [`CascLibError::InvalidHandle`].
pub struct File {
    inner: Arc<FileInner>,
}

impl File {
    pub(crate) fn open(storage: &Arc<StorageInner>, name: &str) -> Result<Self> {
        let storage_handle = storage.handle()?;
        let handle = storage.engine().open_file(storage_handle, name)?;
        debug!("Opened file {} as {}", name, handle);

        let inner = Arc::new(FileInner {
            engine: Arc::clone(storage.engine()),
            config: Arc::clone(storage.config()),
            state: Mutex::new(FileState {
                handle: Some(handle),
                storage: Arc::downgrade(storage),
            }),
        });

        storage.registry().insert(
            ChildHandle::File(handle),
            Arc::downgrade(&inner) as Weak<dyn Tracked>,
        );

        Ok(Self { inner })
    }

    /// Move the file pointer and return the new position from the start.
    ///
    /// `seek(Whence::Cur, 0)` reports the position without moving it;
    /// `seek(Whence::End, 0)` returns the entry size.
    pub fn seek(&self, whence: Whence, offset: i64) -> Result<u64> {
        self.inner.seek(whence, offset)
    }

    /// Read according to `formats`; an empty list reads one line.
    ///
    /// Returns one result per format up to and including the first that
    /// hit end of stream. An engine error fails the whole call, discarding
    /// anything read so far.
    pub fn read(&self, formats: &[Format]) -> Result<ReadResults> {
        self.inner.read(formats)
    }

    /// Iterate reads of `formats` (one line if empty) until end of stream.
    pub fn lines(&self, formats: &[Format]) -> Result<Lines> {
        self.inner.handle()?;

        if formats.len() > self.inner.config.max_line_formats {
            return Err(CascLibError::argument("lines", "too many arguments"));
        }

        Ok(Lines {
            file: Arc::clone(&self.inner),
            formats: formats.to_vec(),
            finished: false,
        })
    }

    /// Archive entries are never writable; always `InvalidHandle`.
    pub fn write(&self, _data: &[u8]) -> Result<bool> {
        Err(CascLibError::InvalidHandle)
    }

    /// No buffering mode can be changed; succeeds while the file is open.
    pub fn setvbuf(&self, _mode: BufferMode, _size: Option<usize>) -> Result<bool> {
        self.inner.handle().map(|_| true)
    }

    /// Nothing is ever buffered for writing; succeeds while the file is open.
    pub fn flush(&self) -> Result<bool> {
        self.inner.handle().map(|_| true)
    }

    /// Close the file and stop tracking it in its storage.
    pub fn close(&self) -> Result<bool> {
        self.inner.close()
    }

    /// Whether the file is still open.
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}

impl Read for File {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let handle = self.inner.handle().map_err(io::Error::from)?;
        self.inner
            .engine
            .read_file(handle, buf)
            .map_err(|e| io::Error::from(CascLibError::from(e)))
    }
}

impl Seek for File {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (whence, offset) = match pos {
            SeekFrom::Start(offset) => (
                Whence::Set,
                i64::try_from(offset).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?,
            ),
            SeekFrom::Current(offset) => (Whence::Cur, offset),
            SeekFrom::End(offset) => (Whence::End, offset),
        };
        self.inner.seek(whence, offset).map_err(io::Error::from)
    }
}

impl fmt::Display for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{FILE_TYPE_NAME} ({:p})", Arc::as_ptr(&self.inner))?;
        if !self.is_open() {
            f.write_str(" (Closed)")?;
        }
        Ok(())
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("handle", &self.inner.state.lock().handle)
            .finish()
    }
}

/// Iterator returned by [`File::lines`].
///
/// Each step performs one read of the captured formats. End of stream ends
/// the iteration; an error is yielded once and ends it as well. The iterator
/// keeps the file alive.
pub struct Lines {
    file: Arc<FileInner>,
    formats: Vec<Format>,
    finished: bool,
}

impl fmt::Debug for Lines {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lines")
            .field("handle", &self.file.state.lock().handle)
            .field("formats", &self.formats)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Iterator for Lines {
    type Item = Result<ReadResults>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.file.read(&self.formats) {
            Ok(results) if matches!(results.first(), Some(Some(_))) => Some(Ok(results)),
            Ok(_) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

impl FusedIterator for Lines {}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parsing() {
        assert_eq!("a".parse::<Format>().ok(), Some(Format::All));
        assert_eq!("*a".parse::<Format>().ok(), Some(Format::All));
        assert_eq!("l".parse::<Format>().ok(), Some(Format::Line));
        assert_eq!("*line".parse::<Format>().ok(), Some(Format::Line));
        assert_eq!("L".parse::<Format>().ok(), Some(Format::LineWithTerminator));

        for bad in ["", "*", "x", "n"] {
            let err = bad.parse::<Format>().expect_err("invalid format");
            assert!(err.is_argument_error());
        }
    }

    #[test]
    fn test_count_format() {
        assert_eq!(Format::count(0).ok(), Some(Format::Count(0)));
        assert_eq!(Format::from(12), Format::Count(12));
        assert!(Format::count(-1).expect_err("negative").is_argument_error());
    }

    #[test]
    fn test_buffer_mode_parsing() {
        assert_eq!("no".parse::<BufferMode>().ok(), Some(BufferMode::No));
        assert_eq!("full".parse::<BufferMode>().ok(), Some(BufferMode::Full));
        assert_eq!("line".parse::<BufferMode>().ok(), Some(BufferMode::Line));
        assert!("all".parse::<BufferMode>().is_err());
    }
}
