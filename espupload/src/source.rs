//! Firmware image sources.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use log::debug;

/// Sequential reader over the image being uploaded.
///
/// The session owns its source for the duration of one upload and closes
/// it when the upload ends, whatever the outcome.
pub trait FirmwareSource: Send {
    /// Read up to `buf.len()` bytes; `Ok(0)` means end of data.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Bytes consumed so far.
    fn position(&self) -> u64;

    /// Total image size in bytes.
    fn size(&self) -> u64;

    /// Release the underlying resource. Further reads fail.
    fn close(&mut self);
}

/// Image read from a file on disk.
#[derive(Debug)]
pub struct FileSource {
    file: Option<File>,
    path: PathBuf,
    size: u64,
    position: u64,
}

impl FileSource {
    /// Open `path` for reading.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        debug!("Opened {} ({size} bytes)", path.display());
        Ok(Self {
            file: Some(file),
            path,
            size,
            position: 0,
        })
    }

    /// Path the image was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether [`close`](FirmwareSource::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }
}

impl FirmwareSource for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "source closed"))?;
        let n = file.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn close(&mut self) {
        if self.file.take().is_some() {
            debug!("Closed {}", self.path.display());
        }
    }
}

/// Image held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    data: Vec<u8>,
    position: usize,
    closed: bool,
    #[cfg(test)]
    read_limit: Option<usize>,
}

impl MemorySource {
    /// Wrap an in-memory image.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    /// Whether [`close`](FirmwareSource::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stop returning data at `offset` while still reporting the full size.
    #[cfg(test)]
    pub(crate) fn truncate_reads_at(&mut self, offset: usize) {
        self.read_limit = Some(offset);
    }

    fn end(&self) -> usize {
        #[cfg(test)]
        if let Some(limit) = self.read_limit {
            return limit.min(self.data.len());
        }
        self.data.len()
    }
}

impl FirmwareSource for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "source closed"));
        }
        let remaining = self.end().saturating_sub(self.position);
        let n = remaining.min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }

    fn position(&self) -> u64 {
        self.position as u64
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
