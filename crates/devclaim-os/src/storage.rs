use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use devclaim::config::ByteStore;
use devclaim::error::{Error as ClaimError, Result as ClaimResult};

use tracing::debug;

use crate::error::Result;

/// Default capacity of a [`FileStore`], in bytes.
pub const DEFAULT_CAPACITY: usize = 4096;

// Value of an erased byte in flash and EEPROM memories.
const ERASED_BYTE: u8 = 0xFF;

/// A [`ByteStore`] emulating an `EEPROM` with a file.
///
/// The file grows on demand up to the store capacity. Bytes that have never
/// been written read as `0xFF`, as in an erased memory. Every write is
/// flushed to disk before returning.
#[derive(Debug)]
pub struct FileStore {
    file: File,
    path: PathBuf,
    capacity: usize,
}

impl FileStore {
    /// Opens or creates a [`FileStore`] at the given path.
    ///
    /// Missing parent directories are created.
    ///
    /// # Errors
    ///
    /// An error is returned when the file cannot be opened or created.
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        debug!("Opened store {} ({capacity} bytes)", path.display());

        Ok(Self {
            file,
            path,
            capacity,
        })
    }

    /// Returns the store capacity in bytes.
    #[must_use]
    #[inline]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the path of the backing file.
    #[must_use]
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    fn fits(&self, offset: usize, len: usize) -> bool {
        offset
            .checked_add(len)
            .is_some_and(|end| end <= self.capacity)
    }

    fn seek(&mut self, offset: u64) -> std::io::Result<()> {
        if self.file.seek(SeekFrom::Start(offset))? == offset {
            Ok(())
        } else {
            Err(std::io::Error::other("unexpected seek position"))
        }
    }

    fn len(&self) -> std::io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read_bytes(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        buf.fill(ERASED_BYTE);

        let len = self.len()?;
        if offset >= len {
            return Ok(());
        }

        let available = usize::try_from(len - offset).map_or(buf.len(), |n| n.min(buf.len()));
        self.seek(offset)?;
        self.file.read_exact(&mut buf[..available])
    }

    fn write_bytes(&mut self, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
        // Fill the gap after the current end of file, otherwise it would read
        // as zeroes.
        let len = self.len()?;
        if offset > len {
            let gap = usize::try_from(offset - len).map_err(std::io::Error::other)?;
            self.seek(len)?;
            self.file.write_all(&vec![ERASED_BYTE; gap])?;
        }

        self.seek(offset)?;
        self.file.write_all(bytes)?;
        self.file.sync_data()
    }
}

impl ByteStore for FileStore {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> ClaimResult<()> {
        if !self.fits(offset, buf.len()) {
            return Err(ClaimError::storage_read(format!(
                "Reading {} bytes at offset {offset} exceeds the capacity of {}.",
                buf.len(),
                self.path.display()
            )));
        }

        self.read_bytes(offset as u64, buf).map_err(|e| {
            ClaimError::storage_read(format!("{}: {e}", self.path.display()))
        })
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> ClaimResult<()> {
        if !self.fits(offset, bytes.len()) {
            return Err(ClaimError::storage_write(format!(
                "Writing {} bytes at offset {offset} exceeds the capacity of {}.",
                bytes.len(),
                self.path.display()
            )));
        }

        self.write_bytes(offset as u64, bytes).map_err(|e| {
            ClaimError::storage_write(format!("{}: {e}", self.path.display()))
        })
    }
}
