use alloc::vec;
use alloc::vec::Vec;

use log::{error, info};

use crate::error::{Error, Result};

/// Magic value that marks a valid [`ConfigRecord`].
pub const CONFIG_MAGIC: u32 = 0x750c_a339;

/// Flag set once the device has been successfully claimed.
pub const FLAG_CLAIMED: u16 = 0x0001;

/// Size in bytes of a serialized [`ConfigRecord`].
pub const RECORD_SIZE: usize = 8;

/// Default offset of the [`ConfigRecord`] inside a byte store.
pub const DEFAULT_OFFSET: usize = 1998;

// Value of an erased byte in flash and EEPROM memories.
const ERASED_BYTE: u8 = 0xFF;

/// The configuration record kept in persistent storage.
///
/// The record is stored as 8 little-endian bytes: a 4-byte magic value,
/// 2 bytes of flags and 2 reserved bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigRecord {
    /// Set to [`CONFIG_MAGIC`] when the record is valid.
    pub magic: u32,
    /// Flags such as [`FLAG_CLAIMED`].
    ///
    /// Unknown bits are preserved.
    pub flags: u16,
    /// Reserved for future use.
    pub reserved: u16,
}

impl ConfigRecord {
    /// Creates a freshly initialized [`ConfigRecord`] with no flags set.
    #[must_use]
    pub const fn initialized() -> Self {
        Self {
            magic: CONFIG_MAGIC,
            flags: 0,
            reserved: 0,
        }
    }

    /// Checks whether the record carries the expected magic value.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.magic == CONFIG_MAGIC
    }

    /// Returns whether the flag bits in `mask` are set.
    #[must_use]
    pub const fn flag(&self, mask: u16) -> bool {
        (self.flags & mask) != 0
    }

    /// Sets or clears the flag bits in `mask`.
    #[inline]
    pub fn set_flag(&mut self, mask: u16, value: bool) {
        if value {
            self.flags |= mask;
        } else {
            self.flags &= !mask;
        }
    }

    /// Serializes the record into its persisted layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut bytes = [0u8; RECORD_SIZE];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.flags.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.reserved.to_le_bytes());
        bytes
    }

    /// Deserializes a record from its persisted layout.
    ///
    /// The magic value is **not** validated, see [`Self::is_valid`].
    #[must_use]
    pub const fn from_bytes(bytes: [u8; RECORD_SIZE]) -> Self {
        Self {
            magic: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            flags: u16::from_le_bytes([bytes[4], bytes[5]]),
            reserved: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }
}

/// A persistent byte store addressed by offset, such as an `EEPROM`.
///
/// No atomicity or wear-leveling guarantees are required beyond what the
/// hardware provides.
pub trait ByteStore {
    /// Fills `buf` with the bytes located at `offset`.
    ///
    /// # Errors
    ///
    /// An [`crate::error::ErrorKind::StorageRead`] error if the bytes cannot
    /// be read.
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<()>;

    /// Writes `bytes` at `offset`.
    ///
    /// The bytes must be durable when this method returns.
    ///
    /// # Errors
    ///
    /// An [`crate::error::ErrorKind::StorageWrite`] error if the bytes cannot
    /// be written.
    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()>;
}

/// The storage where a [`ConfigRecord`] is loaded from and saved to.
///
/// Implement this trait to keep the record somewhere other than a plain
/// [`ByteStore`], for example in a file system or an external `FRAM`.
pub trait ConfigStorage {
    /// Loads the record.
    ///
    /// The magic value is **not** validated.
    ///
    /// # Errors
    ///
    /// An [`crate::error::ErrorKind::StorageRead`] error if the record
    /// cannot be read.
    fn load(&mut self) -> Result<ConfigRecord>;

    /// Overwrites the stored record.
    ///
    /// # Errors
    ///
    /// An [`crate::error::ErrorKind::StorageWrite`] error if the record
    /// cannot be written.
    fn save(&mut self, record: &ConfigRecord) -> Result<()>;
}

/// A [`ConfigStorage`] keeping the record at a fixed offset of a
/// [`ByteStore`].
///
/// The store must have [`RECORD_SIZE`] bytes available at the offset.
#[derive(Debug)]
pub struct OffsetStorage<B: ByteStore> {
    store: B,
    offset: usize,
}

impl<B: ByteStore> OffsetStorage<B> {
    /// Creates an [`OffsetStorage`] for the given [`ByteStore`] and offset.
    #[must_use]
    pub const fn new(store: B, offset: usize) -> Self {
        Self { store, offset }
    }

    /// Returns the offset of the record.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Returns a reference to the underlying [`ByteStore`].
    #[must_use]
    pub const fn store(&self) -> &B {
        &self.store
    }

    /// Consumes the [`OffsetStorage`] and returns the underlying
    /// [`ByteStore`].
    #[must_use]
    pub fn into_inner(self) -> B {
        self.store
    }
}

impl<B: ByteStore> ConfigStorage for OffsetStorage<B> {
    fn load(&mut self) -> Result<ConfigRecord> {
        let mut bytes = [0u8; RECORD_SIZE];
        self.store.read(self.offset, &mut bytes)?;
        Ok(ConfigRecord::from_bytes(bytes))
    }

    fn save(&mut self, record: &ConfigRecord) -> Result<()> {
        self.store.write(self.offset, &record.to_bytes())
    }
}

/// An in-memory [`ByteStore`].
///
/// A new store is entirely erased, so every byte reads as `0xFF`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryStore {
    bytes: Vec<u8>,
}

impl MemoryStore {
    /// Creates an erased [`MemoryStore`] with the given capacity in bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: vec![ERASED_BYTE; capacity],
        }
    }

    /// Creates a [`MemoryStore`] from existing contents.
    #[must_use]
    pub const fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Returns the whole contents of the store.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn range(&self, offset: usize, len: usize) -> Option<core::ops::Range<usize>> {
        let end = offset.checked_add(len)?;
        (end <= self.bytes.len()).then_some(offset..end)
    }
}

impl ByteStore for MemoryStore {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let range = self.range(offset, buf.len()).ok_or_else(|| {
            Error::storage_read(alloc::format!(
                "Reading {} bytes at offset {offset} exceeds the store capacity.",
                buf.len()
            ))
        })?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let range = self.range(offset, bytes.len()).ok_or_else(|| {
            Error::storage_write(alloc::format!(
                "Writing {} bytes at offset {offset} exceeds the store capacity.",
                bytes.len()
            ))
        })?;
        self.bytes[range].copy_from_slice(bytes);
        Ok(())
    }
}

/// The in-memory copy of the [`ConfigRecord`] together with its storage.
///
/// Flag changes are **not** persisted automatically: call [`Self::save`]
/// after [`Self::set_flag`].
#[derive(Debug)]
pub struct ConfigStore<S: ConfigStorage> {
    storage: S,
    record: ConfigRecord,
}

impl<S: ConfigStorage> ConfigStore<S> {
    /// Loads the record from the given storage.
    ///
    /// A record that cannot be read, or that has a wrong magic value, is
    /// reset to its default values and written back immediately. Storage
    /// errors are logged and the in-memory record is used anyway: it will be
    /// written again on the next change.
    pub fn init(mut storage: S) -> Self {
        let record = match storage.load() {
            Ok(record) if record.is_valid() => Some(record),
            Ok(_) => None,
            Err(e) => {
                error!("Impossible to load the configuration record: {e}");
                None
            }
        };

        let record = record.unwrap_or_else(|| {
            info!("Reinitializing the configuration record");
            let record = ConfigRecord::initialized();
            if let Err(e) = storage.save(&record) {
                error!("Impossible to save the configuration record: {e}");
            }
            record
        });

        info!("flags={:04x}", record.flags);

        Self { storage, record }
    }

    /// Returns the in-memory record.
    #[must_use]
    #[inline]
    pub const fn record(&self) -> &ConfigRecord {
        &self.record
    }

    /// Returns whether the flag bits in `mask` are set.
    #[must_use]
    #[inline]
    pub const fn get_flag(&self, mask: u16) -> bool {
        self.record.flag(mask)
    }

    /// Sets or clears the flag bits in `mask` in the in-memory record.
    #[inline]
    pub fn set_flag(&mut self, mask: u16, value: bool) {
        self.record.set_flag(mask, value);
    }

    /// Returns whether the [`FLAG_CLAIMED`] flag is set.
    #[must_use]
    #[inline]
    pub const fn is_claimed(&self) -> bool {
        self.get_flag(FLAG_CLAIMED)
    }

    /// Writes the in-memory record to the storage.
    ///
    /// # Errors
    ///
    /// An [`crate::error::ErrorKind::StorageWrite`] error if the storage
    /// fails. The in-memory record keeps the change anyway.
    #[inline]
    pub fn save(&mut self) -> Result<()> {
        self.storage.save(&self.record)
    }

    /// Returns the size of the persisted record.
    #[must_use]
    #[inline]
    pub const fn record_size(&self) -> usize {
        RECORD_SIZE
    }

    /// Returns a reference to the storage.
    #[must_use]
    #[inline]
    pub const fn storage(&self) -> &S {
        &self.storage
    }

    /// Returns a mutable reference to the storage.
    #[must_use]
    #[inline]
    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }
}
