use alloc::borrow::Cow;

use core::fmt;

/// All possible error kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The persistent store could not be read.
    StorageRead,
    /// The persistent store could not be written.
    StorageWrite,
    /// The claim options are not valid.
    InvalidOptions,
    /// The cloud service rejected an operation.
    Cloud,
}

impl ErrorKind {
    pub(crate) const fn description(self) -> &'static str {
        match self {
            Self::StorageRead => "Storage Read",
            Self::StorageWrite => "Storage Write",
            Self::InvalidOptions => "Invalid Options",
            Self::Cloud => "Cloud",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.description().fmt(f)
    }
}

/// A claim workflow error.
#[derive(Debug, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    description: Cow<'static, str>,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.description)
    }
}

impl core::error::Error for Error {}

impl Error {
    /// Creates an [`Error`] from an [`ErrorKind`] and a description.
    #[must_use]
    #[inline]
    pub fn new(kind: ErrorKind, description: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }

    /// Creates a [`ErrorKind::StorageRead`] error.
    #[must_use]
    #[inline]
    pub fn storage_read(description: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::StorageRead, description)
    }

    /// Creates a [`ErrorKind::StorageWrite`] error.
    #[must_use]
    #[inline]
    pub fn storage_write(description: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::StorageWrite, description)
    }

    /// Returns the [`ErrorKind`].
    #[must_use]
    #[inline]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error description.
    #[must_use]
    #[inline]
    pub fn description(&self) -> &str {
        &self.description
    }
}

/// A specialized [`Result`] type for [`Error`].
pub type Result<T> = core::result::Result<T, Error>;
