use std::borrow::Cow;

/// All possible error kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Input/output error.
    Io,
    /// Configuration file error.
    Config,
    /// `MQTT` client error.
    Mqtt,
    /// The device identity cannot be determined.
    Identity,
    /// Claim workflow error.
    Claim,
}

impl ErrorKind {
    pub(crate) const fn description(self) -> &'static str {
        match self {
            Self::Io => "Input/Output",
            Self::Config => "Configuration",
            Self::Mqtt => "Mqtt",
            Self::Identity => "Identity",
            Self::Claim => "Claim",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.description().fmt(f)
    }
}

/// A `devclaim-os` error.
#[derive(PartialEq)]
pub struct Error {
    kind: ErrorKind,
    description: Cow<'static, str>,
    info: Option<Cow<'static, str>>,
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error().fmt(f)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error().fmt(f)
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Creates an [`Error`] from an [`ErrorKind`] and a description.
    #[must_use]
    #[inline]
    pub fn new(kind: ErrorKind, description: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            description: description.into(),
            info: None,
        }
    }

    /// Adds more information about the error.
    #[must_use]
    #[inline]
    pub fn info(mut self, info: impl Into<Cow<'static, str>>) -> Self {
        self.info = Some(info.into());
        self
    }

    /// Returns the [`ErrorKind`].
    #[must_use]
    #[inline]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub(crate) fn error(&self) -> String {
        let mut error = format!("{}: {}", self.kind, self.description);
        if let Some(info) = &self.info {
            error.push_str(&format!(" ({info})"));
        }
        error
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::Config, e.to_string())
    }
}

impl From<rumqttc::v5::ClientError> for Error {
    fn from(e: rumqttc::v5::ClientError) -> Self {
        Self::new(ErrorKind::Mqtt, e.to_string())
    }
}

impl From<devclaim::error::Error> for Error {
    fn from(e: devclaim::error::Error) -> Self {
        Self::new(ErrorKind::Claim, e.to_string())
    }
}

/// A specialized [`Result`] type for [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
