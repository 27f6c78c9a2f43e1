use std::path::{Path, PathBuf};

use devclaim::workflow::ClaimOptions;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::storage::DEFAULT_CAPACITY;

/// Persistent storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Path of the file emulating the `EEPROM`.
    pub path: PathBuf,
    /// Capacity of the emulated `EEPROM`, in bytes.
    pub capacity: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("eeprom.bin"),
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// `MQTT` broker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Broker host name or address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Topic prefix of all events.
    pub prefix: String,
    /// Keep alive interval, in seconds.
    pub keep_alive_secs: u64,
    /// Time to wait before reconnecting after a connection loss.
    pub reconnect_delay_ms: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            prefix: "devclaim".into(),
            keep_alive_secs: 5,
            reconnect_delay_ms: 1000,
        }
    }
}

/// The host configuration.
///
/// It is read from a JSON file where every field is optional:
///
/// ```json
/// {
///     "device_id": "e00fce68f0e6d3b1c2a4a7f1",
///     "storage": { "path": "/var/lib/devclaim/eeprom.bin" },
///     "broker": { "host": "broker.local", "port": 1883 },
///     "claim": { "offset": 1990, "connect_wait_ms": 0 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Device identifier.
    ///
    /// When missing, it is derived from a MAC address.
    pub device_id: Option<String>,
    /// Persistent storage settings.
    pub storage: StorageSettings,
    /// `MQTT` broker settings.
    pub broker: BrokerSettings,
    /// Time between two workflow ticks.
    pub tick_interval_ms: u64,
    /// Claim workflow options.
    pub claim: ClaimOptions,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            storage: StorageSettings::default(),
            broker: BrokerSettings::default(),
            tick_interval_ms: 100,
            claim: ClaimOptions::default(),
        }
    }
}

impl HostConfig {
    /// Reads a [`HostConfig`] from a JSON file.
    ///
    /// # Errors
    ///
    /// An error is returned when the file cannot be read or contains an
    /// invalid configuration.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::from(e).info(path.display().to_string()))?;
        Self::from_json(&contents)
    }

    /// Parses a [`HostConfig`] from a JSON string.
    ///
    /// # Errors
    ///
    /// An error is returned when the string is not a valid configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the consistency of a [`HostConfig`].
    ///
    /// # Errors
    ///
    /// An [`ErrorKind::Config`] error when the tick interval is zero or the
    /// storage cannot hold the configuration record at the claim offset.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(Error::new(
                ErrorKind::Config,
                "The tick interval must be greater than zero.",
            ));
        }

        if self
            .claim
            .offset
            .checked_add(devclaim::config::RECORD_SIZE)
            .is_none_or(|end| end > self.storage.capacity)
        {
            return Err(Error::new(
                ErrorKind::Config,
                format!(
                    "The storage capacity of {} bytes cannot hold a record at offset {}.",
                    self.storage.capacity, self.claim.offset
                ),
            ));
        }

        Ok(())
    }
}
