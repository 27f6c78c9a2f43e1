//! `devclaim-os` is a library crate to run the `devclaim` workflow on
//! devices with an operating system.
//!
//! It provides the host implementations of the collaborators required by a
//! [`devclaim::workflow::ClaimWorkflow`]:
//!
//! - A file-backed `EEPROM` image where the configuration record is persisted
//! - A cloud connection over `MQTT`
//! - A monotonic clock
//! - A device identity derived from the MAC address of a physical network
//!   interface
//!
//! A JSON configuration file describes all of them, and a runner drives the
//! workflow on a `tokio` interval until the claim completes or fails.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// The monotonic clock.
pub mod clock;
/// The `MQTT` cloud connection.
pub mod cloud;
/// The host configuration file.
pub mod config;
/// Error management.
pub mod error;
/// Device identity discovery.
pub mod identity;
/// The workflow runner.
pub mod runner;
/// The file-backed byte store.
pub mod storage;
