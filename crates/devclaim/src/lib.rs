//! A claim workflow for devices connected to a cloud service.
//!
//! Claiming associates a device with the account of its owner. The cloud
//! performs the association through a webhook triggered by an event the device
//! publishes. This crate drives that handshake on the device side and makes
//! its outcome durable:
//!
//! - A [`config::ConfigStore`] keeps an 8-byte record in a persistent byte
//!   store. The record holds a magic marker and a set of flags, one of which
//!   says the device has already been claimed. A missing or corrupt record is
//!   reinitialized at startup.
//! - A [`workflow::ClaimWorkflow`] is a finite state machine polled once per
//!   tick. It waits for the cloud connection, publishes the claim event,
//!   forces a session restart, and then verifies the claim with a test event
//!   whose response arrives on a per-device channel.
//!
//! A device that has been claimed in a previous session never repeats the
//! network exchange. A failed claim can be retried through
//! [`workflow::ClaimWorkflow::force_claim`].
//!
//! The cloud connection, the clock and the device identity are abstracted by
//! the traits in [`cloud`], so the same workflow runs on bare-metal firmware
//! and on hosts with an operating system.
//!
//! This crate can be compiled for both `std` and `no_std` environments.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![no_std]

extern crate alloc;

/// Cloud connection, clock and identity abstractions.
pub mod cloud;
/// The persisted configuration record and its storage.
pub mod config;
/// Error management.
pub mod error;
/// The claim state machine.
pub mod workflow;
