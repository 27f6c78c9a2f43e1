use alloc::string::String;

use core::fmt;

use serde::Serialize;

use crate::error::Result;

/// Event that ends the current cloud session.
///
/// The cloud closes the connection when it receives this event, and the
/// device reconnects on its own.
pub const SESSION_END_EVENT: &str = "spark/device/session/end";

/// Delivery scope of a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub enum Visibility {
    /// Delivered only to the account that owns the device.
    Private,
    /// Delivered to anyone.
    Public,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Private => "private".fmt(f),
            Self::Public => "public".fmt(f),
        }
    }
}

/// Scope of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub enum SubscriptionScope {
    /// Only events coming from the devices of the same account.
    MyDevices,
    /// Every public event.
    AllDevices,
}

/// An event received through a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct InboundEvent {
    /// Event name.
    pub name: String,
    /// Event payload.
    pub data: String,
}

impl InboundEvent {
    /// Creates an [`InboundEvent`].
    #[must_use]
    #[inline]
    pub fn new(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// A connection to the cloud service.
///
/// Events received on a subscription are queued by the implementation and
/// handed out through [`Cloud::poll_inbound`], so they are always processed
/// from the same context as the rest of the workflow.
pub trait Cloud {
    /// Returns whether the device is connected to the cloud.
    fn is_connected(&self) -> bool;

    /// Publishes an event.
    ///
    /// Delivery is fire-and-forget.
    ///
    /// # Errors
    ///
    /// An [`crate::error::ErrorKind::Cloud`] error if the event cannot be
    /// queued for sending.
    fn publish(&mut self, name: &str, data: &str, visibility: Visibility) -> Result<()>;

    /// Subscribes to all events whose name starts with `prefix`.
    ///
    /// # Errors
    ///
    /// An [`crate::error::ErrorKind::Cloud`] error if the subscription
    /// cannot be registered.
    fn subscribe(&mut self, prefix: &str, scope: SubscriptionScope) -> Result<()>;

    /// Takes the next queued [`InboundEvent`], if any.
    fn poll_inbound(&mut self) -> Option<InboundEvent>;
}

/// A monotonic millisecond clock.
pub trait Clock {
    /// Returns the milliseconds elapsed since an arbitrary, fixed origin.
    ///
    /// The value may wrap around.
    fn now_ms(&self) -> u64;
}

/// A provider of the unique device identifier.
pub trait DeviceIdentity {
    /// Returns the device identifier.
    fn device_id(&self) -> String;
}

impl DeviceIdentity for str {
    fn device_id(&self) -> String {
        self.into()
    }
}

impl DeviceIdentity for String {
    fn device_id(&self) -> String {
        self.clone()
    }
}
