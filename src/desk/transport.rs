//! Seam between the desk logic and the wireless link.
//!
//! [`Transport`] discovers and connects, [`Link`] is one live connection.
//! The BLE implementation lives in [`super::bluetooth`]; tests use an
//! in-memory double.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use super::identity::DeviceIdentity;
use super::protocol::{
    CONTROL_CHARACTERISTIC_UUID, HEIGHT_CHARACTERISTIC_UUID, REFERENCE_INPUT_UUID,
};
use crate::error::TransportError;

/// Attributes the desk exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Position/speed pair (read, notify)
    Position,
    /// Movement command (write)
    Command,
    /// Reference-input command (write)
    ReferenceInput,
}

impl Channel {
    pub fn uuid(&self) -> Uuid {
        match self {
            Self::Position => HEIGHT_CHARACTERISTIC_UUID,
            Self::Command => CONTROL_CHARACTERISTIC_UUID,
            Self::ReferenceInput => REFERENCE_INPUT_UUID,
        }
    }
}

/// What the platform backend can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Device handles survive a process restart and can be reconnected
    /// without scanning.
    pub rehydrate_identity: bool,
    /// Writes to the reference-input characteristic are accepted.
    pub reference_input: bool,
}

impl Capabilities {
    pub fn for_current_platform() -> Self {
        Self {
            rehydrate_identity: cfg!(target_os = "linux"),
            reference_input: !cfg!(target_os = "windows"),
        }
    }
}

/// A device seen during a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub name: Option<String>,
    pub identity: DeviceIdentity,
}

impl DiscoveredDevice {
    pub fn address(&self) -> &str {
        &self.identity.address
    }
}

/// Notification payloads in the order the link delivered them.
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

#[async_trait]
pub trait Transport: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Scan for `timeout`. With an address only that device is returned.
    async fn scan(
        &self,
        address: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<DiscoveredDevice>, TransportError>;

    async fn connect(
        &self,
        identity: &DeviceIdentity,
        timeout: Duration,
    ) -> Result<Arc<dyn Link>, TransportError>;
}

#[async_trait]
pub trait Link: Send + Sync {
    fn identity(&self) -> &DeviceIdentity;

    async fn is_connected(&self) -> bool;

    async fn read(&self, channel: Channel) -> Result<Vec<u8>, TransportError>;

    async fn write(&self, channel: Channel, data: &[u8]) -> Result<(), TransportError>;

    /// Subscriptions are counted per channel; the device stops notifying once
    /// every subscriber has called `unsubscribe`. The stream ends when the
    /// link is lost.
    async fn subscribe(&self, channel: Channel) -> Result<NotificationStream, TransportError>;

    async fn unsubscribe(&self, channel: Channel) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Resolves once, when the link is lost without `disconnect` having been
    /// called. Pending forever otherwise.
    async fn disconnected(&self);
}
