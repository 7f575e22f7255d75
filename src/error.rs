use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::desk::protocol::MovementCommand;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Error communicating with desk (btleplug): {source}")]
    Btle {
        #[from]
        source: btleplug::Error,
    },

    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("Timeout during {operation} ({}s)", .after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Could not find characteristic {0} on desk")]
    MissingCharacteristic(Uuid),

    #[error("Device handle could not be resolved: {0}")]
    UnknownDevice(String),

    #[error("Link to desk is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Telemetry frame too short: {len} bytes, expected 4")]
    ShortFrame { len: usize },
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("No desk configured. Please configure a desk first.")]
    NoDeviceConfigured,

    #[error("Desk with address {address} not found")]
    DeviceNotFound { address: String },

    #[error("Failed to connect to desk after {attempts} attempts: {source}")]
    LinkFailure {
        attempts: u32,
        source: TransportError,
    },

    #[error("Scanning for desks failed: {source}")]
    Scan { source: TransportError },
}

#[derive(Error, Debug)]
pub enum MotionError {
    #[error(transparent)]
    Connect {
        #[from]
        source: ConnectError,
    },

    #[error("Failed to read desk telemetry: {source}")]
    Read { source: TransportError },

    #[error("Failed to subscribe to desk telemetry: {source}")]
    Subscribe { source: TransportError },

    #[error("Failed to write {command:?} command, motion aborted: {source}")]
    TransportWrite {
        command: MovementCommand,
        source: TransportError,
    },

    #[error("Failed to write reference input stop: {source}")]
    ReferenceWrite { source: TransportError },

    #[error(transparent)]
    MalformedTelemetry {
        #[from]
        source: TelemetryError,
    },
}
