//! Linak desk control over Bluetooth LE.

pub mod bluetooth;
pub mod connection;
pub mod controller;
pub mod identity;
pub mod motion;
pub mod protocol;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
mod mock;

pub use bluetooth::BtleTransport;
pub use connection::{ConnectionManager, ConnectionSettings, ConnectionState};
pub use controller::{Arrival, DeskController};
pub use identity::{DeviceIdentity, IdentityCache};
pub use motion::{MotionController, MotionSettings, MotionState, MoveOutcome};
pub use protocol::{Direction, TelemetrySample};
pub use telemetry::{DeskObserver, ObserverId, TelemetryDistributor};
pub use transport::{Capabilities, Channel, DiscoveredDevice, Link, Transport};
