use uuid::Uuid;

use crate::error::TelemetryError;

/// Linak BLE Service and Characteristic UUIDs
/// Based on reverse engineering of Linak DPG (Desk Panel Gateway) protocol

// Main control service UUID
pub const CONTROL_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x99fa0001_338a_1024_8a49_009c0215f78a);

// Position/speed pair, readable and notifiable
pub const HEIGHT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x99fa0021_338a_1024_8a49_009c0215f78a);

// Characteristic for sending movement commands
pub const CONTROL_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x99fa0002_338a_1024_8a49_009c0215f78a);

// Characteristic for position reference
pub const REFERENCE_INPUT_UUID: Uuid =
    Uuid::from_u128(0x99fa0031_338a_1024_8a49_009c0215f78a);

/// Lowest reachable desk height; raw position 0 maps here.
pub const MIN_HEIGHT_MM: f64 = 620.0;

/// Highest reachable desk height.
pub const MAX_HEIGHT_MM: f64 = 1270.0;

/// Default arrival tolerance in millimeters.
pub const DEFAULT_HEIGHT_TOLERANCE_MM: f64 = 2.0;

/// Raw position units per millimeter.
const RAW_PER_MM: f64 = 10.0;

/// Raw speed units per mm/s.
const RAW_PER_MM_S: f64 = 100.0;

/// Movement commands written to the control characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementCommand {
    /// Stop all movement
    Stop,
    /// Move desk up
    Up,
    /// Move desk down
    Down,
}

impl MovementCommand {
    pub fn code(&self) -> u16 {
        match self {
            Self::Stop => 255,
            Self::Up => 71,
            Self::Down => 70,
        }
    }

    /// Convert command to bytes for BLE transmission
    pub fn to_bytes(&self) -> [u8; 2] {
        self.code().to_le_bytes()
    }
}

/// Commands written to the reference-input characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceInputCommand {
    Stop,
}

impl ReferenceInputCommand {
    pub fn code(&self) -> u16 {
        match self {
            Self::Stop => 32769,
        }
    }

    pub fn to_bytes(&self) -> [u8; 2] {
        self.code().to_le_bytes()
    }
}

/// Travel direction of the actuator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    /// Direction needed to get from `from_raw` to `to_raw`.
    pub fn towards(from_raw: u16, to_raw: u16) -> Self {
        if to_raw > from_raw {
            Self::Up
        } else {
            Self::Down
        }
    }

    pub fn command(&self) -> MovementCommand {
        match self {
            Self::Up => MovementCommand::Up,
            Self::Down => MovementCommand::Down,
        }
    }
}

/// One position/speed reading, either read directly or notified.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySample {
    pub position_raw: u16,
    pub speed_raw: i16,
    pub position_mm: f64,
    pub speed_mm_s: f64,
}

impl TelemetrySample {
    pub fn from_raw(position_raw: u16, speed_raw: i16) -> Self {
        Self {
            position_raw,
            speed_raw,
            position_mm: raw_to_mm(position_raw),
            speed_mm_s: raw_to_speed(speed_raw),
        }
    }

    /// Parse the 4-byte little-endian `<u16 position, i16 speed>` frame.
    /// Trailing bytes are ignored.
    pub fn decode(data: &[u8]) -> Result<Self, TelemetryError> {
        if data.len() < 4 {
            return Err(TelemetryError::ShortFrame { len: data.len() });
        }
        let position_raw = u16::from_le_bytes([data[0], data[1]]);
        let speed_raw = i16::from_le_bytes([data[2], data[3]]);
        Ok(Self::from_raw(position_raw, speed_raw))
    }

    pub fn encode(&self) -> [u8; 4] {
        let p = self.position_raw.to_le_bytes();
        let s = self.speed_raw.to_le_bytes();
        [p[0], p[1], s[0], s[1]]
    }

    pub fn is_stationary(&self) -> bool {
        self.speed_raw == 0
    }
}

/// Clamp a height into the reachable range.
pub fn clamp_mm(mm: f64) -> f64 {
    if mm.is_nan() {
        return MIN_HEIGHT_MM;
    }
    mm.clamp(MIN_HEIGHT_MM, MAX_HEIGHT_MM)
}

/// Convert millimeters to the desk's raw position, clamping first.
pub fn mm_to_raw(mm: f64) -> u16 {
    ((clamp_mm(mm) - MIN_HEIGHT_MM) * RAW_PER_MM).round() as u16
}

/// Convert the desk's raw position to millimeters
pub fn raw_to_mm(raw: u16) -> f64 {
    f64::from(raw) / RAW_PER_MM + MIN_HEIGHT_MM
}

pub fn raw_to_speed(raw: i16) -> f64 {
    f64::from(raw) / RAW_PER_MM_S
}

/// Arrival tolerance in raw units for a tolerance given in millimeters.
pub fn tolerance_raw(tolerance_mm: f64) -> u16 {
    (tolerance_mm.max(0.0) * RAW_PER_MM).round() as u16
}

/// Height as a percentage of the travel range. Not clamped.
pub fn mm_to_percentage(mm: f64) -> f64 {
    (mm - MIN_HEIGHT_MM) / ((MAX_HEIGHT_MM - MIN_HEIGHT_MM) / 100.0)
}

/// Height for a percentage of the travel range, clamped into range.
pub fn percentage_to_mm(percentage: f64) -> f64 {
    clamp_mm(percentage * ((MAX_HEIGHT_MM - MIN_HEIGHT_MM) / 100.0) + MIN_HEIGHT_MM)
}
