use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// A BLE peripheral seen during a scan.
///
/// Identity is the platform identifier; only `rssi` may change when the same
/// device is observed again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: Option<String>,
    pub service_uuids: BTreeSet<Uuid>,
    pub rssi: Option<i16>,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            service_uuids: BTreeSet::new(),
            rssi: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.service_uuids.insert(uuid);
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Advertised name, or `Device XXXX` built from the tail of the id.
    pub fn display_name(&self) -> String {
        match self.name.as_deref() {
            Some(name) if !name.trim().is_empty() => name.to_string(),
            _ => {
                let chars: Vec<char> = self.id.chars().collect();
                let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
                format!("Device {}", tail)
            }
        }
    }

    pub fn signal_strength(&self) -> SignalStrength {
        SignalStrength::from_rssi(self.rssi)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalStrength {
    Excellent,
    Good,
    Fair,
    Weak,
    Unknown,
}

impl SignalStrength {
    pub fn from_rssi(rssi: Option<i16>) -> Self {
        match rssi {
            None => Self::Unknown,
            Some(r) if r >= -50 => Self::Excellent,
            Some(r) if r >= -60 => Self::Good,
            Some(r) if r >= -70 => Self::Fair,
            Some(_) => Self::Weak,
        }
    }
}

impl fmt::Display for SignalStrength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Excellent => "Excellent",
            Self::Good => "Good",
            Self::Fair => "Fair",
            Self::Weak => "Weak",
            Self::Unknown => "Unknown",
        };
        f.write_str(label)
    }
}

/// Lifecycle of the single connection owned by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    Connected,
    Streaming,
    Disconnecting,
    /// The adapter itself is unusable (powered off, permission denied).
    Error,
}

impl ConnectionState {
    /// Only these states accept a new connection attempt.
    pub fn accepts_connect(self) -> bool {
        matches!(self, Self::Idle | Self::Scanning | Self::Error)
    }

    pub fn accepts_scan(self) -> bool {
        matches!(self, Self::Idle | Self::Error)
    }

    /// A platform connection exists (or is being set up).
    pub fn has_link(self) -> bool {
        matches!(self, Self::Connected | Self::Streaming)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Six raw integers exactly as the device sent them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawReading {
    pub ax: i32,
    pub ay: i32,
    pub az: i32,
    pub gx: i32,
    pub gy: i32,
    pub gz: i32,
}

impl RawReading {
    pub fn from_array(values: [i32; 6]) -> Self {
        let [ax, ay, az, gx, gy, gz] = values;
        Self {
            ax,
            ay,
            az,
            gx,
            gy,
            gz,
        }
    }
}

/// One published accelerometer/gyroscope reading.
///
/// The default value is the zeroed sentinel exposed before any data arrives.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SensorSample {
    // Accelerometer (g)
    pub accel_x: f64,
    pub accel_y: f64,
    pub accel_z: f64,

    // Gyroscope (degrees/second)
    pub gyro_x: f64,
    pub gyro_y: f64,
    pub gyro_z: f64,

    pub raw: RawReading,

    /// Wall-clock arrival time; `None` for the sentinel.
    pub received_at: Option<DateTime<Utc>>,
    pub is_stale: bool,
}

impl SensorSample {
    pub fn is_sentinel(&self) -> bool {
        self.received_at.is_none()
    }

    /// Same reading, flagged as stale.
    pub fn into_stale(self) -> Self {
        Self {
            is_stale: true,
            ..self
        }
    }
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    StateChanged(ConnectionState),
    DeviceFound(DeviceDescriptor),
    Sample(SensorSample),
    StaleChanged(bool),
    Connected(DeviceDescriptor),
    ConnectionLost(DeviceDescriptor),
    Log(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>, severity: MessageSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
