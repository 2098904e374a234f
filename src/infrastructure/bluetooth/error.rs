//! Error types surfaced by BLE backends and by the session.

use crate::domain::models::ConnectionState;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Failure reported by a [`BlePlatform`](super::platform::BlePlatform) backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Bluetooth permission denied")]
    PermissionDenied,
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("device {0} not found")]
    DeviceNotFound(String),
    #[error("service {0} not found on device")]
    ServiceNotFound(Uuid),
    #[error("characteristic {0} not found on device")]
    CharacteristicNotFound(Uuid),
    #[error("platform call timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Backend(String),
}

impl PlatformError {
    /// The adapter as a whole is unusable, not just this one device.
    pub fn is_adapter_fault(&self) -> bool {
        matches!(self, Self::PermissionDenied | Self::AdapterUnavailable(_))
    }
}

/// Failure returned to consumers of a [`SensorHandle`](super::service::SensorHandle).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("a connection attempt is already in progress")]
    ConnectInProgress,
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },
    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("connection attempt cancelled")]
    Cancelled,
    #[error("sensor engine has stopped")]
    EngineStopped,
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// A notification payload that is not ASCII text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("non-ASCII byte 0x{byte:02X} at offset {offset} in {len}-byte notification")]
pub struct DecodeError {
    pub byte: u8,
    pub offset: usize,
    pub len: usize,
}
