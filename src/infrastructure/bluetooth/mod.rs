//! Bluetooth Module
//!
//! Provides the BLE session for the motion sensor.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │            SensorHandle  ──commands──▶  SensorService    │
//! │  (cloneable consumer API)        (owns all session state)│
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ SessionEvent mailbox
//!         ┌─────────────┼─────────────┬──────────────┐
//!         │             │             │              │
//!         ▼             ▼             ▼              ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐  ┌──────────┐
//! │  Scanner  │  │ Connection │  │ Protocol │  │  Timers  │
//! │           │  │            │  │          │  │          │
//! │ - adverts │  │ - connect  │  │ - UUIDs  │  │ - scan   │
//! │ - timeout │  │ - discover │  │ - filter │  │ - watchdog│
//! │           │  │ - subscribe│  │ - decode │  │ - retry  │
//! └─────┬─────┘  └─────┬──────┘  └──────────┘  └──────────┘
//!       └──────┬───────┘
//!              ▼
//!       BlePlatform (btleplug | fake)
//! ```
//!
//! ## Modules
//!
//! - [`platform`] - The backend trait the session talks to
//! - [`btleplug_backend`] - System Bluetooth via btleplug
//! - [`fake`] - Scripted backend for tests and `--simulate`
//! - [`protocol`] - GATT profiles, device filter, notification decoding
//! - [`scanner`] - BLE device discovery
//! - [`connection`] - Connect, discovery and notification subscription
//! - [`service`] - Session state machine and consumer handle

pub mod btleplug_backend;
pub mod connection;
pub mod error;
pub mod fake;
pub mod platform;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod timers;

// Re-export main service for convenience
pub use error::{DecodeError, EngineError, PlatformError};
pub use platform::BlePlatform;
pub use service::{SensorHandle, SensorService, SessionConfig};
