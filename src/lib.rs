//! BLE session and streaming-reassembly engine for a six-axis motion sensor.
//!
//! [`infrastructure::bluetooth::SensorService`] owns the connection lifecycle;
//! consumers talk to it through a cloneable [`infrastructure::bluetooth::SensorHandle`].

pub mod domain;
pub mod infrastructure;
pub mod presentation;
