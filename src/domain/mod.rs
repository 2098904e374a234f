//! Pure sensor-side logic: data model, reassembly, liveness and settings.
//!
//! Nothing here performs I/O except [`settings::SettingsService`].

pub mod models;
pub mod reassembler;
pub mod recorder;
pub mod registry;
pub mod settings;
pub mod watchdog;
