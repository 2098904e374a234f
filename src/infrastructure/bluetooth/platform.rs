//! The seam between the session and a concrete BLE stack.
//!
//! The session only ever talks to a [`BlePlatform`]; the btleplug backend and
//! the in-memory fake both implement it.

use crate::domain::models::DeviceDescriptor;
use crate::infrastructure::bluetooth::error::PlatformError;
use crate::infrastructure::bluetooth::protocol::GattProfile;
use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

/// Advertisements observed while a scan is running. May repeat devices.
pub type AdvertisementStream = BoxStream<'static, DeviceDescriptor>;

/// Raw notification values from the data characteristic.
///
/// The stream ends when the link drops.
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

pub type PlatformResult<T> = Result<T, PlatformError>;

#[async_trait]
pub trait BlePlatform: Send + Sync + 'static {
    /// Check the adapter is powered and usable.
    async fn ensure_ready(&self) -> PlatformResult<()>;

    async fn start_scan(&self) -> PlatformResult<AdvertisementStream>;

    async fn stop_scan(&self) -> PlatformResult<()>;

    async fn connect(&self, device_id: &str) -> PlatformResult<()>;

    /// Resolve the profile's service and data characteristic on a connected device.
    async fn discover(&self, device_id: &str, profile: &GattProfile) -> PlatformResult<()>;

    async fn subscribe(
        &self,
        device_id: &str,
        profile: &GattProfile,
    ) -> PlatformResult<NotificationStream>;

    async fn unsubscribe(&self, device_id: &str, characteristic: &Uuid) -> PlatformResult<()>;

    async fn disconnect(&self, device_id: &str) -> PlatformResult<()>;

    /// Release the adapter. Called once when the session stops.
    async fn shutdown(&self) -> PlatformResult<()> {
        Ok(())
    }
}
