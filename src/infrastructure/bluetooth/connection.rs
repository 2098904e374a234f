//! BLE Connection Module
//!
//! Runs one connection attempt: adapter check, bounded platform connect,
//! GATT discovery, settle delay, then the notification subscription.

use crate::domain::models::{AppEvent, DeviceDescriptor, MessageSeverity, StatusMessage};
use crate::infrastructure::bluetooth::error::EngineError;
use crate::infrastructure::bluetooth::platform::{
    BlePlatform, NotificationStream, PlatformResult,
};
use crate::infrastructure::bluetooth::protocol::GattProfile;
use crate::infrastructure::bluetooth::service::SessionEvent;
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SUBSCRIBE_ATTEMPTS: u32 = 3;
const SUBSCRIBE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub profile: GattProfile,
    /// Pause between discovery and subscribing; some boards are not ready
    /// right after the link comes up.
    pub settle_delay: Duration,
    /// Bound on the platform connect call. `None` waits indefinitely.
    pub connect_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            profile: GattProfile::for_revision(Default::default()),
            settle_delay: Duration::from_secs(1),
            connect_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// An active notification subscription.
///
/// Dropping it stops forwarding but leaves the platform subscription in
/// place; call [`release`](Self::release) to undo both.
#[derive(Debug)]
pub struct Subscription {
    device_id: String,
    characteristic: Uuid,
    forwarder: JoinHandle<()>,
}

impl Subscription {
    /// Forward `notifications` into the session mailbox tagged with `epoch`.
    /// A [`SessionEvent::StreamEnded`] follows the last value.
    pub fn forward(
        device_id: impl Into<String>,
        characteristic: Uuid,
        mut notifications: NotificationStream,
        epoch: u64,
        session_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let forwarder = tokio::spawn(async move {
            while let Some(payload) = notifications.next().await {
                if session_tx
                    .send(SessionEvent::Notification { epoch, payload })
                    .is_err()
                {
                    return;
                }
            }
            let _ = session_tx.send(SessionEvent::StreamEnded { epoch });
        });
        Self {
            device_id: device_id.into(),
            characteristic,
            forwarder,
        }
    }

    pub async fn release<P: BlePlatform + ?Sized>(self, platform: &P) -> PlatformResult<()> {
        self.forwarder.abort();
        platform
            .unsubscribe(&self.device_id, &self.characteristic)
            .await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Result of a successful connection. Values already notified by the device
/// wait in `notifications` until the session starts forwarding them.
pub struct ConnectionResult {
    pub device: DeviceDescriptor,
    pub notifications: NotificationStream,
}

impl fmt::Debug for ConnectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionResult")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// BLE Connection handler
pub struct BleConnection<P: BlePlatform> {
    platform: Arc<P>,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    config: ConnectionConfig,
}

impl<P: BlePlatform> BleConnection<P> {
    pub fn new(
        platform: Arc<P>,
        session_tx: mpsc::UnboundedSender<SessionEvent>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            platform,
            session_tx,
            event_sender,
            config,
        }
    }

    /// Connect to `device` and subscribe to its data characteristic.
    /// `epoch` tags the link-up event. On failure nothing is left
    /// subscribed or connected.
    pub async fn connect(
        &self,
        device: DeviceDescriptor,
        epoch: u64,
    ) -> Result<ConnectionResult, EngineError> {
        info!("Connecting to {} ({})", device.display_name(), device.id);
        self.send_log("Connecting to device...", MessageSeverity::Info);

        // Step 1: Adapter must be usable
        self.platform.ensure_ready().await?;

        // Step 2: Connect to BLE device
        self.connect_device(&device.id).await?;
        info!("Device connected: {}", device.display_name());
        let _ = self.session_tx.send(SessionEvent::LinkUp { epoch });

        // Step 3: Discovery and subscription
        match self.open_stream(&device.id).await {
            Ok(notifications) => {
                self.send_log("Connection established!", MessageSeverity::Success);
                Ok(ConnectionResult {
                    device,
                    notifications,
                })
            }
            Err(e) => {
                error!("Connection setup failed for {}: {}", device.id, e);
                self.release_link(&device.id).await;
                Err(e)
            }
        }
    }

    async fn connect_device(&self, device_id: &str) -> Result<(), EngineError> {
        let Some(limit) = self.config.connect_timeout else {
            return Ok(self.platform.connect(device_id).await?);
        };

        match time::timeout(limit, self.platform.connect(device_id)).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!("Connect to {} timed out after {:?}", device_id, limit);
                self.release_link(device_id).await;
                Err(EngineError::ConnectTimeout(limit))
            }
        }
    }

    async fn open_stream(&self, device_id: &str) -> Result<NotificationStream, EngineError> {
        let profile = self.config.profile;

        self.platform.discover(device_id, &profile).await?;
        info!("Found sensor service {}", profile.service_uuid);

        if !self.config.settle_delay.is_zero() {
            debug!("Waiting {:?} for device to settle", self.config.settle_delay);
            time::sleep(self.config.settle_delay).await;
        }

        self.enable_notifications(device_id, &profile).await
    }

    /// Enable notifications on data characteristic with retry logic
    async fn enable_notifications(
        &self,
        device_id: &str,
        profile: &GattProfile,
    ) -> Result<NotificationStream, EngineError> {
        info!("Enabling notifications...");

        let mut attempt = 1;
        loop {
            match self.platform.subscribe(device_id, profile).await {
                Ok(stream) => {
                    info!("Notifications enabled successfully");
                    return Ok(stream);
                }
                Err(e) if attempt < SUBSCRIBE_ATTEMPTS && !e.is_adapter_fault() => {
                    warn!("Notification subscription attempt {} failed: {}", attempt, e);
                    time::sleep(SUBSCRIBE_RETRY_DELAY).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("Failed to enable notifications after {} attempts", attempt);
                    return Err(e.into());
                }
            }
        }
    }

    async fn release_link(&self, device_id: &str) {
        if let Err(e) = self.platform.disconnect(device_id).await {
            warn!("Best-effort disconnect of {} failed: {}", device_id, e);
        }
    }

    /// Send a log message
    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self
            .event_sender
            .send(AppEvent::Log(StatusMessage::new(message, severity)));
    }
}
