//! BLE Scanner Module
//!
//! Handles device discovery for the session. Advertisements are forwarded
//! into the session mailbox tagged with a scan id, and a timer ends each
//! scan after a fixed wall-clock timeout.

use crate::domain::models::{AppEvent, MessageSeverity, StatusMessage};
use crate::infrastructure::bluetooth::platform::{BlePlatform, PlatformResult};
use crate::infrastructure::bluetooth::service::SessionEvent;
use crate::infrastructure::bluetooth::timers::TimerHandle;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct ActiveScan {
    id: u64,
    forwarder: JoinHandle<()>,
    _timeout: TimerHandle,
}

/// BLE Scanner for discovering sensors
pub struct BleScanner<P: BlePlatform> {
    platform: Arc<P>,
    active: Option<ActiveScan>,
    next_id: u64,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl<P: BlePlatform> BleScanner<P> {
    pub fn new(
        platform: Arc<P>,
        session_tx: mpsc::UnboundedSender<SessionEvent>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            platform,
            active: None,
            next_id: 0,
            session_tx,
            event_sender,
        }
    }

    /// Start a scan that ends itself after `timeout`. Returns the scan id.
    pub async fn start(&mut self, timeout: Duration) -> PlatformResult<u64> {
        // Stop any existing scan
        if let Err(e) = self.stop().await {
            warn!("Failed to stop previous scan: {}", e);
        }

        info!("Starting BLE scan (timeout: {:?})", timeout);
        let _ = self.event_sender.send(AppEvent::Log(StatusMessage::new(
            "Scanning for motion sensors...",
            MessageSeverity::Info,
        )));

        let mut advertisements = self.platform.start_scan().await?;
        self.next_id += 1;
        let id = self.next_id;

        let tx = self.session_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(device) = advertisements.next().await {
                if tx
                    .send(SessionEvent::Advertisement { scan_id: id, device })
                    .is_err()
                {
                    return;
                }
            }
            let _ = tx.send(SessionEvent::ScanEnded { scan_id: id });
        });

        let tx = self.session_tx.clone();
        let timeout = TimerHandle::after(timeout, move || async move {
            let _ = tx.send(SessionEvent::ScanTimeout { scan_id: id });
        });

        self.active = Some(ActiveScan {
            id,
            forwarder,
            _timeout: timeout,
        });
        Ok(id)
    }

    /// Stop scanning
    pub async fn stop(&mut self) -> PlatformResult<()> {
        if let Some(active) = self.active.take() {
            info!("Stopping BLE scan...");
            active.forwarder.abort();
            let _ = self.event_sender.send(AppEvent::Log(StatusMessage::new(
                "Scan stopped.",
                MessageSeverity::Info,
            )));
            self.platform.stop_scan().await?;
        }
        Ok(())
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.active.is_some()
    }

    /// Whether `scan_id` names the scan that is running right now.
    pub fn is_current(&self, scan_id: u64) -> bool {
        self.active.as_ref().is_some_and(|a| a.id == scan_id)
    }
}

impl<P: BlePlatform> Drop for BleScanner<P> {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.forwarder.abort();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let platform = self.platform.clone();
                runtime.spawn(async move {
                    if let Err(e) = platform.stop_scan().await {
                        debug!("Scan stop on drop failed: {}", e);
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::DeviceDescriptor;
    use crate::infrastructure::bluetooth::fake::{FakeCall, FakePlatform};

    #[tokio::test(start_paused = true)]
    async fn forwards_tagged_advertisements_then_times_out() {
        let fake = Arc::new(FakePlatform::new());
        fake.advertise(DeviceDescriptor::new("a"));
        let (session_tx, mut session_rx) = mpsc::unbounded_channel();
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let mut scanner = BleScanner::new(fake.clone(), session_tx, event_tx);

        let id = scanner.start(Duration::from_secs(5)).await.unwrap();
        assert!(scanner.is_current(id));

        match session_rx.recv().await.unwrap() {
            SessionEvent::Advertisement { scan_id, device } => {
                assert_eq!(scan_id, id);
                assert_eq!(device.id, "a");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match session_rx.recv().await.unwrap() {
            SessionEvent::ScanTimeout { scan_id } => assert_eq!(scan_id, id),
            other => panic!("unexpected event: {:?}", other),
        }

        scanner.stop().await.unwrap();
        assert!(!scanner.is_scanning());
        assert_eq!(fake.calls(), vec![FakeCall::StartScan, FakeCall::StopScan]);
    }

    #[tokio::test]
    async fn restart_replaces_scan_id() {
        let fake = Arc::new(FakePlatform::new());
        let (session_tx, _session_rx) = mpsc::unbounded_channel();
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let mut scanner = BleScanner::new(fake.clone(), session_tx, event_tx);

        let first = scanner.start(Duration::from_secs(5)).await.unwrap();
        let second = scanner.start(Duration::from_secs(5)).await.unwrap();
        assert!(!scanner.is_current(first));
        assert!(scanner.is_current(second));
        assert_eq!(
            fake.calls(),
            vec![FakeCall::StartScan, FakeCall::StopScan, FakeCall::StartScan]
        );
    }
}
