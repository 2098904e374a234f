//! In-memory [`BlePlatform`] used by the test-suite and by `--simulate`.
//!
//! Every call is journaled so tests can assert ordering. Failures can be
//! injected per operation and the connect step can be held open.

use crate::domain::models::DeviceDescriptor;
use crate::infrastructure::bluetooth::error::PlatformError;
use crate::infrastructure::bluetooth::platform::{
    AdvertisementStream, BlePlatform, NotificationStream, PlatformResult,
};
use crate::infrastructure::bluetooth::protocol::{GattProfile, KINETIC_V1_SERVICE_UUID};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    EnsureReady,
    StartScan,
    StopScan,
    Connect,
    Discover,
    Subscribe,
    Unsubscribe,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    EnsureReady,
    StartScan,
    StopScan,
    Connect(String),
    Discover(String),
    Subscribe(String),
    Unsubscribe(String),
    Disconnect(String),
    Shutdown,
}

#[derive(Default)]
struct FakeState {
    advertised: Vec<DeviceDescriptor>,
    scan_tx: Option<mpsc::UnboundedSender<DeviceDescriptor>>,
    notify_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    on_subscribe: Vec<Vec<u8>>,
    failures: HashMap<FakeOp, PlatformError>,
    calls: Vec<FakeCall>,
    connect_gate: Option<Arc<Notify>>,
    synthetic: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct FakePlatform {
    state: Arc<Mutex<FakeState>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fake sensor that streams generated motion data once subscribed.
    pub fn simulated(period: Duration) -> Self {
        let fake = Self::new();
        fake.advertise(
            DeviceDescriptor::new("SIM:00:00:00:00:01")
                .with_name("ESP32C3_MPU6050")
                .with_service(Uuid::parse_str(KINETIC_V1_SERVICE_UUID).unwrap_or_default())
                .with_rssi(-48),
        );
        fake.lock().synthetic = Some(period);
        fake
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a device; it is delivered to a running scan immediately.
    pub fn advertise(&self, device: DeviceDescriptor) {
        let mut state = self.lock();
        if let Some(tx) = &state.scan_tx {
            let _ = tx.send(device.clone());
        }
        state.advertised.push(device);
    }

    pub fn fail(&self, op: FakeOp, error: PlatformError) {
        self.lock().failures.insert(op, error);
    }

    pub fn clear_failure(&self, op: FakeOp) {
        self.lock().failures.remove(&op);
    }

    /// Park every `connect` call until [`release_connect`](Self::release_connect).
    pub fn hold_connects(&self) {
        self.lock().connect_gate = Some(Arc::new(Notify::new()));
    }

    pub fn release_connect(&self) {
        if let Some(gate) = &self.lock().connect_gate {
            gate.notify_one();
        }
    }

    /// Deliver one notification value. Returns `false` without a subscriber.
    pub fn notify(&self, payload: impl Into<Vec<u8>>) -> bool {
        match &self.lock().notify_tx {
            Some(tx) => tx.send(payload.into()).is_ok(),
            None => false,
        }
    }

    /// Queue a value the device sends as soon as it is subscribed.
    pub fn notify_on_subscribe(&self, payload: impl Into<Vec<u8>>) {
        self.lock().on_subscribe.push(payload.into());
    }

    /// Simulate the device going out of range.
    pub fn drop_link(&self) {
        self.lock().notify_tx = None;
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn record(&self, call: FakeCall, op: Option<FakeOp>) -> PlatformResult<()> {
        let mut state = self.lock();
        state.calls.push(call);
        match op.and_then(|op| state.failures.get(&op)) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BlePlatform for FakePlatform {
    async fn ensure_ready(&self) -> PlatformResult<()> {
        self.record(FakeCall::EnsureReady, Some(FakeOp::EnsureReady))
    }

    async fn start_scan(&self) -> PlatformResult<AdvertisementStream> {
        self.record(FakeCall::StartScan, Some(FakeOp::StartScan))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        for device in &state.advertised {
            let _ = tx.send(device.clone());
        }
        state.scan_tx = Some(tx);

        Ok(receiver_stream(rx))
    }

    async fn stop_scan(&self) -> PlatformResult<()> {
        self.lock().scan_tx = None;
        self.record(FakeCall::StopScan, Some(FakeOp::StopScan))
    }

    async fn connect(&self, device_id: &str) -> PlatformResult<()> {
        self.record(FakeCall::Connect(device_id.to_string()), Some(FakeOp::Connect))?;

        let gate = self.lock().connect_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(())
    }

    async fn discover(&self, device_id: &str, _profile: &GattProfile) -> PlatformResult<()> {
        self.record(FakeCall::Discover(device_id.to_string()), Some(FakeOp::Discover))
    }

    async fn subscribe(
        &self,
        device_id: &str,
        _profile: &GattProfile,
    ) -> PlatformResult<NotificationStream> {
        self.record(FakeCall::Subscribe(device_id.to_string()), Some(FakeOp::Subscribe))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let synthetic = {
            let mut state = self.lock();
            for payload in state.on_subscribe.drain(..) {
                let _ = tx.send(payload);
            }
            state.notify_tx = Some(tx.clone());
            state.synthetic
        };
        if let Some(period) = synthetic {
            tokio::spawn(generate_motion(tx, period));
        }

        Ok(receiver_stream(rx))
    }

    async fn unsubscribe(&self, device_id: &str, _characteristic: &Uuid) -> PlatformResult<()> {
        self.lock().notify_tx = None;
        self.record(
            FakeCall::Unsubscribe(device_id.to_string()),
            Some(FakeOp::Unsubscribe),
        )
    }

    async fn disconnect(&self, device_id: &str) -> PlatformResult<()> {
        self.lock().notify_tx = None;
        self.record(
            FakeCall::Disconnect(device_id.to_string()),
            Some(FakeOp::Disconnect),
        )
    }

    async fn shutdown(&self) -> PlatformResult<()> {
        self.record(FakeCall::Shutdown, None)
    }
}

fn receiver_stream<T: Send + 'static>(
    rx: mpsc::UnboundedReceiver<T>,
) -> futures::stream::BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

/// Emit slowly rotating readings split into MTU-sized chunks.
async fn generate_motion(tx: mpsc::UnboundedSender<Vec<u8>>, period: Duration) {
    const CHUNK: usize = 20;
    let mut ticker = tokio::time::interval(period);
    let mut step: u64 = 0;

    loop {
        ticker.tick().await;
        let t = step as f64 * period.as_secs_f64();
        let line = format!(
            "{},{},{},{},{},{},",
            ((t * 1.3).sin() * 8192.0) as i32,
            ((t * 0.7).cos() * 8192.0) as i32,
            16384 + ((t * 2.1).sin() * 512.0) as i32,
            ((t * 0.9).cos() * 131.0 * 45.0) as i32,
            ((t * 1.7).sin() * 131.0 * 30.0) as i32,
            ((t * 0.4).sin() * 131.0 * 10.0) as i32,
        );
        for chunk in line.as_bytes().chunks(CHUNK) {
            if tx.send(chunk.to_vec()).is_err() {
                debug!("Synthetic stream stopped after {} readings", step);
                return;
            }
        }
        step += 1;
    }
}
