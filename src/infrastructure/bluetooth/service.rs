//! Sensor Service Module
//!
//! Owns the connection state machine. All state lives in one task; consumer
//! calls arrive as commands through a [`SensorHandle`], and scan results,
//! notifications and timers arrive as [`SessionEvent`]s on an internal
//! mailbox. Nothing else mutates session state.
//!
//! Events produced by tasks from an earlier connection are tagged with that
//! connection's epoch and dropped once the session has moved on.

use crate::domain::models::{
    AppEvent, ConnectionState, DeviceDescriptor, MessageSeverity, SensorSample, StatusMessage,
};
use crate::domain::reassembler::{FrameReassembler, ImuScale, DEFAULT_BUFFER_CEILING};
use crate::domain::registry::{DeviceRegistry, Observation};
use crate::domain::settings::Settings;
use crate::domain::watchdog::{
    Liveness, LivenessWatchdog, DEFAULT_STALE_THRESHOLD, DEFAULT_TICK_INTERVAL,
};
use crate::infrastructure::bluetooth::connection::{
    BleConnection, ConnectionConfig, ConnectionResult, Subscription,
};
use crate::infrastructure::bluetooth::error::{EngineError, PlatformError};
use crate::infrastructure::bluetooth::platform::{
    BlePlatform, NotificationStream, PlatformResult,
};
use crate::infrastructure::bluetooth::protocol::{self, DeviceFilter, GattProfile};
use crate::infrastructure::bluetooth::scanner::BleScanner;
use crate::infrastructure::bluetooth::timers::TimerHandle;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

/// Everything the session needs, resolved up front from [`Settings`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub filter: DeviceFilter,
    pub connection: ConnectionConfig,
    pub scan_timeout: Duration,
    pub disconnect_step_timeout: Duration,
    pub scale: ImuScale,
    pub buffer_ceiling: usize,
    pub stale_threshold: Duration,
    pub watchdog_tick: Duration,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Device remembered from an earlier run, used by `reconnect`.
    pub last_device: Option<String>,
}

impl SessionConfig {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let ble = &settings.ble;
        let stream = &settings.stream;
        let reconnect = &settings.reconnect;
        let profile = GattProfile::from_settings(ble)?;

        Ok(Self {
            filter: DeviceFilter::new(
                &ble.device_name_patterns,
                profile.service_uuid,
                ble.show_all_devices,
            ),
            connection: ConnectionConfig {
                profile,
                settle_delay: Duration::from_millis(ble.settle_delay_ms),
                connect_timeout: ble.connect_timeout_ms.map(Duration::from_millis),
            },
            scan_timeout: Duration::from_millis(ble.scan_timeout_ms),
            disconnect_step_timeout: Duration::from_millis(ble.disconnect_step_timeout_ms),
            scale: ImuScale {
                accel_lsb_per_g: stream.accel_lsb_per_g,
                gyro_lsb_per_dps: stream.gyro_lsb_per_dps,
            },
            buffer_ceiling: stream.buffer_ceiling,
            stale_threshold: Duration::from_millis(stream.stale_threshold_ms),
            watchdog_tick: Duration::from_millis(stream.watchdog_tick_ms.max(1)),
            auto_reconnect: reconnect.auto_reconnect,
            reconnect_delay: Duration::from_millis(reconnect.reconnect_delay_ms),
            max_reconnect_attempts: reconnect.max_attempts,
            last_device: settings.last_connected_device.clone(),
        })
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default()).unwrap_or_else(|_| Self {
            filter: DeviceFilter::new(
                &[],
                GattProfile::for_revision(Default::default()).service_uuid,
                false,
            ),
            connection: ConnectionConfig::default(),
            scan_timeout: Duration::from_secs(10),
            disconnect_step_timeout: Duration::from_secs(5),
            scale: ImuScale::default(),
            buffer_ceiling: DEFAULT_BUFFER_CEILING,
            stale_threshold: DEFAULT_STALE_THRESHOLD,
            watchdog_tick: DEFAULT_TICK_INTERVAL,
            auto_reconnect: false,
            reconnect_delay: Duration::from_secs(2),
            max_reconnect_attempts: 3,
            last_device: None,
        })
    }
}

/// Messages posted into the session by its own tasks and timers.
#[derive(Debug)]
pub enum SessionEvent {
    Advertisement {
        scan_id: u64,
        device: DeviceDescriptor,
    },
    ScanEnded {
        scan_id: u64,
    },
    ScanTimeout {
        scan_id: u64,
    },
    LinkUp {
        epoch: u64,
    },
    ConnectFinished {
        epoch: u64,
        result: Result<ConnectionResult, EngineError>,
    },
    Notification {
        epoch: u64,
        payload: Vec<u8>,
    },
    StreamEnded {
        epoch: u64,
    },
    WatchdogTick {
        epoch: u64,
    },
    ReconnectDue,
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Scan(Reply<Result<(), EngineError>>),
    StopScan(Reply<Result<(), EngineError>>),
    WaitForScan(Reply<Vec<DeviceDescriptor>>),
    Connect(DeviceDescriptor, Reply<Result<DeviceDescriptor, EngineError>>),
    ConnectById(String, Reply<Result<DeviceDescriptor, EngineError>>),
    Disconnect(Reply<()>),
    Reconnect(Reply<Result<Option<DeviceDescriptor>, EngineError>>),
    Shutdown(Reply<()>),
}

/// Who is waiting on a connection attempt.
enum ConnectWaiter {
    Connect(Reply<Result<DeviceDescriptor, EngineError>>),
    Reconnect(Reply<Result<Option<DeviceDescriptor>, EngineError>>),
    Auto,
}

impl ConnectWaiter {
    fn resolve(self, result: Result<DeviceDescriptor, EngineError>) {
        match self {
            Self::Connect(reply) => {
                let _ = reply.send(result);
            }
            Self::Reconnect(reply) => {
                let _ = reply.send(result.map(Some));
            }
            Self::Auto => {}
        }
    }

    fn is_auto(&self) -> bool {
        matches!(self, Self::Auto)
    }
}

struct PendingConnect {
    epoch: u64,
    device: DeviceDescriptor,
    waiter: ConnectWaiter,
    task: JoinHandle<()>,
}

/// Cloneable front door to a running [`SensorService`].
#[derive(Clone)]
pub struct SensorHandle {
    commands: mpsc::UnboundedSender<Command>,
    sample_rx: watch::Receiver<SensorSample>,
    state_rx: watch::Receiver<ConnectionState>,
    devices_rx: watch::Receiver<Vec<DeviceDescriptor>>,
}

impl SensorHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| EngineError::EngineStopped)?;
        response.await.map_err(|_| EngineError::EngineStopped)
    }

    /// Reset the device list and start discovering sensors.
    pub async fn scan(&self) -> Result<(), EngineError> {
        self.request(Command::Scan).await?
    }

    pub async fn stop_scan(&self) -> Result<(), EngineError> {
        self.request(Command::StopScan).await?
    }

    /// Resolves with the candidate list once the current scan ends.
    pub async fn wait_for_scan(&self) -> Result<Vec<DeviceDescriptor>, EngineError> {
        self.request(Command::WaitForScan).await
    }

    pub async fn connect(&self, device: DeviceDescriptor) -> Result<DeviceDescriptor, EngineError> {
        self.request(|reply| Command::Connect(device, reply)).await?
    }

    /// Connect to a device by platform id, whether or not it was scanned.
    pub async fn connect_by_id(
        &self,
        id: impl Into<String>,
    ) -> Result<DeviceDescriptor, EngineError> {
        let id = id.into();
        self.request(|reply| Command::ConnectById(id, reply)).await?
    }

    /// Always succeeds from the caller's point of view.
    pub async fn disconnect(&self) {
        let _ = self.request(Command::Disconnect).await;
    }

    /// Connect again to the most recent device. `Ok(None)` if none is known.
    pub async fn reconnect(&self) -> Result<Option<DeviceDescriptor>, EngineError> {
        self.request(Command::Reconnect).await?
    }

    /// Latest published sample, the zeroed sentinel before any data.
    pub fn current_sample(&self) -> SensorSample {
        self.sample_rx.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.devices_rx.borrow().clone()
    }

    pub fn subscribe_samples(&self) -> watch::Receiver<SensorSample> {
        self.sample_rx.clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Stop the session. Waits for an in-flight connect to resolve first.
    pub async fn shutdown(&self) {
        let _ = self.request(Command::Shutdown).await;
    }
}

/// Main service coordinating all BLE operations
pub struct SensorService<P: BlePlatform> {
    platform: Arc<P>,
    config: SessionConfig,

    state: ConnectionState,
    registry: DeviceRegistry,
    scanner: BleScanner<P>,
    scan_waiters: Vec<Reply<Vec<DeviceDescriptor>>>,

    // Per-connection resources
    epoch: u64,
    pending: Option<PendingConnect>,
    subscription: Option<Subscription>,
    current_device: Option<DeviceDescriptor>,
    reassembler: FrameReassembler,
    decode_failures: u64,
    watchdog: Option<LivenessWatchdog>,
    watchdog_timer: Option<TimerHandle>,

    // Reconnection
    last_device: Option<DeviceDescriptor>,
    reconnect_timer: Option<TimerHandle>,
    reconnect_attempts: u32,

    deferred_shutdown: Option<Reply<()>>,
    stopped: bool,

    commands: mpsc::UnboundedReceiver<Command>,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    sample_tx: watch::Sender<SensorSample>,
    state_tx: watch::Sender<ConnectionState>,
    devices_tx: watch::Sender<Vec<DeviceDescriptor>>,
}

impl<P: BlePlatform> SensorService<P> {
    /// Start a session on the current runtime.
    pub fn spawn(
        platform: Arc<P>,
        config: SessionConfig,
    ) -> (SensorHandle, mpsc::UnboundedReceiver<AppEvent>) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (event_sender, event_rx) = mpsc::unbounded_channel();
        let (sample_tx, sample_rx) = watch::channel(SensorSample::default());
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (devices_tx, devices_rx) = watch::channel(Vec::new());

        let last_device = config.last_device.clone().map(DeviceDescriptor::new);
        let service = Self {
            scanner: BleScanner::new(platform.clone(), session_tx.clone(), event_sender.clone()),
            reassembler: FrameReassembler::new(config.scale, config.buffer_ceiling),
            decode_failures: 0,
            platform,
            config,
            state: ConnectionState::Idle,
            registry: DeviceRegistry::new(),
            scan_waiters: Vec::new(),
            epoch: 0,
            pending: None,
            subscription: None,
            current_device: None,
            watchdog: None,
            watchdog_timer: None,
            last_device,
            reconnect_timer: None,
            reconnect_attempts: 0,
            deferred_shutdown: None,
            stopped: false,
            commands,
            session_tx,
            session_rx,
            event_sender,
            sample_tx,
            state_tx,
            devices_tx,
        };
        tokio::spawn(service.run());

        let handle = SensorHandle {
            commands: command_tx,
            sample_rx,
            state_rx,
            devices_rx,
        };
        (handle, event_rx)
    }

    async fn run(mut self) {
        info!("Sensor session started");
        let mut commands_open = true;

        while !self.stopped {
            tokio::select! {
                biased;
                Some(event) = self.session_rx.recv() => self.handle_event(event).await,
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All handles dropped, shutting down");
                        commands_open = false;
                        self.request_shutdown(None).await;
                    }
                },
            }
        }

        info!("Sensor session stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Scan(reply) => {
                let result = self.start_scan().await;
                let _ = reply.send(result);
            }
            Command::StopScan(reply) => {
                self.stop_scan().await;
                let _ = reply.send(Ok(()));
            }
            Command::WaitForScan(reply) => {
                if self.scanner.is_scanning() {
                    self.scan_waiters.push(reply);
                } else {
                    let _ = reply.send(self.registry.devices().to_vec());
                }
            }
            Command::Connect(device, reply) => {
                self.cancel_reconnect();
                self.begin_connect(device, ConnectWaiter::Connect(reply));
            }
            Command::ConnectById(id, reply) => {
                self.cancel_reconnect();
                let device = self
                    .registry
                    .get(&id)
                    .cloned()
                    .unwrap_or_else(|| DeviceDescriptor::new(id));
                self.begin_connect(device, ConnectWaiter::Connect(reply));
            }
            Command::Disconnect(reply) => {
                self.cancel_reconnect();
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::Reconnect(reply) => self.reconnect(reply).await,
            Command::Shutdown(reply) => self.request_shutdown(Some(reply)).await,
        }
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Advertisement { scan_id, device } => {
                if self.scanner.is_current(scan_id) {
                    self.on_advertisement(device);
                }
            }
            SessionEvent::ScanEnded { scan_id } | SessionEvent::ScanTimeout { scan_id } => {
                if self.scanner.is_current(scan_id) {
                    info!("Scan complete: {} device(s) found", self.registry.len());
                    self.stop_scan().await;
                }
            }
            SessionEvent::LinkUp { epoch } => {
                if self.is_pending(epoch) {
                    self.stop_scanner().await;
                    self.set_state(ConnectionState::Connected);
                }
            }
            SessionEvent::ConnectFinished { epoch, result } => {
                self.on_connect_finished(epoch, result).await;
            }
            SessionEvent::Notification { epoch, payload } => {
                if epoch == self.epoch && self.state == ConnectionState::Streaming {
                    self.on_notification(&payload);
                }
            }
            SessionEvent::StreamEnded { epoch } => {
                if epoch == self.epoch && self.state.has_link() {
                    self.on_link_lost().await;
                }
            }
            SessionEvent::WatchdogTick { epoch } => {
                if epoch == self.epoch {
                    self.on_watchdog_tick();
                }
            }
            SessionEvent::ReconnectDue => {
                if self.reconnect_timer.take().is_some() {
                    self.on_reconnect_due();
                }
            }
        }
    }

    // ---- Scanning -------------------------------------------------------

    async fn start_scan(&mut self) -> Result<(), EngineError> {
        match self.state {
            ConnectionState::Scanning => return Ok(()),
            state if !state.accepts_scan() => {
                return Err(EngineError::InvalidState {
                    operation: "scan",
                    state,
                })
            }
            _ => {}
        }
        self.cancel_reconnect();

        if let Err(e) = self.platform.ensure_ready().await {
            return Err(self.platform_failure("Bluetooth unavailable", e));
        }

        self.registry.reset();
        self.devices_tx.send_replace(Vec::new());

        if let Err(e) = self.scanner.start(self.config.scan_timeout).await {
            return Err(self.platform_failure("Failed to start scan", e));
        }
        self.set_state(ConnectionState::Scanning);
        Ok(())
    }

    /// End the scan and resolve everyone waiting on it.
    async fn stop_scan(&mut self) {
        self.stop_scanner().await;
        if self.state == ConnectionState::Scanning {
            self.set_state(ConnectionState::Idle);
        }
    }

    async fn stop_scanner(&mut self) {
        if let Err(e) = self.scanner.stop().await {
            warn!("Failed to stop scan: {}", e);
        }
        let devices = self.registry.devices().to_vec();
        for waiter in self.scan_waiters.drain(..) {
            let _ = waiter.send(devices.clone());
        }
    }

    fn on_advertisement(&mut self, device: DeviceDescriptor) {
        if !self.config.filter.is_target(&device) {
            return;
        }

        let observation = self.registry.observe(device.clone());
        self.devices_tx.send_replace(self.registry.devices().to_vec());
        if observation == Observation::Appended {
            info!(
                "Found sensor: {} ({}) signal {}",
                device.display_name(),
                device.id,
                device.signal_strength()
            );
            let _ = self.event_sender.send(AppEvent::DeviceFound(device));
        }
    }

    // ---- Connecting -----------------------------------------------------

    fn begin_connect(&mut self, device: DeviceDescriptor, waiter: ConnectWaiter) {
        if self.pending.is_some() {
            warn!("Connect to {} rejected: attempt already in flight", device.id);
            waiter.resolve(Err(EngineError::ConnectInProgress));
            return;
        }
        if !self.state.accepts_connect() {
            waiter.resolve(Err(EngineError::InvalidState {
                operation: "connect",
                state: self.state,
            }));
            return;
        }

        self.epoch += 1;
        let epoch = self.epoch;
        let connection = BleConnection::new(
            self.platform.clone(),
            self.session_tx.clone(),
            self.event_sender.clone(),
            self.config.connection.clone(),
        );
        let tx = self.session_tx.clone();
        let target = device.clone();
        let task = tokio::spawn(async move {
            let result = connection.connect(target, epoch).await;
            let _ = tx.send(SessionEvent::ConnectFinished { epoch, result });
        });

        self.pending = Some(PendingConnect {
            epoch,
            device,
            waiter,
            task,
        });
        self.set_state(ConnectionState::Connecting);
    }

    fn is_pending(&self, epoch: u64) -> bool {
        self.pending.as_ref().is_some_and(|p| p.epoch == epoch)
    }

    async fn on_connect_finished(
        &mut self,
        epoch: u64,
        result: Result<ConnectionResult, EngineError>,
    ) {
        if !self.is_pending(epoch) {
            // Only a cancelled attempt can finish unowned, and cancelling
            // already released its link.
            if let Ok(stale) = result {
                debug!("Dropping notifications of cancelled connection to {}", stale.device.id);
            }
            return;
        }
        let Some(pending) = self.pending.take() else {
            return;
        };
        let auto = pending.waiter.is_auto();

        match result {
            Ok(ConnectionResult {
                device,
                notifications,
            }) => {
                self.stop_scanner().await;
                self.start_streaming(device.clone(), notifications);
                pending.waiter.resolve(Ok(device));
            }
            Err(e) => {
                self.stop_scanner().await;
                error!("Connection to {} failed: {}", pending.device.id, e);
                self.send_log(format!("Connection failed: {}", e), MessageSeverity::Error);
                let next = match &e {
                    EngineError::Platform(p) if p.is_adapter_fault() => ConnectionState::Error,
                    _ => ConnectionState::Idle,
                };
                self.set_state(next);
                pending.waiter.resolve(Err(e));
                if auto {
                    self.schedule_reconnect();
                }
            }
        }

        self.resume_deferred_shutdown().await;
    }

    fn start_streaming(&mut self, device: DeviceDescriptor, notifications: NotificationStream) {
        self.current_device = Some(device.clone());
        self.last_device = Some(device.clone());
        self.reconnect_attempts = 0;
        self.reassembler = FrameReassembler::new(self.config.scale, self.config.buffer_ceiling);
        self.decode_failures = 0;

        self.watchdog = Some(LivenessWatchdog::new(
            self.config.stale_threshold,
            Instant::now(),
        ));
        let tx = self.session_tx.clone();
        let epoch = self.epoch;
        self.watchdog_timer = Some(TimerHandle::every(self.config.watchdog_tick, move || {
            let tx = tx.clone();
            async move { tx.send(SessionEvent::WatchdogTick { epoch }).is_ok() }
        }));

        // Values notified while the attempt was finishing are still queued
        // in the stream and are forwarded first.
        self.subscription = Some(Subscription::forward(
            device.id.clone(),
            self.config.connection.profile.data_char_uuid,
            notifications,
            epoch,
            self.session_tx.clone(),
        ));

        info!("Streaming from {} ({})", device.display_name(), device.id);
        self.set_state(ConnectionState::Streaming);
        let _ = self.event_sender.send(AppEvent::Connected(device));
    }

    // ---- Streaming ------------------------------------------------------

    fn on_notification(&mut self, payload: &[u8]) {
        let text = match protocol::decode_notification(payload) {
            Ok(text) => text,
            Err(e) => {
                self.decode_failures += 1;
                warn!("Dropping notification: {}", e);
                self.send_log(format!("Undecodable data: {}", e), MessageSeverity::Warning);
                return;
            }
        };

        for sample in self.reassembler.push(&text, Utc::now()) {
            if let Some(watchdog) = self.watchdog.as_mut() {
                if watchdog.record_arrival(Instant::now()) {
                    info!("Data flowing again");
                    let _ = self.event_sender.send(AppEvent::StaleChanged(false));
                }
            }
            self.sample_tx.send_replace(sample.clone());
            let _ = self.event_sender.send(AppEvent::Sample(sample));
        }
    }

    fn on_watchdog_tick(&mut self) {
        let Some(watchdog) = self.watchdog.as_mut() else {
            return;
        };
        if watchdog.check(Instant::now()) == Liveness::BecameStale {
            warn!(
                "No data for more than {:?}, marking sample stale",
                watchdog.threshold()
            );
            self.sample_tx.send_modify(|sample| sample.is_stale = true);
            let _ = self.event_sender.send(AppEvent::StaleChanged(true));
        }
    }

    async fn on_link_lost(&mut self) {
        let device = self.current_device.clone();
        warn!("Connection lost");
        self.send_log("Connection lost", MessageSeverity::Warning);

        self.teardown().await;

        if let Some(device) = device {
            let _ = self.event_sender.send(AppEvent::ConnectionLost(device));
        }
        if self.config.auto_reconnect {
            self.reconnect_attempts = 0;
            self.schedule_reconnect();
        }
    }

    // ---- Disconnecting --------------------------------------------------

    async fn disconnect(&mut self) {
        // Connected only means the link is up; setup may still be running.
        if self.pending.is_some() {
            self.cancel_connect().await;
            return;
        }
        match self.state {
            ConnectionState::Connected | ConnectionState::Streaming => self.teardown().await,
            ConnectionState::Scanning => self.stop_scan().await,
            ConnectionState::Error => self.set_state(ConnectionState::Idle),
            ConnectionState::Idle
            | ConnectionState::Connecting
            | ConnectionState::Disconnecting => {
                debug!("Disconnect with no active device, nothing to do");
            }
        }
    }

    async fn cancel_connect(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        info!("Cancelling connection attempt to {}", pending.device.id);
        self.set_state(ConnectionState::Disconnecting);
        self.epoch += 1;
        pending.task.abort();
        pending.waiter.resolve(Err(EngineError::Cancelled));

        self.stop_scanner().await;
        let platform = self.platform.clone();
        self.cleanup_step("release platform connection", platform.disconnect(&pending.device.id))
            .await;
        self.reassembler.clear();
        self.set_state(ConnectionState::Idle);

        self.resume_deferred_shutdown().await;
    }

    /// Stop watchdog, remove subscription, release platform connection,
    /// clear published sample, clear buffer. Every step runs even if an
    /// earlier one failed.
    async fn teardown(&mut self) {
        self.set_state(ConnectionState::Disconnecting);
        self.epoch += 1;

        self.watchdog_timer = None;
        self.watchdog = None;

        let platform = self.platform.clone();
        if let Some(subscription) = self.subscription.take() {
            self.cleanup_step("remove subscription", subscription.release(&*platform))
                .await;
        }

        if let Some(device) = self.current_device.take() {
            self.cleanup_step("release platform connection", platform.disconnect(&device.id))
                .await;
            info!("Disconnected from {}", device.display_name());
            self.send_log("Disconnected from device", MessageSeverity::Info);
        }

        self.sample_tx.send_replace(SensorSample::default());

        let stats = self.reassembler.stats();
        info!(
            "Stream closed: {} fragments, {} readings, {} skipped tokens, {} overflow resets, {} undecodable",
            stats.fragments,
            stats.readings,
            stats.skipped_tokens,
            stats.overflow_resets,
            self.decode_failures
        );
        self.reassembler.clear();

        self.set_state(ConnectionState::Idle);
    }

    async fn cleanup_step(
        &self,
        step: &str,
        operation: impl Future<Output = PlatformResult<()>>,
    ) {
        match time::timeout(self.config.disconnect_step_timeout, operation).await {
            Ok(Ok(())) => debug!("Cleanup step '{}' done", step),
            Ok(Err(e)) => warn!("Cleanup step '{}' failed: {}", step, e),
            Err(_) => warn!(
                "Cleanup step '{}' timed out after {:?}",
                step, self.config.disconnect_step_timeout
            ),
        }
    }

    // ---- Reconnecting ---------------------------------------------------

    async fn reconnect(&mut self, reply: Reply<Result<Option<DeviceDescriptor>, EngineError>>) {
        self.cancel_reconnect();
        if self.pending.is_some() {
            let _ = reply.send(Err(EngineError::ConnectInProgress));
            return;
        }
        let Some(device) = self.last_device.clone() else {
            info!("Reconnect requested but no device is known");
            let _ = reply.send(Ok(None));
            return;
        };

        if self.state.has_link() {
            self.teardown().await;
        }
        info!("Reconnecting to {}", device.id);
        self.begin_connect(device, ConnectWaiter::Reconnect(reply));
    }

    fn schedule_reconnect(&mut self) {
        if self.last_device.is_none() {
            return;
        }
        if self.reconnect_attempts >= self.config.max_reconnect_attempts {
            warn!(
                "Giving up after {} reconnect attempt(s)",
                self.reconnect_attempts
            );
            self.send_log("Auto-reconnect gave up", MessageSeverity::Warning);
            return;
        }

        self.reconnect_attempts += 1;
        info!(
            "Reconnect attempt {}/{} in {:?}",
            self.reconnect_attempts, self.config.max_reconnect_attempts, self.config.reconnect_delay
        );
        let tx = self.session_tx.clone();
        self.reconnect_timer = Some(TimerHandle::after(self.config.reconnect_delay, move || {
            async move {
                let _ = tx.send(SessionEvent::ReconnectDue);
            }
        }));
    }

    fn on_reconnect_due(&mut self) {
        if !self.state.accepts_connect() {
            return;
        }
        if let Some(device) = self.last_device.clone() {
            self.begin_connect(device, ConnectWaiter::Auto);
        }
    }

    fn cancel_reconnect(&mut self) {
        if self.reconnect_timer.take().is_some() {
            debug!("Pending auto-reconnect cancelled");
        }
    }

    // ---- Shutdown -------------------------------------------------------

    async fn request_shutdown(&mut self, reply: Option<Reply<()>>) {
        if self.pending.is_some() {
            info!("Shutdown deferred until the connection attempt resolves");
            if let Some(previous) = self.deferred_shutdown.replace(reply_or_noop(reply)) {
                let _ = previous.send(());
            }
            return;
        }
        self.finish_shutdown(reply).await;
    }

    async fn resume_deferred_shutdown(&mut self) {
        if let Some(reply) = self.deferred_shutdown.take() {
            self.finish_shutdown(Some(reply)).await;
        }
    }

    async fn finish_shutdown(&mut self, reply: Option<Reply<()>>) {
        self.cancel_reconnect();
        self.stop_scan().await;
        if self.state.has_link() {
            self.teardown().await;
        }
        if let Err(e) = self.platform.shutdown().await {
            warn!("Platform shutdown failed: {}", e);
        }
        self.stopped = true;
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    // ---- Helpers --------------------------------------------------------

    fn platform_failure(&mut self, context: &str, e: PlatformError) -> EngineError {
        error!("{}: {}", context, e);
        self.send_log(format!("{}: {}", context, e), MessageSeverity::Error);
        if e.is_adapter_fault() {
            self.set_state(ConnectionState::Error);
        }
        EngineError::Platform(e)
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!("State {} -> {}", self.state, state);
        self.state = state;
        self.state_tx.send_replace(state);
        let _ = self.event_sender.send(AppEvent::StateChanged(state));
    }

    /// Send a log message
    fn send_log(&self, message: impl Into<String>, severity: MessageSeverity) {
        let _ = self
            .event_sender
            .send(AppEvent::Log(StatusMessage::new(message, severity)));
    }
}

/// A deferred shutdown from a dropped handle has nobody to answer.
fn reply_or_noop(reply: Option<Reply<()>>) -> Reply<()> {
    reply.unwrap_or_else(|| oneshot::channel().0)
}
