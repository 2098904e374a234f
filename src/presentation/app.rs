use crate::domain::models::{
    AppEvent, ConnectionState, DeviceDescriptor, MessageSeverity, SensorSample, StatusMessage,
};
use crate::domain::recorder::SessionRecorder;
use crate::domain::settings::SettingsService;
use crate::infrastructure::bluetooth::SensorHandle;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{error, info, warn};

/// Console front end: drives the session and renders its events.
pub struct SensorApp {
    // Services
    settings: SettingsService,
    sensor: SensorHandle,
    events: mpsc::UnboundedReceiver<AppEvent>,
    recorder: SessionRecorder,

    // State
    connection_state: ConnectionState,
    status_message: Option<StatusMessage>,
    link_lost: bool,
}

impl SensorApp {
    pub fn new(
        settings: SettingsService,
        sensor: SensorHandle,
        events: mpsc::UnboundedReceiver<AppEvent>,
    ) -> Self {
        Self {
            settings,
            sensor,
            events,
            recorder: SessionRecorder::new(),
            connection_state: ConnectionState::Idle,
            status_message: None,
            link_lost: false,
        }
    }

    /// Scan for the configured timeout and print every candidate.
    pub async fn scan(&mut self) -> Result<Vec<DeviceDescriptor>> {
        self.sensor.scan().await?;
        let devices = self.sensor.wait_for_scan().await?;
        self.drain_events();

        if devices.is_empty() {
            println!("No sensors found.");
        }
        for device in &devices {
            println!(
                "{:<24} {:<40} {}",
                device.display_name(),
                device.id,
                device.signal_strength()
            );
        }
        Ok(devices)
    }

    /// Connect, then print samples until the deadline, Ctrl-C or link loss.
    pub async fn stream(
        &mut self,
        device: Option<String>,
        seconds: Option<u64>,
        record: Option<&Path>,
    ) -> Result<()> {
        let remembered = self.settings.get().last_connected_device.clone();
        let connected = match device.or(remembered) {
            Some(id) => self.sensor.connect_by_id(id).await?,
            None => {
                let target = self.find_first_sensor().await?;
                self.sensor.connect(target).await?
            }
        };
        println!("Streaming from {} ({})", connected.display_name(), connected.id);

        if record.is_some() {
            self.recorder.start(Utc::now());
        }

        let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
        let until_deadline = async move {
            match deadline {
                Some(at) => time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(until_deadline);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Interrupted");
                    break;
                }
                _ = &mut until_deadline => break,
                event = self.events.recv() => match event {
                    Some(event) => self.process_event(event),
                    None => break,
                },
            }

            if self.link_lost && !self.settings.get().reconnect.auto_reconnect {
                warn!("Stopping stream after connection loss");
                break;
            }
        }

        self.sensor.disconnect().await;
        self.drain_events();

        if let Some(path) = record {
            self.recorder.stop(Utc::now());
            self.write_recording(path)?;
        }
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        self.sensor.shutdown().await;
        self.drain_events();
    }

    /// Scan until the first candidate shows up or the scan times out.
    async fn find_first_sensor(&mut self) -> Result<DeviceDescriptor> {
        self.sensor.scan().await?;
        let sensor = self.sensor.clone();
        let scan_done = sensor.wait_for_scan();
        tokio::pin!(scan_done);

        loop {
            tokio::select! {
                biased;
                event = self.events.recv() => match event {
                    Some(AppEvent::DeviceFound(device)) => {
                        self.sensor.stop_scan().await?;
                        return Ok(device);
                    }
                    Some(event) => self.process_event(event),
                    None => bail!("sensor session stopped"),
                },
                devices = &mut scan_done => {
                    return devices?
                        .into_iter()
                        .next()
                        .context("No sensors found");
                }
            }
        }
    }

    fn write_recording(&self, path: &Path) -> Result<()> {
        let export = self
            .recorder
            .export()
            .context("Recorded session is not exportable")?;
        let json = serde_json::to_string_pretty(&export)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(
            "Wrote {} points ({} ms) to {}",
            export.point_count,
            export.duration_ms,
            path.display()
        );
        Ok(())
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.process_event(event);
        }
    }

    fn process_event(&mut self, event: AppEvent) {
        match event {
            AppEvent::StateChanged(state) => {
                self.connection_state = state;
            }
            AppEvent::DeviceFound(device) => {
                info!("Found {} ({})", device.display_name(), device.id);
            }
            AppEvent::Sample(sample) => {
                self.recorder.record(&sample);
                println!("{}", format_sample(&sample));
            }
            AppEvent::StaleChanged(true) => {
                println!("{}", format_sample(&self.sensor.current_sample()));
            }
            AppEvent::StaleChanged(false) => {}
            AppEvent::Connected(device) => {
                self.link_lost = false;
                if let Err(e) = self.settings.remember_device(&device.id) {
                    error!("Failed to save settings: {}", e);
                }
            }
            AppEvent::ConnectionLost(device) => {
                warn!("Lost connection to {}", device.display_name());
                self.link_lost = true;
            }
            AppEvent::Log(message) => {
                if message.severity == MessageSeverity::Error {
                    eprintln!("{}", message.message);
                }
                self.status_message = Some(message);
            }
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn status_message(&self) -> Option<&StatusMessage> {
        self.status_message.as_ref()
    }

    pub fn settings(&self) -> &SettingsService {
        &self.settings
    }
}

fn format_sample(sample: &SensorSample) -> String {
    format!(
        "accel {:+7.3} {:+7.3} {:+7.3} g | gyro {:+8.2} {:+8.2} {:+8.2} dps{}",
        sample.accel_x,
        sample.accel_y,
        sample.accel_z,
        sample.gyro_x,
        sample.gyro_y,
        sample.gyro_z,
        if sample.is_stale { "  STALE" } else { "" }
    )
}
