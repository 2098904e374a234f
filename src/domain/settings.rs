use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

/// Sensor firmware generations; each exposes its own GATT UUID pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareRevision {
    /// ESP32-C3 + MPU6050 board.
    #[default]
    KineticV1,
    /// Arduino Nano sketch.
    NanoSense,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleSettings {
    #[serde(default)]
    pub firmware: FirmwareRevision,
    /// Overrides the firmware's service UUID when set.
    #[serde(default)]
    pub service_uuid: Option<String>,
    /// Overrides the firmware's data characteristic UUID when set.
    #[serde(default)]
    pub data_char_uuid: Option<String>,
    #[serde(default = "default_name_patterns")]
    pub device_name_patterns: Vec<String>,
    #[serde(default = "default_false")]
    pub show_all_devices: bool,
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default = "default_disconnect_step_timeout_ms")]
    pub disconnect_step_timeout_ms: u64,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            firmware: FirmwareRevision::default(),
            service_uuid: None,
            data_char_uuid: None,
            device_name_patterns: default_name_patterns(),
            show_all_devices: default_false(),
            scan_timeout_ms: default_scan_timeout_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            disconnect_step_timeout_ms: default_disconnect_step_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    #[serde(default = "default_buffer_ceiling")]
    pub buffer_ceiling: usize,
    #[serde(default = "default_accel_lsb_per_g")]
    pub accel_lsb_per_g: f64,
    #[serde(default = "default_gyro_lsb_per_dps")]
    pub gyro_lsb_per_dps: f64,
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,
    #[serde(default = "default_watchdog_tick_ms")]
    pub watchdog_tick_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            buffer_ceiling: default_buffer_ceiling(),
            accel_lsb_per_g: default_accel_lsb_per_g(),
            gyro_lsb_per_dps: default_gyro_lsb_per_dps(),
            stale_threshold_ms: default_stale_threshold_ms(),
            watchdog_tick_ms: default_watchdog_tick_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_false")]
    pub auto_reconnect: bool,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            auto_reconnect: default_false(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub ble: BleSettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub reconnect: ReconnectSettings,

    #[serde(default)]
    pub last_connected_device: Option<String>,
    #[serde(default)]
    pub known_devices: Vec<String>,
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "kinetic_ble".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_name_patterns() -> Vec<String> {
    ["ESP32C3_MPU6050", "arduino", "esp32", "esp8266", "nano", "uno"]
        .iter()
        .map(|p| p.to_string())
        .collect()
}
fn default_scan_timeout_ms() -> u64 {
    10_000
}
fn default_settle_delay_ms() -> u64 {
    1_000
}
fn default_connect_timeout_ms() -> Option<u64> {
    Some(10_000)
}
fn default_disconnect_step_timeout_ms() -> u64 {
    5_000
}
fn default_buffer_ceiling() -> usize {
    200
}
fn default_accel_lsb_per_g() -> f64 {
    16384.0
}
fn default_gyro_lsb_per_dps() -> f64 {
    131.0
}
fn default_stale_threshold_ms() -> u64 {
    3_000
}
fn default_watchdog_tick_ms() -> u64 {
    50
}
fn default_reconnect_delay_ms() -> u64 {
    2_000
}
fn default_max_attempts() -> u32 {
    3
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load from the per-user config directory, falling back to defaults.
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::default_settings_path()?;
        Ok(Self::open(settings_path))
    }

    /// Load from an explicit path, falling back to defaults.
    pub fn open(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn default_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("KineticSensor");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(dir) = self.settings_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Record a successful connection so `reconnect` works across runs.
    pub fn remember_device(&mut self, device_id: &str) -> anyhow::Result<()> {
        let known = self.settings.known_devices.iter().any(|d| d == device_id);
        let is_last = self.settings.last_connected_device.as_deref() == Some(device_id);
        if known && is_last {
            return Ok(());
        }

        if !known {
            self.settings.known_devices.push(device_id.to_string());
        }
        self.settings.last_connected_device = Some(device_id.to_string());
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let service = SettingsService::open(dir.path().join("absent.json"));
        let s = service.get();
        assert_eq!(s.ble.firmware, FirmwareRevision::KineticV1);
        assert_eq!(s.ble.scan_timeout_ms, 10_000);
        assert_eq!(s.stream.buffer_ceiling, 200);
        assert_eq!(s.stream.stale_threshold_ms, 3_000);
        assert_eq!(s.ble.connect_timeout_ms, Some(10_000));
        assert!(s.last_connected_device.is_none());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{ "ble": { "firmware": "nano_sense", "show_all_devices": true } }"#,
        )
        .unwrap();

        let service = SettingsService::open(path);
        let s = service.get();
        assert_eq!(s.ble.firmware, FirmwareRevision::NanoSense);
        assert!(s.ble.show_all_devices);
        assert_eq!(s.ble.settle_delay_ms, 1_000);
        assert_eq!(s.stream.gyro_lsb_per_dps, 131.0);
        assert_eq!(s.log_settings.level, "info");
    }

    #[test]
    fn remember_device_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut service = SettingsService::open(path.clone());
        service.remember_device("AA:BB").unwrap();
        service.remember_device("CC:DD").unwrap();
        service.remember_device("AA:BB").unwrap();

        let reloaded = SettingsService::open(path);
        let s = reloaded.get();
        assert_eq!(s.last_connected_device.as_deref(), Some("AA:BB"));
        assert_eq!(s.known_devices, vec!["AA:BB".to_string(), "CC:DD".to_string()]);
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        let service = SettingsService::open(path);
        assert_eq!(service.get().reconnect.max_attempts, 3);
    }
}
