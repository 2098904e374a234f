//! Kinetic Sensor Protocol
//!
//! GATT layout per firmware revision, notification decoding, and the rules
//! for deciding which advertisements belong to a sensor.

use crate::domain::models::DeviceDescriptor;
use crate::domain::settings::{BleSettings, FirmwareRevision};
use crate::infrastructure::bluetooth::error::DecodeError;
use anyhow::{Context, Result};
use tracing::trace;
use uuid::Uuid;

/// ESP32-C3 + MPU6050 firmware: IMU service.
pub const KINETIC_V1_SERVICE_UUID: &str = "12345678-1234-1234-1234-1234567890ab";
/// ESP32-C3 + MPU6050 firmware: notify-only IMU text characteristic.
pub const KINETIC_V1_DATA_CHAR_UUID: &str = "abcd1234-5678-90ab-cdef-1234567890ab";

/// Arduino Nano firmware: data service.
pub const NANO_SENSE_SERVICE_UUID: &str = "19b10000-e8f2-537e-4f6c-d104768a1214";
/// Arduino Nano firmware: notify-only data characteristic.
pub const NANO_SENSE_DATA_CHAR_UUID: &str = "19b10001-e8f2-537e-4f6c-d104768a1217";

/// Service and characteristic the session talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    pub service_uuid: Uuid,
    pub data_char_uuid: Uuid,
}

impl GattProfile {
    pub fn for_revision(revision: FirmwareRevision) -> Self {
        let (service, data) = match revision {
            FirmwareRevision::KineticV1 => (KINETIC_V1_SERVICE_UUID, KINETIC_V1_DATA_CHAR_UUID),
            FirmwareRevision::NanoSense => (NANO_SENSE_SERVICE_UUID, NANO_SENSE_DATA_CHAR_UUID),
        };
        Self {
            service_uuid: Uuid::parse_str(service).unwrap_or_default(),
            data_char_uuid: Uuid::parse_str(data).unwrap_or_default(),
        }
    }

    /// Firmware defaults with any explicit UUID overrides applied.
    pub fn from_settings(settings: &BleSettings) -> Result<Self> {
        let mut profile = Self::for_revision(settings.firmware);
        if let Some(service) = settings.service_uuid.as_deref() {
            profile.service_uuid = parse_uuid(service).context("invalid service UUID")?;
        }
        if let Some(data) = settings.data_char_uuid.as_deref() {
            profile.data_char_uuid = parse_uuid(data).context("invalid data characteristic UUID")?;
        }
        Ok(profile)
    }
}

/// Parse a hyphenated 128-bit UUID string.
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    let trimmed = uuid_str.trim();
    if trimmed.len() != 36 {
        anyhow::bail!("Invalid UUID format: {:?}", uuid_str);
    }
    Ok(Uuid::parse_str(trimmed)?)
}

/// Decode one notification value into text.
///
/// The device sends plain ASCII, sometimes NUL padded.
pub fn decode_notification(bytes: &[u8]) -> Result<String, DecodeError> {
    if let Some(offset) = bytes.iter().position(|b| !b.is_ascii()) {
        return Err(DecodeError {
            byte: bytes[offset],
            offset,
            len: bytes.len(),
        });
    }

    let end = bytes
        .iter()
        .rposition(|&b| b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);

    #[cfg(debug_assertions)]
    trace!("Raw notification: {:02X?}", bytes);

    Ok(bytes[..end].iter().map(|&b| b as char).collect())
}

/// Decides which scan results are candidate sensors.
#[derive(Debug, Clone)]
pub struct DeviceFilter {
    name_patterns: Vec<String>,
    service_uuid: Uuid,
    show_all: bool,
}

impl DeviceFilter {
    pub fn new(name_patterns: &[String], service_uuid: Uuid, show_all: bool) -> Self {
        Self {
            name_patterns: name_patterns.iter().map(|p| p.to_lowercase()).collect(),
            service_uuid,
            show_all,
        }
    }

    /// Name pattern or advertised service, and some identity to show.
    pub fn is_target(&self, device: &DeviceDescriptor) -> bool {
        if self.show_all {
            return true;
        }

        let name = device.name.as_deref().unwrap_or_default().to_lowercase();
        let name_matches = self
            .name_patterns
            .iter()
            .any(|pattern| !pattern.is_empty() && name.contains(pattern.as_str()));
        let service_matches = device.service_uuids.contains(&self.service_uuid);
        let has_identity = !name.is_empty() || !device.service_uuids.is_empty();

        (name_matches || service_matches) && has_identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_filter(show_all: bool) -> DeviceFilter {
        let settings = BleSettings::default();
        let profile = GattProfile::from_settings(&settings).unwrap();
        DeviceFilter::new(&settings.device_name_patterns, profile.service_uuid, show_all)
    }

    #[test]
    fn revisions_use_distinct_uuid_sets() {
        let v1 = GattProfile::for_revision(FirmwareRevision::KineticV1);
        let nano = GattProfile::for_revision(FirmwareRevision::NanoSense);
        assert_eq!(v1.service_uuid.to_string(), KINETIC_V1_SERVICE_UUID);
        assert_eq!(v1.data_char_uuid.to_string(), KINETIC_V1_DATA_CHAR_UUID);
        assert_eq!(nano.service_uuid.to_string(), NANO_SENSE_SERVICE_UUID);
        assert_ne!(v1, nano);
    }

    #[test]
    fn overrides_win_and_are_validated() {
        let mut settings = BleSettings::default();
        settings.data_char_uuid = Some("0000ffe1-0000-1000-8000-00805f9b34fb".to_string());
        let profile = GattProfile::from_settings(&settings).unwrap();
        assert_eq!(
            profile.data_char_uuid.to_string(),
            "0000ffe1-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(profile.service_uuid.to_string(), KINETIC_V1_SERVICE_UUID);

        settings.service_uuid = Some("not-a-uuid".to_string());
        assert!(GattProfile::from_settings(&settings).is_err());

        assert!(parse_uuid("12345678123412341234123456789abc").is_err());
    }

    #[test]
    fn decode_strips_nul_padding() {
        assert_eq!(decode_notification(b"1,2,3\0\0").unwrap(), "1,2,3");
        assert_eq!(decode_notification(b"").unwrap(), "");
        assert_eq!(decode_notification(b"\0\0").unwrap(), "");
        assert_eq!(decode_notification(b"-5,\r\n").unwrap(), "-5,\r\n");
    }

    #[test]
    fn decode_rejects_non_ascii() {
        let err = decode_notification(&[b'1', b',', 0xC3, 0xA9]).unwrap_err();
        assert_eq!(err.offset, 2);
        assert_eq!(err.byte, 0xC3);
        assert_eq!(err.len, 4);
    }

    #[test]
    fn filter_matches_name_patterns_case_insensitively() {
        let filter = default_filter(false);
        assert!(filter.is_target(&DeviceDescriptor::new("1").with_name("ESP32C3_MPU6050")));
        assert!(filter.is_target(&DeviceDescriptor::new("2").with_name("My Arduino")));
        assert!(!filter.is_target(&DeviceDescriptor::new("3").with_name("Headphones")));
        assert!(!filter.is_target(&DeviceDescriptor::new("4")));
    }

    #[test]
    fn filter_matches_advertised_service() {
        let filter = default_filter(false);
        let service = Uuid::parse_str(KINETIC_V1_SERVICE_UUID).unwrap();
        assert!(filter.is_target(&DeviceDescriptor::new("1").with_service(service)));

        let other = Uuid::parse_str(NANO_SENSE_SERVICE_UUID).unwrap();
        assert!(!filter.is_target(&DeviceDescriptor::new("2").with_service(other)));
    }

    #[test]
    fn show_all_bypasses_filter() {
        let filter = default_filter(true);
        assert!(filter.is_target(&DeviceDescriptor::new("anonymous")));
    }
}
