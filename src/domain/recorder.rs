//! Session Recorder
//!
//! Collects published samples between `start` and `stop` and packages them
//! for the external minting/export collaborator.

use crate::domain::models::{RawReading, SensorSample};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fewest points accepted for export.
pub const MIN_EXPORT_POINTS: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecorderError {
    #[error("data collection in progress, stop it before exporting")]
    StillCollecting,
    #[error("no data collected")]
    Empty,
    #[error("only {count} data points collected, at least {} required", MIN_EXPORT_POINTS)]
    TooFewPoints { count: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedPoint {
    pub timestamp: DateTime<Utc>,
    pub accelerometer: Vector3,
    pub gyroscope: Vector3,
    pub raw: RawReading,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionExport {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub point_count: usize,
    pub points: Vec<RecordedPoint>,
}

#[derive(Debug, Default)]
pub struct SessionRecorder {
    collecting: bool,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    points: Vec<RecordedPoint>,
}

impl SessionRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        self.points.clear();
        self.collecting = true;
        self.started_at = Some(now);
        self.ended_at = None;
        tracing::info!("Sample collection started");
    }

    pub fn stop(&mut self, now: DateTime<Utc>) {
        if !self.collecting {
            return;
        }
        self.collecting = false;
        self.ended_at = Some(now);
        tracing::info!(
            "Sample collection stopped: {} points over {} ms",
            self.points.len(),
            self.duration_ms()
        );
    }

    /// Returns `true` if the sample was kept.
    pub fn record(&mut self, sample: &SensorSample) -> bool {
        if !self.collecting || sample.is_stale {
            return false;
        }
        let Some(timestamp) = sample.received_at else {
            return false;
        };

        self.points.push(RecordedPoint {
            timestamp,
            accelerometer: Vector3 {
                x: sample.accel_x,
                y: sample.accel_y,
                z: sample.accel_z,
            },
            gyroscope: Vector3 {
                x: sample.gyro_x,
                y: sample.gyro_y,
                z: sample.gyro_z,
            },
            raw: sample.raw,
        });
        true
    }

    pub fn is_collecting(&self) -> bool {
        self.collecting
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn duration_ms(&self) -> i64 {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds(),
            _ => 0,
        }
    }

    pub fn validate_for_export(&self) -> Result<(), RecorderError> {
        if self.collecting {
            return Err(RecorderError::StillCollecting);
        }
        if self.points.is_empty() {
            return Err(RecorderError::Empty);
        }
        if self.points.len() < MIN_EXPORT_POINTS {
            return Err(RecorderError::TooFewPoints {
                count: self.points.len(),
            });
        }
        Ok(())
    }

    pub fn export(&self) -> Result<SessionExport, RecorderError> {
        self.validate_for_export()?;
        let (Some(started_at), Some(ended_at)) = (self.started_at, self.ended_at) else {
            return Err(RecorderError::Empty);
        };

        Ok(SessionExport {
            started_at,
            ended_at,
            duration_ms: self.duration_ms(),
            point_count: self.points.len(),
            points: self.points.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::reassembler::ImuScale;
    use chrono::Duration;

    fn sample(at: DateTime<Utc>, ax: i32) -> SensorSample {
        ImuScale::default().to_sample(RawReading::from_array([ax, 0, 16384, 0, 0, 131]), at)
    }

    #[test]
    fn only_fresh_samples_while_collecting_are_kept() {
        let t0 = Utc::now();
        let mut rec = SessionRecorder::new();

        assert!(!rec.record(&sample(t0, 1)));

        rec.start(t0);
        assert!(rec.record(&sample(t0, 1)));
        assert!(!rec.record(&SensorSample::default()));
        assert!(!rec.record(&sample(t0, 2).into_stale()));
        assert_eq!(rec.len(), 1);

        rec.stop(t0 + Duration::seconds(1));
        assert!(!rec.record(&sample(t0, 3)));
        assert_eq!(rec.len(), 1);
    }

    #[test]
    fn export_requires_stopped_and_enough_points() {
        let t0 = Utc::now();
        let mut rec = SessionRecorder::new();
        assert_eq!(rec.validate_for_export(), Err(RecorderError::Empty));

        rec.start(t0);
        for i in 0..3 {
            rec.record(&sample(t0 + Duration::milliseconds(i * 10), i as i32));
        }
        assert_eq!(rec.validate_for_export(), Err(RecorderError::StillCollecting));

        rec.stop(t0 + Duration::milliseconds(100));
        assert_eq!(
            rec.validate_for_export(),
            Err(RecorderError::TooFewPoints { count: 3 })
        );
    }

    #[test]
    fn export_carries_points_and_duration() {
        let t0 = Utc::now();
        let mut rec = SessionRecorder::new();
        rec.start(t0);
        for i in 0..6 {
            rec.record(&sample(t0 + Duration::milliseconds(i * 20), 16384));
        }
        rec.stop(t0 + Duration::milliseconds(1500));

        let export = rec.export().unwrap();
        assert_eq!(export.point_count, 6);
        assert_eq!(export.duration_ms, 1500);
        assert_eq!(export.points[0].accelerometer.x, 1.0);
        assert_eq!(export.points[0].gyroscope.z, 1.0);

        let json = serde_json::to_string(&export).unwrap();
        assert!(json.contains("\"point_count\":6"));
    }

    #[test]
    fn restart_discards_previous_points() {
        let t0 = Utc::now();
        let mut rec = SessionRecorder::new();
        rec.start(t0);
        rec.record(&sample(t0, 1));
        rec.stop(t0);
        rec.start(t0);
        assert!(rec.is_empty());
        assert!(rec.is_collecting());
    }
}
