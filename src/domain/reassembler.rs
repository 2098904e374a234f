//! Frame Reassembler
//!
//! Turns arbitrarily chunked notification text into six-axis readings.
//!
//! ## Wire format
//!
//! ```text
//! <ax>,<ay>,<az>,<gx>,<gy>,<gz>[,<ax>,...]
//! ```
//!
//! Base-10 signed integers, comma separated, no fixed width. Notification
//! boundaries do not line up with groups: one group may span several
//! notifications and one notification may carry several groups.
//!
//! ## Recovery
//!
//! A six-token window that does not fully parse is slid forward by a single
//! token, so one corrupt or truncated value costs at most one group. The
//! buffer is dropped wholesale once it grows past its ceiling.
//!
//! A fragment boundary that falls inside the sixth token of a group cannot
//! be told apart from a complete token; the stream format carries no group
//! terminator, so that case is parsed as-is.

use crate::domain::models::{RawReading, SensorSample};
use chrono::{DateTime, Utc};
use tracing::{trace, warn};

/// Values per group: ax, ay, az, gx, gy, gz.
pub const GROUP_ARITY: usize = 6;

/// Characters retained before the buffer is discarded.
pub const DEFAULT_BUFFER_CEILING: usize = 200;

const DELIMITER: char = ',';
const DELIMITER_STR: &str = ",";

/// Raw-count to physical-unit scale factors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuScale {
    /// Accelerometer LSB per g (±2 g range on the MPU6050).
    pub accel_lsb_per_g: f64,
    /// Gyroscope LSB per degree/second (±250 dps range).
    pub gyro_lsb_per_dps: f64,
}

impl Default for ImuScale {
    fn default() -> Self {
        Self {
            accel_lsb_per_g: 16384.0,
            gyro_lsb_per_dps: 131.0,
        }
    }
}

impl ImuScale {
    /// Build a fresh (non-stale) sample from a raw reading.
    pub fn to_sample(&self, raw: RawReading, received_at: DateTime<Utc>) -> SensorSample {
        let accel = |v: i32| scale_value(v as f64, self.accel_lsb_per_g);
        let gyro = |v: i32| scale_value(v as f64, self.gyro_lsb_per_dps);

        SensorSample {
            accel_x: accel(raw.ax),
            accel_y: accel(raw.ay),
            accel_z: accel(raw.az),
            gyro_x: gyro(raw.gx),
            gyro_y: gyro(raw.gy),
            gyro_z: gyro(raw.gz),
            raw,
            received_at: Some(received_at),
            is_stale: false,
        }
    }
}

/// Divide `raw` by `lsb_per_unit`, yielding `0.0` instead of NaN or infinity.
pub fn scale_value(raw: f64, lsb_per_unit: f64) -> f64 {
    if !raw.is_finite() || !lsb_per_unit.is_finite() || lsb_per_unit == 0.0 {
        return 0.0;
    }
    let value = raw / lsb_per_unit;
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub fragments: u64,
    pub readings: u64,
    pub skipped_tokens: u64,
    pub overflow_resets: u64,
}

#[derive(Debug)]
pub struct FrameReassembler {
    buffer: String,
    ceiling: usize,
    scale: ImuScale,
    stats: StreamStats,
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new(ImuScale::default(), DEFAULT_BUFFER_CEILING)
    }
}

impl FrameReassembler {
    pub fn new(scale: ImuScale, ceiling: usize) -> Self {
        Self {
            buffer: String::new(),
            ceiling,
            scale,
            stats: StreamStats::default(),
        }
    }

    /// Feed one decoded notification and collect every sample it completes.
    pub fn push(&mut self, fragment: &str, received_at: DateTime<Utc>) -> Vec<SensorSample> {
        self.push_raw(fragment)
            .into_iter()
            .map(|raw| self.scale.to_sample(raw, received_at))
            .collect()
    }

    /// Feed one decoded notification and collect the raw readings it completes.
    pub fn push_raw(&mut self, fragment: &str) -> Vec<RawReading> {
        self.stats.fragments += 1;
        self.buffer.push_str(fragment);

        let mut readings = Vec::new();
        let mut skipped = 0u64;

        let remainder = {
            let tokens: Vec<&str> = self.buffer.split(DELIMITER).collect();

            // An empty piece after the final delimiter is the next token not
            // yet started; it never takes part in a window.
            let usable = match tokens.last() {
                Some(last) if last.is_empty() => tokens.len() - 1,
                _ => tokens.len(),
            };

            let mut cursor = 0;
            while usable - cursor >= GROUP_ARITY {
                match parse_group(&tokens[cursor..cursor + GROUP_ARITY]) {
                    Some(values) => {
                        readings.push(RawReading::from_array(values));
                        cursor += GROUP_ARITY;
                    }
                    None => {
                        trace!("Resync: dropping token {:?}", tokens[cursor]);
                        skipped += 1;
                        cursor += 1;
                    }
                }
            }

            if cursor > 0 {
                Some(tokens[cursor..].join(DELIMITER_STR))
            } else {
                None
            }
        };

        if let Some(rest) = remainder {
            self.buffer = rest;
        }

        if self.buffer.len() > self.ceiling {
            warn!(
                "Reassembly buffer exceeded {} chars ({}), clearing",
                self.ceiling,
                self.buffer.len()
            );
            self.buffer.clear();
            self.stats.overflow_resets += 1;
        }

        self.stats.readings += readings.len() as u64;
        self.stats.skipped_tokens += skipped;
        readings
    }

    /// Unconsumed text awaiting more data.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }
}

fn parse_group(tokens: &[&str]) -> Option<[i32; GROUP_ARITY]> {
    let mut values = [0i32; GROUP_ARITY];
    for (slot, token) in values.iter_mut().zip(tokens) {
        *slot = token.trim().parse().ok()?;
    }
    Some(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(values: [i32; 6]) -> RawReading {
        RawReading::from_array(values)
    }

    fn feed_all(reassembler: &mut FrameReassembler, fragments: &[&str]) -> Vec<RawReading> {
        fragments
            .iter()
            .flat_map(|f| reassembler.push_raw(f))
            .collect()
    }

    #[test]
    fn group_spanning_notifications() {
        let mut r = FrameReassembler::default();

        assert!(r.push_raw("100,200,300").is_empty());
        assert_eq!(r.pending(), "100,200,300");

        let out = r.push_raw(",400,500,600,700");
        assert_eq!(out, vec![raw([100, 200, 300, 400, 500, 600])]);
        assert_eq!(r.pending(), "700");

        assert!(r.push_raw(",800,900").is_empty());
        assert_eq!(r.pending(), "700,800,900");
    }

    #[test]
    fn several_groups_in_one_notification() {
        let mut r = FrameReassembler::default();
        let out = r.push_raw("1,2,3,4,5,6,-7,-8,-9,-10,-11,-12,13");
        assert_eq!(
            out,
            vec![
                raw([1, 2, 3, 4, 5, 6]),
                raw([-7, -8, -9, -10, -11, -12])
            ]
        );
        assert_eq!(r.pending(), "13");
    }

    #[test]
    fn whitespace_around_tokens_is_ignored() {
        let mut r = FrameReassembler::default();
        let out = r.push_raw(" 1, 2 ,3,\t4,5,6\r\n");
        assert_eq!(out, vec![raw([1, 2, 3, 4, 5, 6])]);
    }

    #[test]
    fn corrupt_token_slides_window_by_one() {
        let mut r = FrameReassembler::default();
        let out = r.push_raw("1,2,x,4,5,6,7,8,9,10,11,12");

        // Windows starting at 1, 2 and x all contain x; the first clean one
        // starts right after it.
        assert_eq!(out, vec![raw([4, 5, 6, 7, 8, 9])]);
        assert_eq!(r.pending(), "10,11,12");
        assert_eq!(r.stats().skipped_tokens, 3);
    }

    #[test]
    fn truncated_last_value_recovers_on_next_group() {
        let mut r = FrameReassembler::default();
        let out = r.push_raw("1,2,3,4,5,x,7,8,9,10,11,12");
        assert_eq!(out, vec![raw([7, 8, 9, 10, 11, 12])]);
        assert_eq!(r.pending(), "");
    }

    #[test]
    fn stream_keeps_flowing_after_garbage() {
        let mut r = FrameReassembler::default();
        let out = feed_all(&mut r, &["1,2,x", ",4,5,6,", "7,8,9,10,11,12,"]);
        assert_eq!(out, vec![raw([4, 5, 6, 7, 8, 9])]);
        assert_eq!(r.pending(), "10,11,12,");

        let out = r.push_raw("13,14,15");
        assert_eq!(out, vec![raw([10, 11, 12, 13, 14, 15])]);
    }

    #[test]
    fn trailing_delimiter_does_not_cost_a_token() {
        let mut r = FrameReassembler::default();
        assert!(r.push_raw("1,2,3,4,5,").is_empty());
        assert_eq!(r.pending(), "1,2,3,4,5,");

        let out = r.push_raw("6,7");
        assert_eq!(out, vec![raw([1, 2, 3, 4, 5, 6])]);
        assert_eq!(r.pending(), "7");
    }

    #[test]
    fn buffer_is_reset_past_ceiling() {
        let mut r = FrameReassembler::default();
        // Never five delimiters, so never six tokens.
        let fragment = "123456789";
        let mut resets_seen = false;
        for _ in 0..40 {
            r.push_raw(fragment);
            assert!(r.pending().len() <= DEFAULT_BUFFER_CEILING);
            if r.pending().is_empty() {
                resets_seen = true;
                break;
            }
        }
        assert!(resets_seen);
        assert_eq!(r.stats().overflow_resets, 1);
    }

    #[test]
    fn garbage_without_delimiters_is_reset_not_grown() {
        let mut r = FrameReassembler::new(ImuScale::default(), 20);
        r.push_raw("abc,def,");
        r.push_raw("ghijklmnopqrstuvwxyz");
        assert_eq!(r.pending(), "");
    }

    #[test]
    fn any_cut_outside_a_closing_value_matches_unsplit_parse() {
        let groups = [
            [100, -200, 16384, 12, -131, 3],
            [-1, 0, 16000, 250, 251, 7],
            [5, 6, 7, 8, 9, 1],
        ];
        let stream = groups
            .iter()
            .map(|g| {
                g.iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .collect::<Vec<_>>()
            .join(",");

        let expected: Vec<RawReading> = groups.iter().map(|g| raw(*g)).collect();
        let direct = FrameReassembler::default().push_raw(&stream);
        assert_eq!(direct, expected);

        // Byte offsets strictly inside each group's sixth value.
        let mut forbidden = Vec::new();
        let mut offset = 0;
        for (index, token) in stream.split(',').enumerate() {
            if index % GROUP_ARITY == GROUP_ARITY - 1 {
                forbidden.extend(offset + 1..offset + token.len());
            }
            offset += token.len() + 1;
        }

        for cut in 1..stream.len() {
            if forbidden.contains(&cut) {
                continue;
            }
            let mut r = FrameReassembler::default();
            let out = feed_all(&mut r, &[&stream[..cut], &stream[cut..]]);
            assert_eq!(out, expected, "cut at {cut}");
        }
    }

    #[test]
    fn byte_by_byte_delivery() {
        let stream = "100,-200,16384,5,-7,3,1,2,3,4,5,6,-32768,32767,0,0,0,9";
        let mut r = FrameReassembler::default();
        let mut out = Vec::new();
        for ch in stream.chars() {
            out.extend(r.push_raw(&ch.to_string()));
        }
        assert_eq!(
            out,
            vec![
                raw([100, -200, 16384, 5, -7, 3]),
                raw([1, 2, 3, 4, 5, 6]),
                raw([-32768, 32767, 0, 0, 0, 9]),
            ]
        );
    }

    #[test]
    fn samples_carry_physical_units() {
        let mut r = FrameReassembler::default();
        let now = Utc::now();
        let samples = r.push("16384,-8192,0,131,-262,0", now);
        assert_eq!(samples.len(), 1);

        let s = &samples[0];
        assert_eq!(s.accel_x, 1.0);
        assert_eq!(s.accel_y, -0.5);
        assert_eq!(s.accel_z, 0.0);
        assert_eq!(s.gyro_x, 1.0);
        assert_eq!(s.gyro_y, -2.0);
        assert_eq!(s.raw.ax, 16384);
        assert_eq!(s.received_at, Some(now));
        assert!(!s.is_stale);
    }

    #[test]
    fn scale_guard_never_yields_nan_or_inf() {
        assert_eq!(scale_value(f64::NAN, 131.0), 0.0);
        assert_eq!(scale_value(f64::INFINITY, 131.0), 0.0);
        assert_eq!(scale_value(f64::NEG_INFINITY, 16384.0), 0.0);
        assert_eq!(scale_value(100.0, 0.0), 0.0);
        assert_eq!(scale_value(100.0, f64::NAN), 0.0);
        assert_eq!(scale_value(100.0, f64::INFINITY), 0.0);
        assert_eq!(scale_value(f64::MAX, 1e-300), 0.0);
        assert_eq!(scale_value(262.0, 131.0), 2.0);
    }

    #[test]
    fn zero_scale_produces_zeroed_axes() {
        let scale = ImuScale {
            accel_lsb_per_g: 0.0,
            gyro_lsb_per_dps: 0.0,
        };
        let sample = scale.to_sample(raw([1, 2, 3, 4, 5, 6]), Utc::now());
        assert_eq!(
            [
                sample.accel_x,
                sample.accel_y,
                sample.accel_z,
                sample.gyro_x,
                sample.gyro_y,
                sample.gyro_z
            ],
            [0.0; 6]
        );
        assert_eq!(sample.raw, raw([1, 2, 3, 4, 5, 6]));
    }
}
