//! GPS time discipline: the external NMEA/UBX line parser is out of
//! scope (spec.md §1), but `TimeRef` and the XTAL correction it feeds
//! are squarely in scope, per spec.md §3/§4.4/§4.5.

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// Concentrator counter is considered stale past this age (spec.md §3).
pub const GPS_REF_MAX_AGE: Duration = Duration::from_secs(30);
/// Number of samples averaged to seed `xtal_correct` (spec.md §3).
pub const XERR_INIT_AVG: usize = 16;
/// IIR low-pass coefficient denominator for `xtal_correct` (spec.md §3).
pub const XERR_FILT_COEF: f64 = 256.0;
/// Plausibility bound on a single XTAL error sample (spec.md §4.4).
pub const XTAL_ERROR_PPM_BOUND: f64 = 50.0;

/// A message produced by the external NMEA/UBX parser.
#[derive(Debug, Clone, PartialEq)]
pub enum GpsMessage {
    /// UBX NAV-TIMEGPS: a synchronising frame giving UTC and GPS time
    /// at the most recent PPS edge.
    NavTimeGps { utc: DateTime<Utc>, gps_seconds: u32 },
    /// NMEA RMC: a coordinate fix, independent of time synchronisation.
    Rmc { latitude: f64, longitude: f64 },
    /// The parser had an incomplete frame; caller should keep the
    /// bytes in its ring buffer and retry after more input arrives.
    Incomplete,
    /// The parser found a header it could not make sense of; caller
    /// should advance past it and keep scanning.
    Invalid,
}

/// Anchors a UTC/GPS/counter triple at a PPS edge, plus the XTAL error
/// ratio measured at that edge.
#[derive(Debug, Clone, Copy)]
pub struct TimeRef {
    pub utc: DateTime<Utc>,
    pub gps_seconds: u32,
    pub counter_at_pps: u32,
    pub xtal_error: f64,
    captured_at: Instant,
}

impl TimeRef {
    pub fn new(utc: DateTime<Utc>, gps_seconds: u32, counter_at_pps: u32, xtal_error: f64) -> Self {
        TimeRef {
            utc,
            gps_seconds,
            counter_at_pps,
            xtal_error,
            captured_at: Instant::now(),
        }
    }

    #[cfg(test)]
    fn with_captured_at(mut self, captured_at: Instant) -> Self {
        self.captured_at = captured_at;
        self
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    pub fn is_valid(&self) -> bool {
        self.age() <= GPS_REF_MAX_AGE
    }

    /// Converts a concentrator counter value to UTC, applying the
    /// XTAL correction to the elapsed-counter delta.
    pub fn cnt2utc(&self, counter: u32) -> DateTime<Utc> {
        let delta_us = jit::wrapping_diff(counter, self.counter_at_pps) as f64 * self.xtal_error;
        self.utc + chrono::Duration::microseconds(delta_us.round() as i64)
    }

    /// Converts a concentrator counter value to milliseconds since the
    /// GPS epoch.
    pub fn cnt2gps(&self, counter: u32) -> u64 {
        let delta_us = jit::wrapping_diff(counter, self.counter_at_pps) as f64 * self.xtal_error;
        let base_ms = self.gps_seconds as i64 * 1000;
        (base_ms + (delta_us / 1000.0).round() as i64).max(0) as u64
    }

    /// Converts milliseconds since the GPS epoch back to a concentrator
    /// counter value; the inverse of [`TimeRef::cnt2gps`].
    pub fn gps2cnt(&self, gps_ms: u64) -> u32 {
        let base_ms = self.gps_seconds as i64 * 1000;
        let delta_ms = gps_ms as i64 - base_ms;
        let delta_us = (delta_ms as f64 * 1000.0) / self.xtal_error;
        self.counter_at_pps.wrapping_add(delta_us.round() as i64 as u32)
    }
}

/// Tracks `xtal_correct`/`xtal_correct_ok` (spec.md §3/§4.5).
#[derive(Debug, Clone)]
pub struct XtalCorrection {
    xtal_correct: f64,
    xtal_correct_ok: bool,
    init_samples: Vec<f64>,
}

impl Default for XtalCorrection {
    fn default() -> Self {
        XtalCorrection {
            xtal_correct: 1.0,
            xtal_correct_ok: false,
            init_samples: Vec::with_capacity(XERR_INIT_AVG),
        }
    }
}

impl XtalCorrection {
    pub fn value(&self) -> f64 {
        self.xtal_correct
    }

    pub fn is_ok(&self) -> bool {
        self.xtal_correct_ok
    }

    /// Resets to the un-disciplined state (spec.md §4.5, "if reference
    /// goes stale").
    pub fn reset(&mut self) {
        *self = XtalCorrection::default();
    }

    /// Folds in one XTAL error sample measured against the running
    /// estimate. Samples implausibly far from the current estimate
    /// (more than [`XTAL_ERROR_PPM_BOUND`] ppm) are rejected.
    pub fn update(&mut self, sample: f64) -> bool {
        let ppm_delta = ((sample - self.xtal_correct) / self.xtal_correct).abs() * 1_000_000.0;
        if self.xtal_correct_ok && ppm_delta > XTAL_ERROR_PPM_BOUND {
            return false;
        }

        if self.init_samples.len() < XERR_INIT_AVG {
            self.init_samples.push(sample);
            if self.init_samples.len() == XERR_INIT_AVG {
                self.xtal_correct = self.init_samples.iter().sum::<f64>() / XERR_INIT_AVG as f64;
                self.xtal_correct_ok = true;
            }
            return true;
        }

        self.xtal_correct += (1.0 / sample - self.xtal_correct) / XERR_FILT_COEF;
        true
    }
}

/// External NMEA/UBX line parser and PPS-edge synchroniser. Real frame
/// decoding lives outside this crate's scope; this trait only pins
/// down the call shape the GPS worker drives.
pub trait Gps: Send + Sync {
    fn parse_line(&mut self, bytes: &[u8]) -> (GpsMessage, usize);

    fn sync(&self, trigcnt: u32, utc: DateTime<Utc>, gps_seconds: u32, xtal_error: f64) -> TimeRef {
        TimeRef::new(utc, gps_seconds, trigcnt, xtal_error)
    }
}

/// A GPS facade that never produces a fix, for running without
/// hardware attached.
pub struct NullGps;

impl Gps for NullGps {
    fn parse_line(&mut self, _bytes: &[u8]) -> (GpsMessage, usize) {
        (GpsMessage::Incomplete, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_ref() -> TimeRef {
        TimeRef::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(), 1_388_534_418, 1_000_000, 1.0)
    }

    #[test]
    fn cnt2gps_round_trips_gps2cnt() {
        let tref = sample_ref();
        let counter = 1_500_000u32;
        let gps_ms = tref.cnt2gps(counter);
        let back = tref.gps2cnt(gps_ms);
        let err = jit::wrapping_diff(back, counter).unsigned_abs();
        assert!(err <= 1, "round trip error {err}us");
    }

    #[test]
    fn xtal_correct_equals_average_after_init_batch() {
        let mut xcorr = XtalCorrection::default();
        let samples = [1.0001, 1.0002, 0.9999, 1.0000, 1.0003, 1.0001, 0.9998, 1.0002,
                       1.0001, 1.0000, 0.9999, 1.0002, 1.0001, 1.0000, 0.9998, 1.0003];
        assert_eq!(samples.len(), XERR_INIT_AVG);
        for s in samples {
            xcorr.update(s);
        }
        assert!(xcorr.is_ok());
        let expected = samples.iter().sum::<f64>() / XERR_INIT_AVG as f64;
        assert!((xcorr.value() - expected).abs() < 1e-12);
    }

    #[test]
    fn stale_reference_invalidates() {
        let tref = sample_ref().with_captured_at(Instant::now() - Duration::from_secs(31));
        assert!(!tref.is_valid());
    }

    #[test]
    fn fresh_reference_is_valid() {
        let tref = sample_ref();
        assert!(tref.is_valid());
    }

    #[test]
    fn implausible_sample_rejected_once_locked() {
        let mut xcorr = XtalCorrection::default();
        for _ in 0..XERR_INIT_AVG {
            xcorr.update(1.0);
        }
        assert!(xcorr.is_ok());
        assert!(!xcorr.update(2.0));
        assert!((xcorr.value() - 1.0).abs() < 1e-9);
    }
}
