//! The shared agent handle: every module-level global the original
//! packet forwarder kept as a free C global becomes a field here
//! (spec.md §9), behind the mutex named in spec.md §5.

use crate::config::Config;
use crate::gps::{GpsMessage, TimeRef, XtalCorrection};
use crate::hal::Hal;
use crate::packet::{StatJson, TxPacket};
use jit::JitQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use crate::stats::{CounterGroup, DownstreamCounters, GpsCounters, UpstreamCounters};

pub const RF_CHAIN_COUNT: usize = 2;

/// A pending status report, produced by the statistics loop and
/// consumed by Upstream on its next PUSH_DATA (spec.md §4.7).
#[derive(Default)]
pub struct PendingReport {
    pub json: Option<StatJson>,
}

pub struct Agent {
    pub config: Config,
    pub hal: tokio::sync::Mutex<Box<dyn Hal>>,
    pub time_ref: Mutex<Option<TimeRef>>,
    gps_ref_valid: AtomicBool,
    pub xcorr: Mutex<XtalCorrection>,
    pub stats_up: CounterGroup<UpstreamCounters>,
    pub stats_down: CounterGroup<DownstreamCounters>,
    pub stats_gps: CounterGroup<GpsCounters>,
    pub report: Mutex<PendingReport>,
    report_ready: AtomicBool,
    pub jit: [tokio::sync::Mutex<JitQueue<TxPacket>>; RF_CHAIN_COUNT],
    pub last_gps_fix: Mutex<Option<(f64, f64)>>,
}

impl Agent {
    pub fn new(config: Config, hal: Box<dyn Hal>) -> Self {
        let capacity = jit::DEFAULT_CAPACITY;
        Agent {
            config,
            hal: tokio::sync::Mutex::new(hal),
            time_ref: Mutex::new(None),
            gps_ref_valid: AtomicBool::new(false),
            xcorr: Mutex::new(XtalCorrection::default()),
            stats_up: CounterGroup::new(),
            stats_down: CounterGroup::new(),
            stats_gps: CounterGroup::new(),
            report: Mutex::new(PendingReport::default()),
            report_ready: AtomicBool::new(false),
            jit: [JitQueue::new(capacity), JitQueue::new(capacity)].map(tokio::sync::Mutex::new),
            last_gps_fix: Mutex::new(None),
        }
    }

    pub fn gps_ref_valid(&self) -> bool {
        self.gps_ref_valid.load(Ordering::Acquire)
    }

    /// Installs a fresh `TimeRef` from a GPS sync and marks the
    /// reference valid. The caller takes `mx_timeref` for the duration
    /// via this call.
    pub fn set_time_ref(&self, time_ref: TimeRef) {
        *self.time_ref.lock().expect("time_ref mutex poisoned") = Some(time_ref);
        self.gps_ref_valid.store(true, Ordering::Release);
    }

    /// Re-checks the current reference's age and flips `gps_ref_valid`
    /// if it has gone stale (spec.md §8: "age > 30s ⇒ not valid").
    pub fn refresh_gps_validity(&self) -> bool {
        let valid = self
            .time_ref
            .lock()
            .expect("time_ref mutex poisoned")
            .as_ref()
            .is_some_and(TimeRef::is_valid);
        self.gps_ref_valid.store(valid, Ordering::Release);
        valid
    }

    pub fn record_gps_fix(&self, msg: &GpsMessage) {
        if let GpsMessage::Rmc { latitude, longitude } = msg {
            *self.last_gps_fix.lock().expect("gps fix mutex poisoned") = Some((*latitude, *longitude));
        }
    }

    pub fn set_pending_report(&self, json: StatJson) {
        self.report.lock().expect("report mutex poisoned").json = Some(json);
        self.report_ready.store(true, Ordering::Release);
    }

    /// Takes the pending report, if any, clearing `report_ready`. Meant
    /// to be called once per Upstream PUSH_DATA cycle.
    pub fn take_pending_report(&self) -> Option<StatJson> {
        if !self.report_ready.swap(false, Ordering::AcqRel) {
            return None;
        }
        self.report.lock().expect("report mutex poisoned").json.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::NullHal;

    fn test_config() -> Config {
        let json = serde_json::json!({
            "SX130x_conf": { "board_conf": { "com_path": "/dev/null" } },
            "gateway_conf": { "gateway_ID": "0011223344556677" }
        });
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn report_ready_flips_on_set_and_clears_on_take() {
        let agent = Agent::new(test_config(), Box::new(NullHal));
        assert!(agent.take_pending_report().is_none());
        agent.set_pending_report(StatJson {
            time: "t".into(),
            lati: None,
            long: None,
            alti: None,
            rxnb: 0,
            rxok: 0,
            rxfw: 0,
            ackr: 100.0,
            dwnb: 0,
            txnb: 0,
        });
        assert!(agent.take_pending_report().is_some());
        assert!(agent.take_pending_report().is_none());
    }

    #[test]
    fn gps_ref_invalid_until_set() {
        let agent = Agent::new(test_config(), Box::new(NullHal));
        assert!(!agent.gps_ref_valid());
    }
}
