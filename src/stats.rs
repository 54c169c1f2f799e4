//! Statistics counters (spec.md §3/§4.7), split into per-domain groups.
//! Each group is a plain struct behind its own `std::sync::Mutex` so a
//! snapshot-and-reset is one atomic critical section, never a set of
//! independently-racing atomics (spec.md §8: "counters reset to zero
//! atomically").

use crate::packet::StatJson;
use std::sync::Mutex;

#[derive(Debug, Default, Clone, Copy)]
pub struct UpstreamCounters {
    pub rx_received: u32,
    pub rx_ok: u32,
    pub rx_forwarded: u32,
    pub rx_crc_bad: u32,
    pub push_sent: u32,
    pub push_acked: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DownstreamCounters {
    pub pull_sent: u32,
    pub pull_acked: u32,
    pub tx_requested: u32,
    pub tx_sent: u32,
    pub tx_send_failed: u32,
    pub tx_rejected_collision_packet: u32,
    pub tx_rejected_collision_beacon: u32,
    pub tx_rejected_too_late: u32,
    pub tx_rejected_too_early: u32,
    pub tx_rejected_full: u32,
    pub tx_rejected_tx_freq: u32,
    pub tx_rejected_gps_unlocked: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GpsCounters {
    pub frames_parsed: u32,
    pub frames_invalid: u32,
    pub syncs_accepted: u32,
    pub syncs_rejected: u32,
}

/// One independently-mutexed counter group (`mx_meas_up`, `mx_meas_dw`,
/// or `mx_meas_gps` in spec.md §5).
#[derive(Debug, Default)]
pub struct CounterGroup<T> {
    inner: Mutex<T>,
}

impl<T: Copy + Default> CounterGroup<T> {
    pub fn new() -> Self {
        CounterGroup { inner: Mutex::new(T::default()) }
    }

    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut guard = self.inner.lock().expect("counter mutex poisoned");
        f(&mut guard);
    }

    pub fn snapshot_and_reset(&self) -> T {
        let mut guard = self.inner.lock().expect("counter mutex poisoned");
        std::mem::take(&mut *guard)
    }
}

/// Assembles the periodic `stat` JSON object (spec.md §4.7). `location`
/// carries `(lat, lon, alt)` when GPS is valid or fake-GPS is enabled;
/// `None` omits the location fields entirely.
pub fn build_report(
    iso_time: String,
    location: Option<(f64, f64, i32)>,
    up: &UpstreamCounters,
    down: &DownstreamCounters,
) -> StatJson {
    // ackr is the upstream PUSH_DATA/PUSH_ACK ratio, not a TX-side ratio
    // (original_source/.../lora_pkt_fwd.c:1942-1945,2062-2064:
    // `up_ack_ratio = cp_up_ack_rcv / cp_up_dgram_sent`, defaulting to 0.0
    // rather than 100.0 when nothing has been sent yet).
    let ackr = if up.push_sent > 0 {
        100.0 * up.push_acked as f32 / up.push_sent as f32
    } else {
        0.0
    };
    let (lati, long, alti) = match location {
        Some((lat, lon, alt)) => (Some(lat), Some(lon), Some(alt)),
        None => (None, None, None),
    };
    StatJson {
        time: iso_time,
        lati,
        long,
        alti,
        rxnb: up.rx_received,
        rxok: up.rx_ok,
        rxfw: up.rx_forwarded,
        ackr,
        dwnb: down.tx_requested,
        txnb: down.tx_sent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_resets_to_zero() {
        let group: CounterGroup<UpstreamCounters> = CounterGroup::new();
        group.update(|c| c.rx_received = 5);
        let snap = group.snapshot_and_reset();
        assert_eq!(snap.rx_received, 5);
        assert_eq!(group.snapshot_and_reset().rx_received, 0);
    }

    #[test]
    fn ackr_is_zero_percent_with_nothing_sent() {
        let up = UpstreamCounters::default();
        let down = DownstreamCounters::default();
        let report = build_report("t".into(), None, &up, &down);
        assert_eq!(report.ackr, 0.0);
        assert!(report.lati.is_none());
    }

    #[test]
    fn location_included_when_provided() {
        let up = UpstreamCounters {
            rx_received: 1,
            rx_ok: 1,
            rx_forwarded: 1,
            push_sent: 2,
            push_acked: 1,
            ..Default::default()
        };
        let down = DownstreamCounters { tx_requested: 2, tx_sent: 1, ..Default::default() };
        let report = build_report("t".into(), Some((1.0, 2.0, 3)), &up, &down);
        assert_eq!(report.ackr, 50.0);
        assert_eq!(report.lati, Some(1.0));
        assert_eq!(report.alti, Some(3));
    }
}
