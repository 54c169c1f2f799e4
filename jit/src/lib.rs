//! Just-In-Time (JIT) transmit queue for a single RF chain.
//!
//! Holds a small, time-ordered, bounded set of packets awaiting
//! transmission on the concentrator and admits new ones by checking
//! timing and collision constraints against what is already queued.
//! The concentrator counter this queue orders against is a free-running
//! 32-bit microsecond counter, so all comparisons go through
//! [`wrapping_diff`] rather than plain `u32` subtraction.

use std::cmp::Ordering;

/// Default minimum lead time (in concentrator-counter microseconds)
/// between "now" and a packet's scheduled start, matching the reference
/// packet forwarder's `TX_START_DELAY`.
pub const DEFAULT_MIN_TX_START_DELAY_US: u32 = 1_500;
/// Default maximum lead time a packet may be scheduled ahead of "now".
pub const DEFAULT_MAX_ADVANCE_US: u32 = 180_000_000;
/// Default collision margin applied around every queued interval.
pub const DEFAULT_MARGIN_US: u32 = 1_000;
/// Default queue capacity per RF chain.
pub const DEFAULT_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PktType {
    Beacon,
    DownlinkClassA,
    DownlinkClassB,
    DownlinkClassC,
}

impl PktType {
    fn is_beacon(self) -> bool {
        matches!(self, PktType::Beacon)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JitError {
    #[error("queue is full")]
    Full,
    #[error("collides with an already-scheduled packet")]
    CollisionPacket,
    #[error("collides with an already-scheduled beacon")]
    CollisionBeacon,
    #[error("too late to schedule")]
    TooLate,
    #[error("too early to schedule")]
    TooEarly,
}

/// A queued packet plus the timing window it occupies.
#[derive(Debug, Clone)]
pub struct JitEntry<T> {
    pub start: u32,
    pub end: u32,
    pub pkt_type: PktType,
    pub payload: T,
}

/// Returns `a - b` interpreted as a signed 32-bit quantity, tolerating
/// wraparound of the underlying free-running microsecond counter: values
/// more than `i32::MAX` apart cannot be ordered meaningfully, which
/// matches the counter's own wrap period.
pub fn wrapping_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

fn before(a: u32, b: u32) -> bool {
    wrapping_diff(a, b) < 0
}

pub struct JitQueue<T> {
    capacity: usize,
    min_start_delay_us: u32,
    max_advance_us: u32,
    margin_us: u32,
    entries: Vec<JitEntry<T>>,
    num_beacon: usize,
}

impl<T> JitQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            min_start_delay_us: DEFAULT_MIN_TX_START_DELAY_US,
            max_advance_us: DEFAULT_MAX_ADVANCE_US,
            margin_us: DEFAULT_MARGIN_US,
            entries: Vec::new(),
            num_beacon: 0,
        }
    }

    pub fn with_params(
        capacity: usize,
        min_start_delay_us: u32,
        max_advance_us: u32,
        margin_us: u32,
    ) -> Self {
        Self {
            capacity,
            min_start_delay_us,
            max_advance_us,
            margin_us,
            entries: Vec::new(),
            num_beacon: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn num_beacon(&self) -> usize {
        self.num_beacon
    }

    /// Attempts to admit `payload`, occupying `[start, start+duration_us)`
    /// at `now`. On success the entry is inserted in time order.
    pub fn enqueue(
        &mut self,
        now: u32,
        start: u32,
        duration_us: u32,
        pkt_type: PktType,
        payload: T,
    ) -> Result<(), JitError> {
        let end = start.wrapping_add(duration_us);

        let delay = wrapping_diff(start, now);
        if delay < self.min_start_delay_us as i32 {
            return Err(JitError::TooLate);
        }
        if delay > self.max_advance_us as i32 {
            return Err(JitError::TooEarly);
        }

        let margined_start = start.wrapping_sub(self.margin_us);
        let margined_end = end.wrapping_add(self.margin_us);
        for existing in &self.entries {
            if intervals_overlap(margined_start, margined_end, existing.start, existing.end) {
                if pkt_type.is_beacon() || existing.pkt_type.is_beacon() {
                    return Err(JitError::CollisionBeacon);
                }
                return Err(JitError::CollisionPacket);
            }
        }

        if self.entries.len() >= self.capacity {
            return Err(JitError::Full);
        }
        // Reserve half the queue for beacons: once non-beacon occupancy
        // reaches that reservation, further non-beacon packets are refused
        // even though raw capacity remains, so a late beacon can still slot
        // in. Matches JIT_NUM_BEACON_IN_QUEUE = capacity/2 in the reference
        // packet forwarder.
        if !pkt_type.is_beacon() {
            let reserved_for_beacon = self.capacity / 2;
            let non_beacon_count = self.entries.len() - self.num_beacon;
            if non_beacon_count >= self.capacity.saturating_sub(reserved_for_beacon) {
                return Err(JitError::Full);
            }
        }

        let entry = JitEntry {
            start,
            end,
            pkt_type,
            payload,
        };
        let pos = self
            .entries
            .iter()
            .position(|e| before(start, e.start))
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, entry);
        if pkt_type.is_beacon() {
            self.num_beacon += 1;
        }
        Ok(())
    }

    /// Returns the index of the earliest entry whose start has arrived
    /// (`now + peek_margin_us >= entry.start`), if any.
    pub fn peek(&self, now: u32, peek_margin_us: u32) -> Option<usize> {
        self.entries.iter().position(|e| {
            let horizon = now.wrapping_add(peek_margin_us);
            !before(horizon, e.start)
        })
    }

    /// Removes and returns the entry at `index`, compacting the queue.
    pub fn dequeue(&mut self, index: usize) -> Option<JitEntry<T>> {
        if index >= self.entries.len() {
            return None;
        }
        let entry = self.entries.remove(index);
        if entry.pkt_type.is_beacon() {
            self.num_beacon = self.num_beacon.saturating_sub(1);
        }
        Some(entry)
    }
}

/// Overlap test for two `[start, end)` windows expressed on the
/// free-running counter. Both windows are translated relative to
/// `a_start` so the comparison reduces to ordinary signed arithmetic;
/// this is valid as long as no window plus margin spans more than half
/// the counter's range, which always holds for real packet durations.
fn intervals_overlap(a_start: u32, a_end: u32, b_start: u32, b_end: u32) -> bool {
    let rel_a_end = wrapping_diff(a_end, a_start) as i64;
    let rel_b_start = wrapping_diff(b_start, a_start) as i64;
    let rel_b_end = wrapping_diff(b_end, a_start) as i64;
    rel_b_start < rel_a_end && 0 < rel_b_end
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeRate {
    Cr4_5,
    Cr4_6,
    Cr4_7,
    Cr4_8,
}

impl CodeRate {
    fn numerator_denominator(self) -> (u32, u32) {
        match self {
            CodeRate::Cr4_5 => (4, 5),
            CodeRate::Cr4_6 => (4, 6),
            CodeRate::Cr4_7 => (4, 7),
            CodeRate::Cr4_8 => (4, 8),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Modulation {
    Lora {
        spreading_factor: u32,
        bandwidth_hz: u32,
        coderate: CodeRate,
        preamble_symbols: u32,
        explicit_header: bool,
    },
    Fsk {
        bitrate_bps: u32,
        preamble_bytes: u32,
    },
}

/// Time-on-air, in microseconds, for `payload_len` bytes sent with
/// `modulation`. The LoRa branch is the closed-form formula from
/// Semtech AN1200.13; the FSK branch is a straight bitrate computation.
pub fn time_on_air_us(modulation: Modulation, payload_len: usize) -> u32 {
    match modulation {
        Modulation::Lora {
            spreading_factor,
            bandwidth_hz,
            coderate,
            preamble_symbols,
            explicit_header,
        } => {
            let symbol_duration_us = (1u64 << spreading_factor) as f64 * 1_000_000.0 / bandwidth_hz as f64;
            let low_dr_opt = bandwidth_hz <= 125_000 && spreading_factor >= 11;
            let (cr_num, _cr_den) = coderate.numerator_denominator();
            let eh = if explicit_header { 1i64 } else { 0i64 };
            let ldo = if low_dr_opt { 1i64 } else { 0i64 };
            let numerator = 8 * payload_len as i64 - 4 * spreading_factor as i64 + 28 + 16 - 20 * (1 - eh);
            let denominator = 4 * (spreading_factor as i64 - 2 * ldo);
            let payload_symbols =
                8 + (numerator as f64 / denominator as f64).ceil().max(0.0) as i64 * cr_num as i64;
            let total_symbols = 4.25 + preamble_symbols as f64 + payload_symbols as f64;
            (symbol_duration_us * total_symbols).round() as u32
        }
        Modulation::Fsk {
            bitrate_bps,
            preamble_bytes,
        } => {
            let total_bytes = preamble_bytes as u64 + payload_len as u64 + 1 /* sync word */;
            ((total_bytes * 8 * 1_000_000) / bitrate_bps.max(1) as u64) as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lora_sf7_bw125() -> Modulation {
        Modulation::Lora {
            spreading_factor: 7,
            bandwidth_hz: 125_000,
            coderate: CodeRate::Cr4_5,
            preamble_symbols: 8,
            explicit_header: true,
        }
    }

    #[test]
    fn time_on_air_matches_known_values() {
        // Cross-checked against the public LoRa airtime calculator, ms precision.
        let toa = time_on_air_us(lora_sf7_bw125(), 12);
        assert!((40_000..46_000).contains(&toa), "got {toa}");
    }

    #[test]
    fn accepts_entry_at_exactly_min_start_delay() {
        let mut q: JitQueue<u8> = JitQueue::new(DEFAULT_CAPACITY);
        let now = 1_000_000u32;
        let start = now + DEFAULT_MIN_TX_START_DELAY_US;
        assert!(q.enqueue(now, start, 1000, PktType::DownlinkClassA, 0).is_ok());
    }

    #[test]
    fn rejects_entry_one_us_short_of_min_start_delay() {
        let mut q: JitQueue<u8> = JitQueue::new(DEFAULT_CAPACITY);
        let now = 1_000_000u32;
        let start = now + DEFAULT_MIN_TX_START_DELAY_US - 1;
        assert_eq!(
            q.enqueue(now, start, 1000, PktType::DownlinkClassA, 0),
            Err(JitError::TooLate)
        );
    }

    #[test]
    fn rejects_entry_beyond_max_advance() {
        let mut q: JitQueue<u8> = JitQueue::new(DEFAULT_CAPACITY);
        let now = 0u32;
        let start = now + DEFAULT_MAX_ADVANCE_US + 1;
        assert_eq!(
            q.enqueue(now, start, 1000, PktType::DownlinkClassA, 0),
            Err(JitError::TooEarly)
        );
    }

    #[test]
    fn wraps_the_free_running_counter() {
        let mut q: JitQueue<u8> = JitQueue::with_params(DEFAULT_CAPACITY, 0, DEFAULT_MAX_ADVANCE_US, 0);
        let now = 0xFFFF_FFF0u32;
        let start = 0xFFFF_FFFEu32;
        assert!(q.enqueue(now, start, 10, PktType::DownlinkClassA, 0).is_ok());
        // 14us before wrap; peeking just before the start is not due yet.
        assert_eq!(q.peek(now, 0), None);
        // Advance virtual time 14us past now, landing exactly at start (post-wrap).
        let later = now.wrapping_add(14);
        assert_eq!(q.peek(later, 0), Some(0));
    }

    #[test]
    fn detects_collision_between_two_packets() {
        let mut q: JitQueue<u8> = JitQueue::with_params(DEFAULT_CAPACITY, 0, DEFAULT_MAX_ADVANCE_US, 100);
        let now = 0u32;
        q.enqueue(now, 10_000, 1000, PktType::DownlinkClassA, 0).unwrap();
        let result = q.enqueue(now, 10_500, 1000, PktType::DownlinkClassA, 1);
        assert_eq!(result, Err(JitError::CollisionPacket));
    }

    #[test]
    fn beacon_collision_reported_even_against_downlink() {
        let mut q: JitQueue<u8> = JitQueue::with_params(DEFAULT_CAPACITY, 0, DEFAULT_MAX_ADVANCE_US, 100);
        let now = 0u32;
        q.enqueue(now, 10_000, 1000, PktType::Beacon, 0).unwrap();
        let result = q.enqueue(now, 10_200, 1000, PktType::DownlinkClassA, 1);
        assert_eq!(result, Err(JitError::CollisionBeacon));
    }

    #[test]
    fn full_queue_rejects_further_enqueues() {
        let mut q: JitQueue<u8> = JitQueue::with_params(1, 0, DEFAULT_MAX_ADVANCE_US, 0);
        let now = 0u32;
        q.enqueue(now, 10_000, 1000, PktType::DownlinkClassA, 0).unwrap();
        let result = q.enqueue(now, 100_000, 1000, PktType::DownlinkClassA, 1);
        assert_eq!(result, Err(JitError::Full));
    }

    #[test]
    fn dequeue_compacts_and_updates_beacon_count() {
        let mut q: JitQueue<u8> = JitQueue::with_params(DEFAULT_CAPACITY, 0, DEFAULT_MAX_ADVANCE_US, 0);
        let now = 0u32;
        q.enqueue(now, 10_000, 1000, PktType::Beacon, 0).unwrap();
        q.enqueue(now, 50_000, 1000, PktType::DownlinkClassA, 1).unwrap();
        assert_eq!(q.num_beacon(), 1);
        let entry = q.dequeue(0).unwrap();
        assert_eq!(entry.payload, 0);
        assert_eq!(q.num_beacon(), 0);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn entries_ordered_by_start_time() {
        let mut q: JitQueue<u8> = JitQueue::with_params(DEFAULT_CAPACITY, 0, DEFAULT_MAX_ADVANCE_US, 0);
        let now = 0u32;
        q.enqueue(now, 50_000, 1000, PktType::DownlinkClassA, 1).unwrap();
        q.enqueue(now, 10_000, 1000, PktType::DownlinkClassA, 0).unwrap();
        assert_eq!(q.peek(10_000, 0), Some(0));
    }
}
