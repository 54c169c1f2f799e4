//! Downstream worker: keeps the NAT pinhole open, parses PULL_RESP into
//! TX packets, runs the TX admission pipeline, and pre-enqueues
//! upcoming Class B beacons (spec.md §4.2/§4.6).

use crate::agent::Agent;
use crate::error::Result;
use crate::packet::{
    tx_ack_json, Bandwidth, CodingRate, DataRate, Modulation, PullRespJson, TxAckReason, TxMode,
    TxPacket,
};
use crate::protocol::{self, Frame, MacAddress};
use jit::PktType;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const PULL_TIMEOUT: Duration = Duration::from_millis(200);
const MIN_PREAMBLE_LORA: u16 = 6;
const MIN_PREAMBLE_FSK: u16 = 3;
const DEFAULT_PREAMBLE_LORA: u16 = 8;
const DEFAULT_PREAMBLE_FSK: u16 = 5;
/// Minimum spacing between beacons; spec.md §4.6 requires ≥6s.
const MIN_BEACON_PERIOD_SECS: u32 = 6;
const BEACON_DELAY_US: u32 = 1_500;
/// Beacon slots kept pre-enqueued, matching `jit`'s own beacon
/// reservation (DESIGN.md: `JIT_NUM_BEACON_IN_QUEUE = capacity/2`).
const JIT_NUM_BEACON_IN_QUEUE: usize = jit::DEFAULT_CAPACITY / 2;

pub async fn run(
    agent: Arc<Agent>,
    socket: UdpSocket,
    mac: MacAddress,
    shutdown: triggered::Listener,
) -> Result<()> {
    info!(%mac, "downstream worker starting");
    let keepalive = Duration::from_secs(agent.config.gateway_conf.keepalive_interval as u64);
    let autoquit_threshold = agent.config.gateway_conf.autoquit_threshold;
    let mut consecutive_unacked: u32 = 0;

    loop {
        tokio::select! {
            _ = shutdown.clone() => {
                info!("downstream worker shutting down");
                return Ok(());
            }
            acked = run_one_cycle(&agent, &socket, mac) => {
                if acked {
                    consecutive_unacked = 0;
                } else {
                    consecutive_unacked += 1;
                    if autoquit_threshold > 0 && consecutive_unacked >= autoquit_threshold {
                        warn!(consecutive_unacked, "autoquit threshold reached");
                        return Ok(());
                    }
                }
                tokio::time::sleep(keepalive.saturating_sub(PULL_TIMEOUT)).await;
            }
        }
    }
}

/// Sends one PULL_DATA and processes whatever arrives within the
/// receive window. Returns whether the matching PULL_ACK showed up.
async fn run_one_cycle(agent: &Arc<Agent>, socket: &UdpSocket, mac: MacAddress) -> bool {
    try_preenqueue_beacon(agent).await;

    let token = protocol::random_token();
    let datagram = protocol::encode_pull_data(token, mac);
    if let Err(e) = socket.send(&datagram).await {
        warn!(error = %e, "PULL_DATA send failed");
    }
    agent.stats_down.update(|c| c.pull_sent += 1);

    let mut acked = false;
    let deadline = tokio::time::Instant::now() + PULL_TIMEOUT;
    let mut buf = [0u8; protocol::TX_BUFF_SIZE];
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, socket.recv(&mut buf)).await {
            Ok(Ok(n)) => match protocol::parse_frame(&buf[..n]) {
                Ok(Frame::PullAck { token: acked_token }) if acked_token == token => {
                    acked = true;
                    agent.stats_down.update(|c| c.pull_acked += 1);
                }
                Ok(Frame::PullResp { token: resp_token, json }) => {
                    handle_pull_resp(agent, socket, mac, resp_token, json).await;
                }
                Ok(_) => {}
                Err(_) => debug!("ignoring malformed downstream datagram"),
            },
            Ok(Err(e)) => {
                warn!(error = %e, "downstream recv error");
                break;
            }
            Err(_) => break,
        }
    }
    acked
}

async fn handle_pull_resp(agent: &Arc<Agent>, socket: &UdpSocket, mac: MacAddress, token: u16, json: &[u8]) {
    let resp: PullRespJson = match serde_json::from_slice(json) {
        Ok(resp) => resp,
        Err(e) => {
            warn!(error = %e, "PULL_RESP JSON did not parse, dropping silently");
            return;
        }
    };
    agent.stats_down.update(|c| c.tx_requested += 1);

    let outcome = admit(agent, &resp.txpk).await;
    let ack_body = match &outcome {
        Ok(warning) => tx_ack_json(*warning),
        Err(reason) => {
            count_rejection(agent, *reason);
            tx_ack_json(Some(*reason))
        }
    };
    let datagram = protocol::encode_tx_ack(token, mac, ack_body.as_deref());
    if let Err(e) = socket.send(&datagram).await {
        warn!(error = %e, "TX_ACK send failed");
    }
}

fn count_rejection(agent: &Agent, reason: TxAckReason) {
    agent.stats_down.update(|c| match reason {
        TxAckReason::CollisionPacket => c.tx_rejected_collision_packet += 1,
        TxAckReason::CollisionBeacon => c.tx_rejected_collision_beacon += 1,
        TxAckReason::TooLate => c.tx_rejected_too_late += 1,
        TxAckReason::TooEarly => c.tx_rejected_too_early += 1,
        TxAckReason::TxFreq => c.tx_rejected_tx_freq += 1,
        TxAckReason::GpsUnlocked => c.tx_rejected_gps_unlocked += 1,
        TxAckReason::Full => c.tx_rejected_full += 1,
        TxAckReason::TxPower(_) => {}
    });
}

/// Runs the three-stage TX admission pipeline (spec.md §4.2). Returns
/// `Ok(Some(TxAckReason::TxPower(_)))` for a successful-but-downgraded
/// power request, `Ok(None)` for a clean success, or `Err(reason)` for
/// the first failing stage.
async fn admit(
    agent: &Arc<Agent>,
    txpk: &crate::packet::TxPkJson,
) -> std::result::Result<Option<TxAckReason>, TxAckReason> {
    // Timing selector and GPS_UNLOCKED are determined first, matching
    // original_source/.../lora_pkt_fwd.c:3080-3131 (ahead of the
    // freq/power/modulation checks at 3365-3404): a class-B downlink
    // requested while the GPS reference is unlocked is rejected before
    // any radio-chain lookup happens.
    let tx_mode = if txpk.imme == Some(true) {
        TxMode::Immediate
    } else if txpk.tmst.is_some() {
        TxMode::Timestamped
    } else if txpk.tmms.is_some() {
        TxMode::OnGps
    } else {
        return Err(TxAckReason::TooLate);
    };

    let count_us = match tx_mode {
        TxMode::Immediate => now_counter(agent).await,
        TxMode::Timestamped => txpk.tmst.expect("checked above"),
        TxMode::OnGps => {
            if !agent.gps_ref_valid() {
                return Err(TxAckReason::GpsUnlocked);
            }
            let tmms = txpk.tmms.expect("checked above");
            agent
                .time_ref
                .lock()
                .expect("time_ref mutex poisoned")
                .as_ref()
                .expect("gps_ref_valid implies Some")
                .gps2cnt(tmms)
        }
    };

    let rf_chain = txpk.rfch as usize;
    let radio = radio_conf(agent, rf_chain).ok_or(TxAckReason::TxFreq)?;
    if !radio.tx_enable {
        return Err(TxAckReason::TxFreq);
    }
    let freq_hz = (txpk.freq * 1e6).round() as u32;
    let (freq_min, freq_max) = (
        radio.tx_freq_min.unwrap_or(0),
        radio.tx_freq_max.unwrap_or(u32::MAX),
    );
    if !(freq_min..=freq_max).contains(&freq_hz) {
        return Err(TxAckReason::TxFreq);
    }

    let requested_power = txpk.powe.unwrap_or(0) as i8 + agent.config.sx130x_conf.board_conf.antenna_gain as i8;
    let (chosen_power, warning) = choose_power(&radio.tx_gain_lut, requested_power);

    if txpk.data.len() != txpk.size as usize {
        return Err(count_decode_error(crate::error::DecodeError::SizeMismatch));
    }
    let (modulation, bandwidth, datarate, coderate, fdev_khz) =
        decode_modulation(txpk).map_err(count_decode_error)?;

    let preamble = txpk.prea.unwrap_or(match modulation {
        Modulation::Lora => DEFAULT_PREAMBLE_LORA,
        Modulation::Fsk => DEFAULT_PREAMBLE_FSK,
    });
    let preamble = preamble.max(match modulation {
        Modulation::Lora => MIN_PREAMBLE_LORA,
        Modulation::Fsk => MIN_PREAMBLE_FSK,
    });

    let tx_packet = TxPacket {
        count_us,
        tx_mode,
        rf_chain: rf_chain as u8,
        rf_power_dbm: chosen_power,
        freq_hz,
        modulation,
        bandwidth,
        datarate,
        coderate,
        invert_pol: txpk.ipol.unwrap_or(false),
        preamble,
        no_crc: txpk.ncrc.unwrap_or(false),
        no_header: txpk.nhdr.unwrap_or(false),
        fdev_khz,
        payload: txpk.data.clone(),
    };

    let pkt_type = match tx_mode {
        TxMode::Immediate => PktType::DownlinkClassC,
        TxMode::Timestamped => PktType::DownlinkClassA,
        TxMode::OnGps => PktType::DownlinkClassB,
    };

    let duration_us = tx_packet.time_on_air_us();
    let now = now_counter(agent).await;
    {
        let mut jit = agent.jit[rf_chain].lock().await;
        jit.enqueue(now, count_us, duration_us, pkt_type, tx_packet)
            .map_err(map_jit_error)?;
    }

    Ok(warning)
}

fn map_jit_error(err: jit::JitError) -> TxAckReason {
    match err {
        jit::JitError::Full => TxAckReason::Full,
        jit::JitError::CollisionPacket => TxAckReason::CollisionPacket,
        jit::JitError::CollisionBeacon => TxAckReason::CollisionBeacon,
        jit::JitError::TooLate => TxAckReason::TooLate,
        jit::JitError::TooEarly => TxAckReason::TooEarly,
    }
}

fn radio_conf(agent: &Agent, rf_chain: usize) -> Option<&crate::config::RadioConf> {
    match rf_chain {
        0 => agent.config.sx130x_conf.radio_0.as_ref(),
        1 => agent.config.sx130x_conf.radio_1.as_ref(),
        _ => None,
    }
}

fn choose_power(lut: &[crate::config::TxGainLutEntry], requested: i8) -> (i8, Option<TxAckReason>) {
    let best = lut
        .iter()
        .filter(|e| e.rf_power <= requested)
        .max_by_key(|e| e.rf_power)
        .or_else(|| lut.iter().min_by_key(|e| e.rf_power));
    match best {
        None => (requested, None),
        Some(entry) if entry.rf_power == requested => (requested, None),
        Some(entry) => (entry.rf_power, Some(TxAckReason::TxPower(entry.rf_power as i32))),
    }
}

fn decode_modulation(
    txpk: &crate::packet::TxPkJson,
) -> std::result::Result<(Modulation, Bandwidth, DataRate, CodingRate, Option<u8>), crate::error::DecodeError> {
    use crate::error::DecodeError;
    let datarate = DataRate::from_wire(&txpk.datr)?;
    let (modulation, bandwidth) = match (&txpk.modu[..], datarate) {
        ("LORA", DataRate::Lora { bandwidth, .. }) => (Modulation::Lora, bandwidth),
        ("FSK", DataRate::Fsk { .. }) => (Modulation::Fsk, Bandwidth::Bw125),
        _ => return Err(DecodeError::InvalidModulation(txpk.modu.clone())),
    };
    let coderate = match txpk.codr.as_deref() {
        Some(s) => CodingRate::from_wire(s)?,
        None if matches!(modulation, Modulation::Fsk) => CodingRate::Off,
        None => return Err(DecodeError::missing_field("codr")),
    };
    // fdev is mandatory for FSK (wire value in Hz, truncated to kHz for the radio).
    let fdev_khz = match modulation {
        Modulation::Fsk => Some((txpk.fdev.ok_or(DecodeError::missing_field("fdev"))? / 1000) as u8),
        Modulation::Lora => None,
    };
    Ok((modulation, bandwidth, datarate, coderate, fdev_khz))
}

/// Logs a decode failure and folds it into the `TX_FREQ` wire tag, since
/// Semtech's TX_ACK tag set has no dedicated "bad payload" reason (see
/// DESIGN.md's `fdev` open-question decision for the same convention).
fn count_decode_error(err: crate::error::DecodeError) -> TxAckReason {
    warn!(error = %err, "PULL_RESP txpk decode failed");
    TxAckReason::TxFreq
}

async fn now_counter(agent: &Agent) -> u32 {
    agent.hal.lock().await.instcnt().await.unwrap_or(0)
}

/// Keeps the JIT queue topped up with upcoming beacons when Class B
/// service is enabled (spec.md §4.6).
async fn try_preenqueue_beacon(agent: &Agent) {
    let period = agent.config.gateway_conf.beacon_period;
    if period == 0 || period < MIN_BEACON_PERIOD_SECS {
        return;
    }
    if !agent.gps_ref_valid() || !agent.xcorr.lock().expect("xcorr mutex poisoned").is_ok() {
        return;
    }

    // Tops up to JIT_NUM_BEACON_IN_QUEUE slots in one pass, matching the
    // original's `beacon_loop = JIT_NUM_BEACON_IN_QUEUE -
    // jit_queue[0].num_beacon; while (beacon_loop && beacon_period != 0)`
    // (original_source/.../lora_pkt_fwd.c:2920-3000).
    let Some(tref) = *agent.time_ref.lock().expect("time_ref mutex poisoned") else { return };
    let current_gps_s = tref.gps_seconds;
    let mut next_slot = (current_gps_s / period) * period + period;

    loop {
        let current = agent.jit[0].lock().await.num_beacon();
        if current >= JIT_NUM_BEACON_IN_QUEUE {
            return;
        }

        let now = now_counter(agent).await;
        let sf = beacon_spreading_factor(agent.config.gateway_conf.beacon_datarate);
        let payload = match beacon::build_payload(
            sf,
            next_slot,
            agent.config.gateway_conf.beacon_infodesc,
            agent.config.gateway_conf.ref_latitude,
            agent.config.gateway_conf.ref_longitude,
        ) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "beacon payload build failed");
                return;
            }
        };

        let start = tref.gps2cnt(next_slot as u64 * 1000).wrapping_add(BEACON_DELAY_US);
        let freq_hz = beacon_channel_freq(&agent.config.gateway_conf, next_slot, period);
        let tx_packet = TxPacket {
            count_us: start,
            tx_mode: TxMode::OnGps,
            rf_chain: 0,
            rf_power_dbm: agent.config.gateway_conf.beacon_power,
            freq_hz,
            modulation: Modulation::Lora,
            bandwidth: beacon_bandwidth(agent.config.gateway_conf.beacon_bw_hz),
            datarate: DataRate::Lora {
                spreading_factor: agent.config.gateway_conf.beacon_datarate,
                bandwidth: beacon_bandwidth(agent.config.gateway_conf.beacon_bw_hz),
            },
            coderate: CodingRate::Cr4_5,
            invert_pol: false,
            preamble: 10,
            no_crc: true,
            no_header: true,
            fdev_khz: None,
            payload,
        };

        let duration_us = tx_packet.time_on_air_us();
        let mut jit = agent.jit[0].lock().await;
        match jit.enqueue(now, start, duration_us, PktType::Beacon, tx_packet) {
            Ok(()) => {
                debug!(slot = next_slot, "beacon pre-enqueued");
                next_slot += period;
            }
            Err(jit::JitError::CollisionPacket) | Err(jit::JitError::CollisionBeacon) => {
                next_slot += period;
            }
            Err(e) => {
                warn!(error = %e, "beacon enqueue failed");
                return;
            }
        }
    }
}

/// Picks the beacon's transmit frequency for the slot at `gps_seconds`,
/// hopping across `beacon_freq_nb` channels spaced `beacon_freq_step` Hz
/// apart starting at `beacon_freq_hz` (spec.md §2 "channel hopping").
/// The channel index is the beacon's slot number modulo the channel
/// count, matching the reference forwarder's `beacon_chan` cycling.
fn beacon_channel_freq(cfg: &crate::config::GatewayConf, gps_seconds: u32, period: u32) -> u32 {
    let base = cfg.beacon_freq_hz.unwrap_or(0);
    let freq_nb = cfg.beacon_freq_nb as u64;
    if freq_nb <= 1 {
        return base;
    }
    let slot = gps_seconds as u64 / period as u64;
    let chan = slot % freq_nb;
    base + chan as u32 * cfg.beacon_freq_step
}

fn beacon_spreading_factor(sf: u8) -> beacon::BeaconSf {
    match sf {
        8 => beacon::BeaconSf::Sf8,
        9 => beacon::BeaconSf::Sf9,
        10 => beacon::BeaconSf::Sf10,
        _ => beacon::BeaconSf::Sf12,
    }
}

fn beacon_bandwidth(hz: u32) -> Bandwidth {
    match hz {
        250_000 => Bandwidth::Bw250,
        500_000 => Bandwidth::Bw500,
        _ => Bandwidth::Bw125,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TxGainLutEntry;

    #[test]
    fn choose_power_exact_match() {
        let lut = vec![
            TxGainLutEntry { rf_power: 14, pa_gain: 1, dig_gain: None },
            TxGainLutEntry { rf_power: 20, pa_gain: 2, dig_gain: None },
        ];
        assert_eq!(choose_power(&lut, 20), (20, None));
    }

    #[test]
    fn choose_power_downgrades_and_warns() {
        let lut = vec![
            TxGainLutEntry { rf_power: 14, pa_gain: 1, dig_gain: None },
            TxGainLutEntry { rf_power: 20, pa_gain: 2, dig_gain: None },
        ];
        let (power, warning) = choose_power(&lut, 27);
        assert_eq!(power, 20);
        assert_eq!(warning, Some(TxAckReason::TxPower(20)));
    }

    fn gw_conf_with_hopping() -> crate::config::GatewayConf {
        let json = serde_json::json!({
            "gateway_ID": "0011223344556677",
            "beacon_freq_hz": 869_525_000u32,
            "beacon_freq_nb": 8,
            "beacon_freq_step": 100_000u32,
        });
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn beacon_channel_hops_across_slots() {
        let cfg = gw_conf_with_hopping();
        let period = 128;
        let f0 = beacon_channel_freq(&cfg, 0, period);
        let f1 = beacon_channel_freq(&cfg, period, period);
        assert_eq!(f0, 869_525_000);
        assert_eq!(f1, 869_625_000);
    }

    #[test]
    fn beacon_channel_fixed_when_no_hopping_configured() {
        let json = serde_json::json!({
            "gateway_ID": "0011223344556677",
            "beacon_freq_hz": 869_525_000u32,
        });
        let cfg: crate::config::GatewayConf = serde_json::from_value(json).unwrap();
        assert_eq!(beacon_channel_freq(&cfg, 128, 128), 869_525_000);
        assert_eq!(beacon_channel_freq(&cfg, 256, 128), 869_525_000);
    }
}
