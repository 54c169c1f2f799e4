//! Upstream worker: RX packets from the HAL to the network server
//! (spec.md §4.1).

use crate::agent::Agent;
use crate::error::Result;
use crate::packet::{rxpk_json, CrcStatus, RxPkJson};
use crate::protocol::{self, MacAddress, PKT_PUSH_ACK, PROTOCOL_VERSION};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const FETCH_SLEEP: Duration = Duration::from_millis(10);

#[derive(Serialize)]
struct PushDataBody {
    rxpk: Vec<RxPkJson>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stat: Option<crate::packet::StatJson>,
}

pub async fn run(
    agent: Arc<Agent>,
    socket: UdpSocket,
    mac: MacAddress,
    shutdown: triggered::Listener,
) -> Result<()> {
    info!(%mac, "upstream worker starting");
    loop {
        tokio::select! {
            _ = shutdown.clone() => {
                info!("upstream worker shutting down");
                return Ok(());
            }
            result = run_one_cycle(&agent, &socket, mac) => {
                result?;
            }
        }
    }
}

async fn run_one_cycle(agent: &Arc<Agent>, socket: &UdpSocket, mac: MacAddress) -> Result<()> {
    let packets = {
        let hal = agent.hal.lock().await;
        hal.receive(protocol::NB_PKT_MAX).await?
    };

    let cfg = &agent.config.gateway_conf;
    let mut rxpk = Vec::with_capacity(packets.len());
    for pkt in &packets {
        agent.stats_up.update(|c| c.rx_received += 1);
        let crc_ok = matches!(pkt.crc_status, CrcStatus::Ok);
        let crc_bad = matches!(pkt.crc_status, CrcStatus::Bad);
        let crc_none = matches!(pkt.crc_status, CrcStatus::None);
        if crc_ok {
            agent.stats_up.update(|c| c.rx_ok += 1);
        }
        if crc_bad {
            agent.stats_up.update(|c| c.rx_crc_bad += 1);
        }
        let forward = (crc_ok && cfg.forward_crc_valid)
            || (crc_bad && cfg.forward_crc_error)
            || (crc_none && cfg.forward_crc_disabled);
        if !forward {
            continue;
        }

        let (iso_time, tmms) = match *agent.time_ref.lock().expect("time_ref mutex poisoned") {
            Some(tref) if agent.gps_ref_valid() => {
                let utc = tref.cnt2utc(pkt.count_us);
                (Some(utc.to_rfc3339()), Some(tref.cnt2gps(pkt.count_us)))
            }
            _ => (None, None),
        };
        rxpk.push(rxpk_json(pkt, iso_time, tmms));
        agent.stats_up.update(|c| c.rx_forwarded += 1);
    }

    let pending_report = agent.take_pending_report();
    if rxpk.is_empty() && pending_report.is_none() {
        tokio::time::sleep(FETCH_SLEEP).await;
        return Ok(());
    }

    let body = PushDataBody { rxpk, stat: pending_report };
    let json = serde_json::to_vec(&body)?;

    let token = protocol::random_token();
    let mut datagram = Vec::with_capacity(12 + json.len());
    protocol::encode_push_data_header(&mut datagram, token, mac);
    datagram.extend_from_slice(&json);

    if let Err(e) = socket.send(&datagram).await {
        warn!(error = %e, "PUSH_DATA send failed");
        return Ok(());
    }
    agent.stats_up.update(|c| c.push_sent += 1);

    // Half the round-trip budget configured for PUSH_DATA/PUSH_ACK, per
    // spec.md §4.1 (default push_timeout_ms = 100 -> 50ms per attempt).
    let push_ack_timeout = Duration::from_millis((cfg.push_timeout_ms / 2) as u64);

    // Two successive receives catch a duplicated ACK; either counts.
    let mut buf = [0u8; 16];
    for _ in 0..2 {
        match timeout(push_ack_timeout, socket.recv(&mut buf)).await {
            Ok(Ok(n)) if n >= 4 && buf[0] == PROTOCOL_VERSION && buf[3] == PKT_PUSH_ACK => {
                let acked_token = u16::from_be_bytes([buf[1], buf[2]]);
                if acked_token == token {
                    agent.stats_up.update(|c| c.push_acked += 1);
                    debug!(token, "PUSH_ACK received");
                    break;
                }
                warn!(token, acked_token, "PUSH_ACK token mismatch, ignoring");
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "PUSH_ACK recv error");
                break;
            }
            Err(_) => break,
        }
    }
    Ok(())
}
