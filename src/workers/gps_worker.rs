//! GPS sync worker (spec.md §4.4): streams bytes from the GPS device,
//! feeds them to the external NMEA/UBX parser, and on each
//! synchronising frame refreshes `TimeRef`.

use crate::agent::Agent;
use crate::error::Result;
use crate::gps::{Gps, GpsMessage};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

const RING_BUFFER_SIZE: usize = 128;

pub async fn run<R: AsyncRead + Unpin>(
    agent: Arc<Agent>,
    mut reader: R,
    mut gps: impl Gps,
    shutdown: triggered::Listener,
) -> Result<()> {
    let mut ring = Vec::with_capacity(RING_BUFFER_SIZE);
    let mut chunk = [0u8; RING_BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = shutdown.clone() => return Ok(()),
            read = reader.read(&mut chunk) => {
                let n = match read {
                    Ok(0) => return Ok(()),
                    Ok(n) => n,
                    Err(e) => {
                        warn!(error = %e, "GPS device read error");
                        continue;
                    }
                };
                ring.extend_from_slice(&chunk[..n]);
                if ring.len() > RING_BUFFER_SIZE {
                    let overflow = ring.len() - RING_BUFFER_SIZE;
                    ring.drain(0..overflow);
                }

                process_buffer(&agent, &mut ring, &mut gps).await;
            }
        }
    }
}

async fn process_buffer(agent: &Agent, ring: &mut Vec<u8>, gps: &mut impl Gps) {
    loop {
        if ring.is_empty() {
            return;
        }
        let (message, consumed) = gps.parse_line(ring);
        match message {
            GpsMessage::Incomplete => return,
            GpsMessage::Invalid => {
                agent.stats_gps.update(|c| c.frames_invalid += 1);
                ring.drain(0..consumed.max(1));
            }
            GpsMessage::NavTimeGps { utc, gps_seconds } => {
                agent.stats_gps.update(|c| c.frames_parsed += 1);
                ring.drain(0..consumed);
                let trigcnt = match agent.hal.lock().await.trigcnt().await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(error = %e, "trigcnt read failed, dropping GPS sync");
                        agent.stats_gps.update(|c| c.syncs_rejected += 1);
                        continue;
                    }
                };
                let xtal_error = agent.xcorr.lock().expect("xcorr mutex poisoned").value();
                let time_ref = gps.sync(trigcnt, utc, gps_seconds, xtal_error);
                agent.set_time_ref(time_ref);
                agent.stats_gps.update(|c| c.syncs_accepted += 1);
                debug!(gps_seconds, "GPS time reference updated");
            }
            GpsMessage::Rmc { .. } => {
                agent.stats_gps.update(|c| c.frames_parsed += 1);
                ring.drain(0..consumed);
                agent.record_gps_fix(&message);
            }
        }
    }
}
