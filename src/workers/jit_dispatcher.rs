//! JIT dispatcher worker (spec.md §4.3, worker thread 3): every 10ms,
//! for each RF chain, dispatches whichever queued entry has come due.

use crate::agent::Agent;
use crate::error::Result;
use crate::hal::TxStatus;
use jit::PktType;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DISPATCH_PERIOD: Duration = Duration::from_millis(10);
const PEEK_MARGIN_US: u32 = 0;

pub async fn run(agent: Arc<Agent>, shutdown: triggered::Listener) -> Result<()> {
    let mut ticker = tokio::time::interval(DISPATCH_PERIOD);
    loop {
        tokio::select! {
            _ = shutdown.clone() => return Ok(()),
            _ = ticker.tick() => {
                for rf_chain in 0..crate::agent::RF_CHAIN_COUNT {
                    dispatch_chain(&agent, rf_chain).await;
                }
            }
        }
    }
}

async fn dispatch_chain(agent: &Arc<Agent>, rf_chain: usize) {
    let now = match agent.hal.lock().await.instcnt().await {
        Ok(now) => now,
        Err(e) => {
            warn!(error = %e, "instcnt read failed, skipping dispatch cycle");
            return;
        }
    };

    let entry = {
        let mut jit = agent.jit[rf_chain].lock().await;
        let Some(index) = jit.peek(now, PEEK_MARGIN_US) else {
            return;
        };
        jit.dequeue(index)
    };
    let Some(mut entry) = entry else { return };

    // Beacons are generated at the nominal channel frequency; correct for
    // the concentrator's measured XTAL error right before send (spec.md
    // §4.3 "beacon frequency is multiplied by xtal_correct before send").
    if entry.pkt_type == PktType::Beacon {
        let xtal_correct = agent.xcorr.lock().expect("xcorr mutex poisoned").value();
        entry.payload.freq_hz = (entry.payload.freq_hz as f64 * xtal_correct).round() as u32;
    }

    let hal = agent.hal.lock().await;
    match hal.status(rf_chain as u8).await {
        Ok(TxStatus::Emitting) => {
            warn!(rf_chain, "concentrator already emitting, dropping due entry");
            return;
        }
        Ok(TxStatus::Scheduled) => {
            warn!(rf_chain, "overwriting a previously scheduled send");
        }
        Ok(TxStatus::Idle) => {}
        Err(e) => {
            warn!(error = %e, "tx status read failed");
            return;
        }
    }

    if let Err(e) = hal.abort_spectral_scan().await {
        warn!(error = %e, "failed to abort spectral scan before send");
    }

    // Success/failure counters are updated at the actual send call, not
    // at JIT enqueue time (original_source/.../lora_pkt_fwd.c:3506-3512,
    // `meas_nb_tx_ok`/`meas_nb_tx_fail` incremented after `lgw_send`).
    match hal.send(&entry.payload).await {
        Ok(()) => {
            debug!(rf_chain, start = entry.start, "dispatched");
            agent.stats_down.update(|c| c.tx_sent += 1);
        }
        Err(e) => {
            warn!(error = %e, rf_chain, "send failed");
            agent.stats_down.update(|c| c.tx_send_failed += 1);
        }
    }
}
