//! XTAL validator worker (spec.md §4.5): every 1s, checks the time
//! reference's age and folds a fresh XTAL error sample into
//! `xtal_correct` once a new PPS edge has been observed.

use crate::agent::Agent;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const CHECK_PERIOD: Duration = Duration::from_secs(1);

pub async fn run(agent: Arc<Agent>, shutdown: triggered::Listener) -> Result<()> {
    let mut ticker = tokio::time::interval(CHECK_PERIOD);
    let mut last_edge: Option<(u32, u32)> = None;

    loop {
        tokio::select! {
            _ = shutdown.clone() => return Ok(()),
            _ = ticker.tick() => {
                if !agent.refresh_gps_validity() {
                    agent.xcorr.lock().expect("xcorr mutex poisoned").reset();
                    last_edge = None;
                    continue;
                }

                let Some(tref) = *agent.time_ref.lock().expect("time_ref mutex poisoned") else {
                    continue;
                };

                match last_edge {
                    Some((last_counter, last_gps)) if last_gps != tref.gps_seconds => {
                        let counter_delta_us = jit::wrapping_diff(tref.counter_at_pps, last_counter) as f64;
                        let gps_delta_us = (tref.gps_seconds as i64 - last_gps as i64) as f64 * 1_000_000.0;
                        if gps_delta_us > 0.0 {
                            let sample = counter_delta_us / gps_delta_us;
                            if !agent.xcorr.lock().expect("xcorr mutex poisoned").update(sample) {
                                warn!(sample, "implausible XTAL error sample rejected");
                            } else {
                                debug!(sample, "XTAL error sample accepted");
                            }
                        }
                        last_edge = Some((tref.counter_at_pps, tref.gps_seconds));
                    }
                    Some(_) => {}
                    None => last_edge = Some((tref.counter_at_pps, tref.gps_seconds)),
                }
            }
        }
    }
}
