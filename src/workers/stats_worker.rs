//! Statistics loop (spec.md §4.7): snapshots every counter group and
//! hands the assembled report to Upstream for piggybacking.

use crate::agent::Agent;
use crate::error::Result;
use crate::stats::build_report;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub async fn run(agent: Arc<Agent>, shutdown: triggered::Listener) -> Result<()> {
    let interval = Duration::from_secs(agent.config.gateway_conf.stat_interval as u64);
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            _ = shutdown.clone() => return Ok(()),
            _ = ticker.tick() => {
                let up = agent.stats_up.snapshot_and_reset();
                let down = agent.stats_down.snapshot_and_reset();

                let location = location_if_valid(&agent);
                let report = build_report(Utc::now().to_rfc3339(), location, &up, &down);
                debug!(rxnb = report.rxnb, txnb = report.txnb, "statistics report assembled");
                agent.set_pending_report(report);
            }
        }
    }
}

fn location_if_valid(agent: &Agent) -> Option<(f64, f64, i32)> {
    let cfg = &agent.config.gateway_conf;
    if agent.gps_ref_valid() || cfg.fake_gps {
        if let Some((lat, lon)) = *agent.last_gps_fix.lock().expect("gps fix mutex poisoned") {
            return Some((lat, lon, cfg.ref_altitude));
        }
        if cfg.fake_gps {
            return Some((cfg.ref_latitude, cfg.ref_longitude, cfg.ref_altitude));
        }
    }
    None
}
