//! LoRa packet forwarder agent: bridges a concentrator HAL to a
//! Semtech UDP protocol network server.

mod agent;
mod config;
mod error;
mod gps;
mod hal;
mod packet;
mod protocol;
mod stats;
mod workers;

use agent::Agent;
use clap::Parser;
use config::Config;
use gps::NullGps;
use hal::NullHal;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lora_pkt_fwd", about = "LoRa packet forwarder agent")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "global_conf.json")]
    config: PathBuf,

    /// Overrides `RUST_LOG` when set (e.g. "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,
}

/// Returned guard must stay alive for the process lifetime to flush the
/// non-blocking file writer on exit.
fn init_tracing(log_level: Option<&str>, log_file: Option<&str>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = match log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    match log_file {
        Some(path) => {
            let path = PathBuf::from(path);
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("lora_pkt_fwd.log"));
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer).with_ansi(false).init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error loading {}: {e}", cli.config.display());
            return std::process::ExitCode::FAILURE;
        }
    };

    let _log_guard = init_tracing(cli.log_level.as_deref(), config.debug_conf.log_file.as_deref());

    match run(config).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal error, exiting");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> error::Result<()> {
    let mac = config.mac()?;
    let server_address = config.gateway_conf.server_address.clone();
    let up_addr = format!("{server_address}:{}", config.gateway_conf.serv_port_up);
    let down_addr = format!("{server_address}:{}", config.gateway_conf.serv_port_down);

    let up_socket = UdpSocket::bind("0.0.0.0:0").await?;
    up_socket.connect(&up_addr).await?;
    let down_socket = UdpSocket::bind("0.0.0.0:0").await?;
    down_socket.connect(&down_addr).await?;

    info!(%mac, %up_addr, %down_addr, "agent starting");

    let agent = Arc::new(Agent::new(config, Box::new(NullHal)));
    let (trigger, shutdown) = triggered::trigger();

    let mut handles = Vec::new();
    handles.push(tokio::spawn(workers::upstream::run(
        agent.clone(),
        up_socket,
        mac,
        shutdown.clone(),
    )));
    handles.push(tokio::spawn(workers::downstream::run(
        agent.clone(),
        down_socket,
        mac,
        shutdown.clone(),
    )));
    handles.push(tokio::spawn(workers::jit_dispatcher::run(agent.clone(), shutdown.clone())));
    handles.push(tokio::spawn(workers::xtal_worker::run(agent.clone(), shutdown.clone())));
    handles.push(tokio::spawn(workers::stats_worker::run(agent.clone(), shutdown.clone())));
    handles.push(tokio::spawn(workers::spectral::run(agent.clone(), shutdown.clone())));
    handles.push(tokio::spawn(workers::gps_worker::run(
        agent.clone(),
        tokio::io::empty(),
        NullGps,
        shutdown.clone(),
    )));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
            trigger.trigger();
        }
    }

    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "worker exited with an error"),
            Err(e) => error!(error = %e, "worker task panicked"),
        }
    }
    Ok(())
}
