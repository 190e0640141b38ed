use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use tokio::sync::mpsc;
use tokio::sync::watch;

use resmond::collectors::psi::PsiScope;
use resmond::collectors::{net, perf, psi};
use resmond::config::{Config, PsiResourceConfig};
use resmond::types::{LlcSample, MemBwSample, NetSample, PsiEvent, PsiResource};

#[derive(Parser, Debug)]
#[clap(about = "PSI, NIC and perf-counter telemetry sampler")]
struct Args {
    /// Path to resmond.toml (searched upward from the cwd by default)
    #[clap(long)]
    config: Option<PathBuf>,

    /// Override the monitored network interface
    #[clap(long)]
    iface: Option<String>,

    /// Override the configured log level
    #[clap(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config: {err:#}; using defaults");
            Config::default()
        }
    };
    if let Some(iface) = args.iface {
        config.monitoring.network.interface = iface;
    }
    if let Some(level) = args.log_level {
        config.output.log_level = level;
    }
    config.validate()?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.output.log_level),
    )
    .init();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scope = config.psi_scope();

    let mut psi_mem = start_watcher(
        &scope,
        PsiResource::Memory,
        &config.monitoring.psi.memory,
        &shutdown_rx,
    );
    let mut psi_cpu = start_watcher(
        &scope,
        PsiResource::Cpu,
        &config.monitoring.psi.cpu,
        &shutdown_rx,
    );
    let mut psi_io = start_watcher(
        &scope,
        PsiResource::Io,
        &config.monitoring.psi.io,
        &shutdown_rx,
    );
    let mut psi_poll = Some(psi::spawn_psi_poller(
        &scope,
        PsiResource::Memory,
        config.memory_poll_interval(),
        shutdown_rx.clone(),
    ));

    let mut net_rx = match net::spawn_net_watcher(
        &config.monitoring.network.interface,
        config.network_interval(),
        shutdown_rx.clone(),
    ) {
        Ok(rx) => Some(rx),
        Err(err) => {
            warn!("[net] watcher not started: {err:#}");
            None
        }
    };

    let perf_cfg = perf::PerfConfig::new(
        config.perf_interval(),
        config.monitoring.perf.events.clone(),
    );
    let (mut membw_rx, mut llc_rx) = match perf::spawn_perf_monitor(perf_cfg, shutdown_rx.clone())
    {
        Ok((membw, llc)) => (Some(membw), Some(llc)),
        Err(err) => {
            warn!("[perf] monitor not started: {err:#}");
            (None, None)
        }
    };

    info!("resmond started");

    let console = config.output.console;
    let json = config.output.json;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupt received, shutting down");
                break;
            }
            maybe = next_event(&mut psi_mem) => {
                if let Some(ev) = maybe { emit_psi(&ev, console, json); }
            }
            maybe = next_event(&mut psi_cpu) => {
                if let Some(ev) = maybe { emit_psi(&ev, console, json); }
            }
            maybe = next_event(&mut psi_io) => {
                if let Some(ev) = maybe { emit_psi(&ev, console, json); }
            }
            maybe = next_event(&mut psi_poll) => {
                if let Some(ev) = maybe { emit_psi(&ev, console, json); }
            }
            maybe = next_event(&mut net_rx) => {
                if let Some(sample) = maybe { emit_net(&sample, console, json); }
            }
            maybe = next_event(&mut membw_rx) => {
                if let Some(sample) = maybe { emit_membw(&sample, console, json); }
            }
            maybe = next_event(&mut llc_rx) => {
                if let Some(sample) = maybe { emit_llc(&sample, console, json); }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    // bounded by the PSI watcher's poll timeout
    tokio::time::sleep(Duration::from_millis(1200)).await;
    info!("resmond stopped");
    Ok(())
}

fn start_watcher(
    scope: &PsiScope,
    resource: PsiResource,
    cfg: &PsiResourceConfig,
    shutdown: &watch::Receiver<bool>,
) -> Option<mpsc::Receiver<PsiEvent>> {
    match psi::spawn_psi_watcher(
        scope,
        resource,
        cfg.kind,
        cfg.threshold_us,
        cfg.window_us,
        shutdown.clone(),
    ) {
        Ok(rx) => Some(rx),
        Err(err) => {
            warn!("[psi] {resource} watcher not started: {err:#}");
            None
        }
    }
}

/// Receive from an optional queue; a closed queue parks its slot so the
/// dispatch loop keeps serving the remaining samplers.
async fn next_event<T>(slot: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match slot {
        Some(rx) => match rx.recv().await {
            Some(value) => Some(value),
            None => {
                *slot = None;
                None
            }
        },
        None => std::future::pending().await,
    }
}

fn emit_psi(ev: &PsiEvent, console: bool, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(ev) {
            println!("{line}");
        }
    } else if console {
        println!(
            "[PSI] {} {} avg10={:.2}% avg60={:.2}% avg300={:.2}%",
            ev.resource, ev.kind, ev.avg10, ev.avg60, ev.avg300
        );
    }
}

fn emit_net(sample: &NetSample, console: bool, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(sample) {
            println!("{line}");
        }
    } else if console {
        println!(
            "[NET] {} rx={}B/s tx={}B/s",
            sample.iface, sample.rx_bps, sample.tx_bps
        );
    }
}

fn emit_membw(sample: &MemBwSample, console: bool, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(sample) {
            println!("{line}");
        }
    } else if console {
        println!(
            "[PERF] MemBW total={:.0}MB/s (R={:.0} W={:.0})",
            sample.total_mbs, sample.read_mbs, sample.write_mbs
        );
    }
}

fn emit_llc(sample: &LlcSample, console: bool, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(sample) {
            println!("{line}");
        }
    } else if console {
        println!(
            "[PERF] LLC mpki={:.2} hit={:.2} loads={} stores={}",
            sample.mpki, sample.hit_rate, sample.loads, sample.stores
        );
    }
}
