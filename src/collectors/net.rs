//! NIC throughput sampler.
//!
//! Reads the cumulative rx_bytes/tx_bytes counters under
//! /sys/class/net/<iface>/statistics on a fixed period and converts the
//! deltas to bytes/second. A counter that regresses (driver reset,
//! interface bounce) yields a zero rate for that tick; the stored previous
//! values always advance so one bad reading cannot skew later ticks.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use log::info;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::types::{now_ms, NetSample};

const NET_CHANNEL_DEPTH: usize = 8;

fn net_base() -> PathBuf {
    env::var("RESMOND_NET_BASE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/sys/class/net"))
}

fn read_counter(path: &Path) -> io::Result<u64> {
    let raw = fs::read_to_string(path)?;
    raw.trim()
        .parse()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Delta-to-rate for one cumulative counter. Zero when the counter went
/// backwards or no time elapsed.
pub fn compute_rate(prev: u64, current: u64, elapsed_secs: f64) -> u64 {
    if current >= prev && elapsed_secs > 0.0 {
        ((current - prev) as f64 / elapsed_secs) as u64
    } else {
        0
    }
}

/// Sample rx/tx throughput of a network interface.
///
/// Fails fast when the interface has no statistics directory.
pub fn spawn_net_watcher(
    iface: &str,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> Result<mpsc::Receiver<NetSample>> {
    spawn_net_watcher_at(&net_base(), iface, interval, shutdown)
}

pub(crate) fn spawn_net_watcher_at(
    base: &Path,
    iface: &str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<mpsc::Receiver<NetSample>> {
    let stats = base.join(iface).join("statistics");
    if !stats.is_dir() {
        bail!("interface {iface}: no statistics at {}", stats.display());
    }
    let rx_path = stats.join("rx_bytes");
    let tx_path = stats.join("tx_bytes");
    let iface = iface.to_string();

    let (out, rx) = mpsc::channel(NET_CHANNEL_DEPTH);
    tokio::spawn(async move {
        let mut rx_prev = read_counter(&rx_path).unwrap_or(0);
        let mut tx_prev = read_counter(&tx_path).unwrap_or(0);
        let mut prev_at = Instant::now();

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick of a fresh interval fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    // an unreadable counter reads as 0, which the rate rule
                    // treats as a reset (zero rate this tick)
                    let rx_now = read_counter(&rx_path).unwrap_or(0);
                    let tx_now = read_counter(&tx_path).unwrap_or(0);
                    let now = Instant::now();
                    let elapsed = now.duration_since(prev_at).as_secs_f64();

                    let sample = NetSample {
                        iface: iface.clone(),
                        rx_bps: compute_rate(rx_prev, rx_now, elapsed),
                        tx_bps: compute_rate(tx_prev, tx_now, elapsed),
                        ts_ms: now_ms(),
                    };
                    rx_prev = rx_now;
                    tx_prev = tx_now;
                    prev_at = now;

                    match out.try_send(sample) {
                        Ok(()) | Err(TrySendError::Full(_)) => {}
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
            }
        }

        info!("[net] {iface} watcher stopped");
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[test]
    fn test_compute_rate_basic() {
        assert_eq!(compute_rate(1000, 3000, 2.0), 1000);
        assert_eq!(compute_rate(0, 1_048_576, 1.0), 1_048_576);
        assert_eq!(compute_rate(500, 500, 1.0), 0);
    }

    #[test]
    fn test_compute_rate_counter_reset_is_zero() {
        assert_eq!(compute_rate(3000, 1000, 2.0), 0);
    }

    #[test]
    fn test_compute_rate_bad_elapsed_is_zero() {
        assert_eq!(compute_rate(1000, 3000, 0.0), 0);
        assert_eq!(compute_rate(1000, 3000, -1.0), 0);
    }

    #[test]
    fn test_construction_fails_without_statistics_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, shutdown) = watch::channel(false);
        let err = spawn_net_watcher_at(dir.path(), "eth0", Duration::from_secs(1), shutdown);
        assert!(err.is_err());
    }

    fn write_counters(stats: &Path, rx: &str, tx: &str) {
        fs::write(stats.join("rx_bytes"), rx).unwrap();
        fs::write(stats.join("tx_bytes"), tx).unwrap();
    }

    #[tokio::test]
    async fn test_watcher_emits_and_survives_garbage_counter() {
        let dir = tempfile::tempdir().unwrap();
        let stats = dir.path().join("eth0").join("statistics");
        fs::create_dir_all(&stats).unwrap();
        write_counters(&stats, "1000\n", "2000\n");

        let (tx, shutdown) = watch::channel(false);
        let mut rx =
            spawn_net_watcher_at(dir.path(), "eth0", Duration::from_millis(10), shutdown).unwrap();

        let first = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.iface, "eth0");

        // garbage counter: treated as a reset, sampler keeps going
        write_counters(&stats, "not-a-number\n", "2500\n");
        let second = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.iface, "eth0");

        // restore and confirm the stream is still alive
        write_counters(&stats, "9000\n", "9000\n");
        let third = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(third.iface, "eth0");

        tx.send(true).unwrap();
        while let Ok(Some(_)) = timeout(Duration::from_secs(2), rx.recv()).await {}
    }
}
