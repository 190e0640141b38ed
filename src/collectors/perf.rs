//! perf-stat counter synchronizer.
//!
//! Drives one `perf stat -a -I <ms> -x , -e <events>` process and folds its
//! interval CSV rows (written to perf's stderr) into two derived streams:
//! LLC cache statistics and uncore memory bandwidth.
//!
//! Row format: time,value,unit,event,runtime,pct. Counter values are deltas
//! over the sampling interval. The instructions row is requested exactly
//! once per interval and acts as the end-of-interval marker: when it
//! arrives, whatever accumulated is flushed and the accumulators reset.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::sync::watch;

use crate::types::{now_ms, LlcSample, MemBwSample};

const PERF_CHANNEL_DEPTH: usize = 8;

/// Bytes moved per CAS transaction (one cache line).
const BYTES_PER_CAS: f64 = 64.0;

/// Counter events requested by default: LLC behavior plus DRAM CAS
/// transactions for bandwidth.
pub fn default_events() -> Vec<String> {
    [
        "LLC-loads",
        "LLC-load-misses",
        "LLC-stores",
        "LLC-store-misses",
        "instructions",
        "unc_m_cas_count_rd",
        "unc_m_cas_count_wr",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone)]
pub struct PerfConfig {
    /// Binary to launch; overridable so tests can replay captured output.
    pub program: PathBuf,
    pub interval: Duration,
    pub events: Vec<String>,
}

impl PerfConfig {
    pub fn new(interval: Duration, events: Vec<String>) -> Self {
        Self {
            program: PathBuf::from("perf"),
            interval,
            events,
        }
    }
}

/// Per-interval accumulator state, reset after every flush.
#[derive(Debug, Default)]
struct IntervalAccum {
    loads: u64,
    load_misses: u64,
    stores: u64,
    store_misses: u64,
    instructions: u64,
    read_tx: f64,
    write_tx: f64,
    have_loads: bool,
    have_load_misses: bool,
    have_stores: bool,
    have_store_misses: bool,
    have_instructions: bool,
    have_read: bool,
    have_write: bool,
}

impl IntervalAccum {
    fn reset(&mut self) {
        *self = Self::default();
    }

    /// Fold one CSV row into the accumulators. Returns true when the row
    /// was the interval's instructions marker, i.e. the interval is
    /// complete and ready to flush.
    fn ingest(&mut self, line: &str) -> bool {
        let cols: Vec<&str> = line.split(',').collect();
        if cols.len() < 4 {
            return false;
        }
        let value = cols[1].trim();
        let event = cols[3].trim();
        if value.is_empty() || value.contains("not counted") || event.contains("duration_time") {
            return false;
        }

        // miss events matched before their parent events
        if event.contains("LLC-load-misses") {
            if let Ok(v) = value.parse::<u64>() {
                self.load_misses += v;
                self.have_load_misses = true;
            }
        } else if event.contains("LLC-loads") {
            if let Ok(v) = value.parse::<u64>() {
                self.loads += v;
                self.have_loads = true;
            }
        } else if event.contains("LLC-store-misses") {
            if let Ok(v) = value.parse::<u64>() {
                self.store_misses += v;
                self.have_store_misses = true;
            }
        } else if event.contains("LLC-stores") {
            if let Ok(v) = value.parse::<u64>() {
                self.stores += v;
                self.have_stores = true;
            }
        } else if event == "instructions" {
            if let Ok(v) = value.parse::<u64>() {
                // reported once per interval, taken as-is
                self.instructions = v;
                self.have_instructions = true;
            }
        } else if event.contains("cas_count_rd") || event.contains("cas_count_read") {
            if let Ok(v) = value.parse::<f64>() {
                self.read_tx = v;
                self.have_read = true;
            }
        } else if event.contains("cas_count_wr") || event.contains("cas_count_write") {
            if let Ok(v) = value.parse::<f64>() {
                self.write_tx = v;
                self.have_write = true;
            }
        }

        self.have_instructions
    }

    fn have_any_cache(&self) -> bool {
        self.have_loads || self.have_load_misses || self.have_stores || self.have_store_misses
    }

    /// Derive the interval's samples and reset for the next one.
    fn flush(&mut self, interval_secs: f64) -> (Option<LlcSample>, Option<MemBwSample>) {
        let ts = now_ms();

        let llc = if self.have_any_cache() {
            let accesses = self.loads + self.stores;
            let misses = self.load_misses + self.store_misses;
            let mpki = if self.instructions > 0 {
                1000.0 * misses as f64 / self.instructions as f64
            } else {
                0.0
            };
            let hit_rate = if accesses > 0 {
                1.0 - misses as f64 / accesses as f64
            } else {
                0.0
            };
            Some(LlcSample {
                mpki,
                hit_rate,
                loads: self.loads,
                stores: self.stores,
                misses,
                instructions: self.instructions,
                ts_ms: ts,
                source: "perf".to_string(),
            })
        } else {
            None
        };

        let membw = if self.have_read && self.have_write {
            let to_mbs = |count: f64| count * BYTES_PER_CAS / (1024.0 * 1024.0) / interval_secs;
            let read_mbs = to_mbs(self.read_tx);
            let write_mbs = to_mbs(self.write_tx);
            Some(MemBwSample {
                source: "perf".to_string(),
                read_mbs,
                write_mbs,
                total_mbs: read_mbs + write_mbs,
                ts_ms: ts,
            })
        } else {
            None
        };

        self.reset();
        (llc, membw)
    }
}

/// Launch perf and stream derived samples until shutdown, process exit or
/// loss of both consumers. Launch failure is a construction error; after
/// that nothing here can kill the parent.
pub fn spawn_perf_monitor(
    cfg: PerfConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(mpsc::Receiver<MemBwSample>, mpsc::Receiver<LlcSample>)> {
    let interval_ms = cfg.interval.as_millis().max(1);

    let mut child = Command::new(&cfg.program)
        .arg("stat")
        .arg("-a")
        .arg("-I")
        .arg(interval_ms.to_string())
        .arg("-x")
        .arg(",")
        .arg("-e")
        .arg(cfg.events.join(","))
        .arg("--")
        .arg("sleep")
        .arg("1000000")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to launch {}", cfg.program.display()))?;

    // perf writes its interval rows to stderr
    let stderr = child
        .stderr
        .take()
        .context("perf stderr was not captured")?;

    let (mem_out, mem_rx) = mpsc::channel(PERF_CHANNEL_DEPTH);
    let (llc_out, llc_rx) = mpsc::channel(PERF_CHANNEL_DEPTH);
    let interval_secs = cfg.interval.as_secs_f64();

    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut accum = IntervalAccum::default();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if !accum.ingest(&line) {
                                continue;
                            }
                            let (llc, membw) = accum.flush(interval_secs);
                            if let Some(sample) = llc {
                                let _ = llc_out.try_send(sample);
                            }
                            if let Some(sample) = membw {
                                let _ = mem_out.try_send(sample);
                            }
                            if llc_out.is_closed() && mem_out.is_closed() {
                                break;
                            }
                        }
                        Ok(None) => {
                            warn!("[perf] counter stream ended");
                            break;
                        }
                        Err(err) => {
                            warn!("[perf] failed to read counter stream: {err}");
                            break;
                        }
                    }
                }
            }
        }

        let _ = child.kill().await;
        info!("[perf] monitor stopped");
    });

    Ok((mem_rx, llc_rx))
}
