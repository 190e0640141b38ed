//! PSI (Pressure Stall Information) samplers.
//!
//! Format from /proc/pressure/{cpu,memory,io} (or <cgroup>/<res>.pressure):
//!   some avg10=5.23 avg60=3.45 avg300=2.11 total=123456
//!   full avg10=0.12 avg60=0.08 avg300=0.05 total=78901
//!
//! Two samplers per resource class:
//! - the threshold watcher writes a kernel trigger ("<kind> <thr_us> <win_us>")
//!   into the pressure file and blocks on POLLPRI, so it only emits on an
//!   actual threshold crossing;
//! - the snapshot poller re-reads the file on a fixed period, so consumers
//!   always have a current value even when nothing crosses the threshold.

use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::types::{now_ms, PsiEvent, PsiKind, PsiResource};

const WATCH_CHANNEL_DEPTH: usize = 16;
const POLL_CHANNEL_DEPTH: usize = 1;

/// Upper bound on shutdown latency for the blocking kernel wait.
const POLL_TIMEOUT_MS: libc::c_int = 1000;

/// Where the pressure files live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PsiScope {
    /// Whole machine: /proc/pressure/<resource>
    System,
    /// One cgroup directory: <dir>/<resource>.pressure
    Cgroup(PathBuf),
}

fn system_psi_base() -> PathBuf {
    env::var("RESMOND_PSI_BASE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/proc/pressure"))
}

/// Resolve the pressure pseudo-file for a resource under a scope.
pub fn psi_file_path(scope: &PsiScope, resource: PsiResource) -> PathBuf {
    match scope {
        PsiScope::System => system_psi_base().join(resource.as_str()),
        PsiScope::Cgroup(dir) => dir.join(format!("{}.pressure", resource.as_str())),
    }
}

/// Parse one PSI line ("some avg10=... avg60=... avg300=... total=...").
///
/// Unknown keys are ignored; a malformed value yields 0 for that field.
pub fn parse_psi_line(line: &str) -> (f64, f64, f64, u64) {
    let mut avg10 = 0.0;
    let mut avg60 = 0.0;
    let mut avg300 = 0.0;
    let mut total_us = 0u64;

    for token in line.split_whitespace().skip(1) {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        match key {
            "avg10" => avg10 = value.parse().unwrap_or(0.0),
            "avg60" => avg60 = value.parse().unwrap_or(0.0),
            "avg300" => avg300 = value.parse().unwrap_or(0.0),
            "total" => total_us = value.parse().unwrap_or(0),
            _ => {}
        }
    }

    (avg10, avg60, avg300, total_us)
}

fn zero_event(resource: PsiResource, kind: PsiKind, ts_ms: i64) -> PsiEvent {
    PsiEvent {
        resource,
        kind,
        threshold_us: 0,
        window_us: 0,
        avg10: 0.0,
        avg60: 0.0,
        avg300: 0.0,
        total_us: 0,
        ts_ms,
    }
}

/// Read a pressure file and return its (some, full) events with a shared
/// capture timestamp. A missing line leaves that event zero-valued.
pub fn read_psi_file(path: &Path, resource: PsiResource) -> io::Result<(PsiEvent, PsiEvent)> {
    let content = std::fs::read_to_string(path)?;
    let ts = now_ms();
    let mut some = zero_event(resource, PsiKind::Some, ts);
    let mut full = zero_event(resource, PsiKind::Full, ts);

    for line in content.lines() {
        let event = if line.starts_with("some ") {
            &mut some
        } else if line.starts_with("full ") {
            &mut full
        } else {
            continue;
        };
        let (avg10, avg60, avg300, total_us) = parse_psi_line(line);
        event.avg10 = avg10;
        event.avg60 = avg60;
        event.avg300 = avg300;
        event.total_us = total_us;
    }

    Ok((some, full))
}

/// Install a kernel PSI trigger and emit an event on every threshold
/// crossing.
///
/// Opening the file or writing the trigger fails synchronously; the caller
/// decides whether to continue without this watcher. The blocking wait runs
/// on the blocking pool with a finite poll timeout so shutdown is observed
/// within [`POLL_TIMEOUT_MS`].
pub fn spawn_psi_watcher(
    scope: &PsiScope,
    resource: PsiResource,
    kind: PsiKind,
    threshold_us: u32,
    window_us: u32,
    shutdown: watch::Receiver<bool>,
) -> Result<mpsc::Receiver<PsiEvent>> {
    let path = psi_file_path(scope, resource);

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let trigger = format!("{} {} {}\n", kind.as_str(), threshold_us, window_us);
    file.write_all(trigger.as_bytes())
        .with_context(|| format!("kernel rejected PSI trigger on {}", path.display()))?;

    info!("[psi] armed {} trigger: {}", path.display(), trigger.trim_end());

    let (out, rx) = mpsc::channel(WATCH_CHANNEL_DEPTH);
    tokio::task::spawn_blocking(move || {
        watch_loop(file, path, resource, kind, threshold_us, window_us, out, shutdown);
    });
    Ok(rx)
}

#[allow(clippy::too_many_arguments)]
fn watch_loop(
    file: File,
    path: PathBuf,
    resource: PsiResource,
    kind: PsiKind,
    threshold_us: u32,
    window_us: u32,
    out: mpsc::Sender<PsiEvent>,
    shutdown: watch::Receiver<bool>,
) {
    let fd = file.as_raw_fd();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLPRI,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, POLL_TIMEOUT_MS) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            warn!("[psi] {resource} watcher poll failed: {err}");
            break;
        }
        if rc == 0 {
            // timeout, loop to re-check the shutdown flag
            continue;
        }
        if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            warn!("[psi] {resource} trigger descriptor invalidated");
            break;
        }
        if pfd.revents & libc::POLLPRI == 0 {
            // spurious wake
            continue;
        }

        match read_psi_file(&path, resource) {
            Ok((some, full)) => {
                let mut event = match kind {
                    PsiKind::Some => some,
                    PsiKind::Full => full,
                };
                event.kind = kind;
                event.threshold_us = threshold_us;
                event.window_us = window_us;
                match out.try_send(event) {
                    Ok(()) => {}
                    // queue full: drop, freshness over completeness
                    Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            Err(err) => debug!("[psi] {resource} re-read after trigger failed: {err}"),
        }
    }

    info!("[psi] {resource} {kind} watcher stopped");
}

/// Periodically re-read a pressure file and emit the "some" line.
///
/// Read errors are skipped per tick; this sampler only stops on shutdown
/// or when the consumer goes away.
pub fn spawn_psi_poller(
    scope: &PsiScope,
    resource: PsiResource,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> mpsc::Receiver<PsiEvent> {
    let path = psi_file_path(scope, resource);
    let (out, rx) = mpsc::channel(POLL_CHANNEL_DEPTH);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match read_psi_file(&path, resource) {
                        Ok((some, _full)) => match out.try_send(some) {
                            Ok(()) | Err(TrySendError::Full(_)) => {}
                            Err(TrySendError::Closed(_)) => break,
                        },
                        Err(err) => debug!("[psi] {resource} poll read failed: {err}"),
                    }
                }
            }
        }

        info!("[psi] {resource} poller stopped");
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_parse_psi_line() {
        let (avg10, avg60, avg300, total) =
            parse_psi_line("some avg10=12.34 avg60=5.0 avg300=1.0 total=1000");
        assert_eq!(avg10, 12.34);
        assert_eq!(avg60, 5.0);
        assert_eq!(avg300, 1.0);
        assert_eq!(total, 1000);
    }

    #[test]
    fn test_parse_psi_line_ignores_unknown_keys() {
        let (avg10, _, _, total) =
            parse_psi_line("full avg10=0.5 weird=9 avg60=0.1 avg300=0.0 total=77");
        assert_eq!(avg10, 0.5);
        assert_eq!(total, 77);
    }

    #[test]
    fn test_parse_psi_line_malformed_values_yield_zero() {
        let (avg10, avg60, avg300, total) =
            parse_psi_line("some avg10=oops avg60 avg300=1.5 total=-3");
        assert_eq!(avg10, 0.0);
        assert_eq!(avg60, 0.0); // no '=' at all
        assert_eq!(avg300, 1.5);
        assert_eq!(total, 0);
    }

    #[test]
    fn test_path_resolution() {
        assert_eq!(
            psi_file_path(&PsiScope::System, PsiResource::Cpu),
            PathBuf::from("/proc/pressure/cpu")
        );
        let scope = PsiScope::Cgroup(PathBuf::from("/sys/fs/cgroup/workload"));
        assert_eq!(
            psi_file_path(&scope, PsiResource::Memory),
            PathBuf::from("/sys/fs/cgroup/workload/memory.pressure")
        );
    }

    #[test]
    fn test_read_psi_file_both_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.pressure");
        std::fs::write(
            &path,
            "some avg10=1.10 avg60=0.50 avg300=0.10 total=123456\n\
             full avg10=0.20 avg60=0.05 avg300=0.01 total=654321\n",
        )
        .unwrap();

        let (some, full) = read_psi_file(&path, PsiResource::Memory).unwrap();
        assert_eq!(some.kind, PsiKind::Some);
        assert_eq!(some.avg10, 1.10);
        assert_eq!(some.total_us, 123456);
        assert_eq!(full.kind, PsiKind::Full);
        assert_eq!(full.avg10, 0.20);
        assert_eq!(full.total_us, 654321);
        assert_eq!(some.ts_ms, full.ts_ms);
    }

    #[test]
    fn test_read_psi_file_cpu_has_no_full_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpu.pressure");
        std::fs::write(&path, "some avg10=3.00 avg60=2.00 avg300=1.00 total=42\n").unwrap();

        let (some, full) = read_psi_file(&path, PsiResource::Cpu).unwrap();
        assert_eq!(some.avg10, 3.00);
        assert_eq!(full.avg10, 0.0);
        assert_eq!(full.total_us, 0);
    }

    #[test]
    fn test_watcher_construction_fails_on_missing_file() {
        let (_tx, shutdown) = watch::channel(false);
        let scope = PsiScope::Cgroup(PathBuf::from("/nonexistent-resmond-test"));
        let err = spawn_psi_watcher(&scope, PsiResource::Io, PsiKind::Full, 1000, 100_000, shutdown);
        assert!(err.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watcher_observes_shutdown_within_poll_timeout() {
        // A regular file accepts the trigger write and never signals
        // POLLPRI, so the loop only sees timeouts; the shutdown flag must
        // still stop it.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.pressure");
        std::fs::write(&path, "some avg10=0.00 avg60=0.00 avg300=0.00 total=0\n").unwrap();

        let (tx, shutdown) = watch::channel(false);
        let scope = PsiScope::Cgroup(dir.path().to_path_buf());
        let mut rx = spawn_psi_watcher(
            &scope,
            PsiResource::Memory,
            PsiKind::Some,
            150_000,
            1_000_000,
            shutdown,
        )
        .unwrap();

        tx.send(true).unwrap();
        let closed = timeout(Duration::from_secs(3), rx.recv()).await;
        assert!(closed.expect("watcher did not stop in time").is_none());
    }

    #[tokio::test]
    async fn test_poller_emits_current_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.pressure");
        std::fs::write(
            &path,
            "some avg10=7.50 avg60=3.00 avg300=1.00 total=9999\n\
             full avg10=1.00 avg60=0.50 avg300=0.10 total=1111\n",
        )
        .unwrap();

        let (tx, shutdown) = watch::channel(false);
        let scope = PsiScope::Cgroup(dir.path().to_path_buf());
        let mut rx = spawn_psi_poller(&scope, PsiResource::Memory, Duration::from_millis(10), shutdown);

        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, PsiKind::Some);
        assert_eq!(event.avg10, 7.50);
        assert_eq!(event.total_us, 9999);

        tx.send(true).unwrap();
        // channel drains whatever was buffered, then closes
        while let Ok(Some(_)) = timeout(Duration::from_secs(2), rx.recv()).await {}
    }

    #[tokio::test]
    async fn test_poller_survives_missing_file_and_never_blocks_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, shutdown) = watch::channel(false);
        let scope = PsiScope::Cgroup(dir.path().to_path_buf());
        let mut rx = spawn_psi_poller(&scope, PsiResource::Io, Duration::from_millis(5), shutdown.clone());

        // no io.pressure file yet: ticks fail and are skipped
        tokio::time::sleep(Duration::from_millis(30)).await;
        std::fs::write(
            dir.path().join("io.pressure"),
            "some avg10=2.00 avg60=1.00 avg300=0.50 total=500\n",
        )
        .unwrap();

        // do not consume for a while: the depth-1 queue stays full and the
        // sampler must keep running regardless
        tokio::time::sleep(Duration::from_millis(50)).await;

        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.avg10, 2.00);

        tx.send(true).unwrap();
        while let Ok(Some(_)) = timeout(Duration::from_secs(2), rx.recv()).await {}
    }
}
