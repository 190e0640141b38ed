use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Kernel resource a PSI file describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PsiResource {
    Cpu,
    Memory,
    Io,
}

impl PsiResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PsiResource::Cpu => "cpu",
            PsiResource::Memory => "memory",
            PsiResource::Io => "io",
        }
    }
}

impl fmt::Display for PsiResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PsiResource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(PsiResource::Cpu),
            "memory" => Ok(PsiResource::Memory),
            "io" => Ok(PsiResource::Io),
            other => Err(format!("unknown PSI resource: {other}")),
        }
    }
}

/// PSI sub-metric: "some" = at least one task stalled,
/// "full" = all non-idle tasks stalled at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PsiKind {
    Some,
    Full,
}

impl PsiKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PsiKind::Some => "some",
            PsiKind::Full => "full",
        }
    }
}

impl fmt::Display for PsiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pressure reading, either trigger-driven or polled.
///
/// The avg fields are the kernel's decayed averages in percent, carried
/// verbatim (consumers normalize with /100 if they want a ratio).
#[derive(Debug, Clone, Serialize)]
pub struct PsiEvent {
    #[serde(rename = "res")]
    pub resource: PsiResource,
    pub kind: PsiKind,
    #[serde(rename = "thr_us")]
    pub threshold_us: u32,
    #[serde(rename = "win_us")]
    pub window_us: u32,
    pub avg10: f64,
    pub avg60: f64,
    pub avg300: f64,
    pub total_us: u64,
    #[serde(rename = "ts_unix_ms")]
    pub ts_ms: i64,
}

/// Instantaneous NIC throughput derived from cumulative byte counters.
/// Rates are zero for any tick where the counter regressed or the
/// elapsed interval was not positive.
#[derive(Debug, Clone, Serialize)]
pub struct NetSample {
    pub iface: String,
    pub rx_bps: u64,
    pub tx_bps: u64,
    #[serde(rename = "ts_unix_ms")]
    pub ts_ms: i64,
}

/// Memory bandwidth derived from uncore CAS transaction counters.
#[derive(Debug, Clone, Serialize)]
pub struct MemBwSample {
    pub source: String,
    #[serde(rename = "read_mbps")]
    pub read_mbs: f64,
    #[serde(rename = "write_mbps")]
    pub write_mbs: f64,
    #[serde(rename = "total_mbps")]
    pub total_mbs: f64,
    #[serde(rename = "ts_unix_ms")]
    pub ts_ms: i64,
}

/// Last-level-cache statistics for one sampling interval.
#[derive(Debug, Clone, Serialize)]
pub struct LlcSample {
    pub mpki: f64,
    pub hit_rate: f64,
    pub loads: u64,
    pub stores: u64,
    /// load misses + store misses
    pub misses: u64,
    pub instructions: u64,
    #[serde(rename = "ts_unix_ms")]
    pub ts_ms: i64,
    pub source: String,
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis() as i64)
        .unwrap_or(0)
}
