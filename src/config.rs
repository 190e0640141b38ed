//! Daemon configuration.
//!
//! Loaded from `resmond.toml` (explicit `--config` path, else searched
//! upward from the working directory), falling back to built-in defaults.
//! Intervals are plain milliseconds in the file.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::collectors::psi::PsiScope;
use crate::types::PsiKind;

const CONFIG_FILE_NAME: &str = "resmond.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub monitoring: MonitoringConfig,
    pub output: OutputConfig,
    pub psi_scope: PsiScopeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MonitoringConfig {
    pub network: NetworkConfig,
    pub psi: PsiConfig,
    pub perf: PerfSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub interface: String,
    pub interval_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: "enp4s0".to_string(),
            interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PsiConfig {
    pub memory: PsiResourceConfig,
    pub cpu: PsiResourceConfig,
    pub io: PsiResourceConfig,
    pub memory_poll_interval_ms: u64,
}

impl Default for PsiConfig {
    fn default() -> Self {
        Self {
            memory: PsiResourceConfig {
                threshold_us: 150_000,
                window_us: 1_000_000,
                kind: PsiKind::Some,
            },
            cpu: PsiResourceConfig {
                threshold_us: 100_000,
                window_us: 1_000_000,
                kind: PsiKind::Some,
            },
            io: PsiResourceConfig {
                threshold_us: 150_000,
                window_us: 1_000_000,
                kind: PsiKind::Full,
            },
            memory_poll_interval_ms: 1000,
        }
    }
}

/// Trigger parameters for one PSI resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PsiResourceConfig {
    pub threshold_us: u32,
    pub window_us: u32,
    pub kind: PsiKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerfSection {
    pub interval_ms: u64,
    pub events: Vec<String>,
}

impl Default for PerfSection {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            events: crate::collectors::perf::default_events(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub console: bool,
    pub json: bool,
    pub log_level: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            console: true,
            json: false,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    System,
    Cgroup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PsiScopeConfig {
    #[serde(rename = "type")]
    pub kind: ScopeKind,
    pub cgroup_path: PathBuf,
}

impl Default for PsiScopeConfig {
    fn default() -> Self {
        Self {
            kind: ScopeKind::System,
            cgroup_path: PathBuf::from("/sys/fs/cgroup"),
        }
    }
}

impl Config {
    /// Load from an explicit path, or search `resmond.toml` upward from
    /// the working directory. Either way the result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => find_config_file().context("no resmond.toml found")?,
        };
        let data = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&data)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.psi_scope.kind == ScopeKind::Cgroup
            && self.psi_scope.cgroup_path.as_os_str().is_empty()
        {
            bail!("psi_scope.cgroup_path must be set for cgroup scope");
        }

        match self.output.log_level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => bail!("invalid log level: {other} (must be debug, info, warn or error)"),
        }

        for (name, interval) in [
            ("monitoring.network.interval_ms", self.monitoring.network.interval_ms),
            (
                "monitoring.psi.memory_poll_interval_ms",
                self.monitoring.psi.memory_poll_interval_ms,
            ),
            ("monitoring.perf.interval_ms", self.monitoring.perf.interval_ms),
        ] {
            if interval == 0 {
                bail!("{name} must be positive");
            }
        }

        // The perf reader flushes each interval when the instructions line
        // arrives; without that event no sample would ever be emitted.
        if !self
            .monitoring
            .perf
            .events
            .iter()
            .any(|ev| ev == "instructions")
        {
            bail!("monitoring.perf.events must include \"instructions\"");
        }

        Ok(())
    }

    pub fn network_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring.network.interval_ms)
    }

    pub fn memory_poll_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring.psi.memory_poll_interval_ms)
    }

    pub fn perf_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring.perf.interval_ms)
    }

    pub fn psi_scope(&self) -> PsiScope {
        match self.psi_scope.kind {
            ScopeKind::System => PsiScope::System,
            ScopeKind::Cgroup => PsiScope::Cgroup(self.psi_scope.cgroup_path.clone()),
        }
    }
}

fn find_config_file() -> Option<PathBuf> {
    let mut dir = env::current_dir().ok()?;
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}
