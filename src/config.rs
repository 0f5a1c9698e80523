use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::inspector::InspectorConfig;
use crate::template::DEFAULT_MAX_ADDRESSES;

/// Upper bound for an explicit worker count.
pub const MAX_WORKERS: usize = 50;
/// Upper bound for the automatic worker count.
pub const MAX_AUTO_WORKERS: usize = 20;

/// Tuning knobs for a scan session. Every field has a default, so a config
/// file only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Addresses produced per expander batch.
    pub batch_size: usize,

    /// Pending addresses at which the filler pauses.
    pub queue_high_water: usize,

    /// How long a worker waits on an empty queue before re-checking stop.
    pub queue_pop_wait_ms: u64,

    /// Stats snapshot cadence.
    pub stats_interval_ms: u64,

    /// Bounded wait for workers when stopping.
    pub stop_join_wait_ms: u64,

    /// How long the ticker waits for abandoned workers before its final snapshot.
    pub final_snapshot_wait_ms: u64,

    /// Ceiling on the number of addresses one template may expand to.
    pub max_addresses: u64,

    pub inspector: InspectorConfig,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            queue_high_water: 10_000,
            queue_pop_wait_ms: 100,
            stats_interval_ms: 500,
            stop_join_wait_ms: 500,
            final_snapshot_wait_ms: 3_000,
            max_addresses: DEFAULT_MAX_ADDRESSES,
            inspector: InspectorConfig::default(),
        }
    }
}

impl ScanConfig {
    /// Load a JSON config file; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file: {}", path.as_ref().display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("invalid config file: {}", path.as_ref().display()))
    }

    pub fn pop_wait(&self) -> Duration {
        Duration::from_millis(self.queue_pop_wait_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn stop_join_wait(&self) -> Duration {
        Duration::from_millis(self.stop_join_wait_ms)
    }

    pub fn final_snapshot_wait(&self) -> Duration {
        Duration::from_millis(self.final_snapshot_wait_ms)
    }
}

/// Worker-count policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCount {
    /// min(2 × cores, 20)
    Auto,
    /// Clamped to 1..=50.
    Explicit(usize),
}

impl WorkerCount {
    /// `0` selects automatic sizing.
    pub fn from_flag(n: usize) -> Self {
        if n == 0 {
            WorkerCount::Auto
        } else {
            WorkerCount::Explicit(n)
        }
    }

    pub fn resolve(self) -> usize {
        match self {
            WorkerCount::Auto => {
                let cores = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                (cores * 2).min(MAX_AUTO_WORKERS)
            }
            WorkerCount::Explicit(n) => n.clamp(1, MAX_WORKERS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_policy() {
        assert_eq!(WorkerCount::Explicit(0).resolve(), 1);
        assert_eq!(WorkerCount::Explicit(8).resolve(), 8);
        assert_eq!(WorkerCount::Explicit(500).resolve(), MAX_WORKERS);
        let auto = WorkerCount::Auto.resolve();
        assert!((2..=MAX_AUTO_WORKERS).contains(&auto));
        assert_eq!(WorkerCount::from_flag(0), WorkerCount::Auto);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: ScanConfig =
            serde_json::from_str(r#"{"batch_size": 50, "inspector": {"program": "/opt/ffprobe"}}"#).unwrap();
        assert_eq!(cfg.batch_size, 50);
        assert_eq!(cfg.queue_high_water, 10_000);
        assert_eq!(cfg.inspector.program, std::path::PathBuf::from("/opt/ffprobe"));
    }
}
