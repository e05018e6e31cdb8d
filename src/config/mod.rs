//! Orchestrator configuration.
//!
//! Everything tunable is carried in an explicit [`OrchestratorConfig`] passed
//! at construction time. There is no ambient global state.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the orchestrator and its background loops.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum pipeline runs past the admission gate at once.
    pub max_concurrent_runs: usize,
    /// Age after which terminal tasks and their artifacts are purged.
    pub retention: Duration,
    /// How often the retention reaper sweeps.
    pub sweep_interval: Duration,
    /// Directory holding finished artifacts.
    pub artifact_dir: PathBuf,
    /// Scratch directory for in-flight downloads and intermediates.
    pub work_dir: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            // Small by default: the target hosts are resource-constrained.
            max_concurrent_runs: 2,
            retention: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
            artifact_dir: PathBuf::from("./data/artifacts"),
            work_dir: PathBuf::from("./data/work"),
        }
    }
}

impl OrchestratorConfig {
    /// Set the admission-gate capacity.
    pub fn with_max_concurrent_runs(mut self, max: usize) -> Self {
        self.max_concurrent_runs = max;
        self
    }

    /// Set the retention window for terminal tasks.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Set the reaper sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the artifact directory.
    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = dir.into();
        self
    }

    /// Set the scratch directory.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }
}
