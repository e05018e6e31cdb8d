//! Stage executors: the opaque units performing one pipeline step.
//!
//! The orchestration engine never touches media itself; it sequences
//! [`StageExecutor`] implementations and persists the progress they report.
//! Executors own any temporary files they create and must release them before
//! returning, whether they succeed, fail, or abort on cancellation.

mod command;

pub use command::{CommandDownloader, CommandTransformer};

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::task::ProcessingMode;
use crate::pipeline::cancel::CancelFlag;

/// Channel on which a stage reports its own completion percentage (0-100).
///
/// Reports are advisory: the engine rate-limits persistence and clamps the
/// task's overall progress monotone, so a noisy or out-of-order sender cannot
/// violate the progress invariants.
pub type ProgressSender = mpsc::UnboundedSender<u8>;

/// Reference to a produced media artifact on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    path: PathBuf,
}

impl ArtifactRef {
    /// Wrap a path to a produced artifact.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The artifact's location on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Typed failure reported by a stage executor.
#[derive(Debug, Error)]
pub enum StageError {
    /// The stage observed its cancel flag and aborted.
    #[error("stage aborted: cancellation requested")]
    Cancelled,

    /// An external command exited unsuccessfully.
    #[error("`{command}` exited with status {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// An external command could not be launched at all.
    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Filesystem error while handling stage inputs or outputs.
    #[error("stage i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The source reference could not be used by this executor.
    #[error("unusable source reference: {0}")]
    BadSource(String),
}

/// Opaque unit performing one pipeline step against an external system.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Run the stage against `source_ref`.
    ///
    /// Implementations report coarse progress through `progress`, poll
    /// `cancel` at their own internal boundaries, and return either the
    /// produced artifact or a typed failure. On cancellation they clean up
    /// their partial output and return [`StageError::Cancelled`].
    async fn run(
        &self,
        source_ref: &str,
        mode: ProcessingMode,
        progress: ProgressSender,
        cancel: &CancelFlag,
    ) -> Result<ArtifactRef, StageError>;
}

/// Remove an artifact file, treating a missing file as success.
pub async fn remove_artifact(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
