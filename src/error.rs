//! Error taxonomy for simulation setup and run-level failures.
//!
//! Attempt-level outcomes (transient failure, timeout, cancellation) are
//! data, not errors: they travel inside [`crate::types::AttemptResult`].
//! This module covers everything that should abort a run with exit code 2:
//! invalid configuration, output IO failures, and the deadlock sanity check
//! tripping on a workflow that can no longer make progress.

use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::types::WorkflowId;

/// Fatal, run-aborting failures.
#[derive(Debug)]
pub enum SimError {
    /// Configuration rejected before or during setup.
    InvalidConfig(String),
    /// Unknown scheduling policy name.
    UnknownPolicy(String),
    /// Output artifact could not be created or written.
    Io { path: PathBuf, source: io::Error },
    /// A live workflow has no runnable and no in-flight nodes. This means
    /// the DAG expansion rules produced a graph that cannot complete, which
    /// is a logic failure, not a workload property.
    StalledWorkflow(WorkflowId),
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            SimError::UnknownPolicy(name) => write!(f, "unknown policy: {name}"),
            SimError::Io { path, source } => {
                write!(f, "io error on {}: {source}", path.display())
            }
            SimError::StalledWorkflow(id) => {
                write!(f, "workflow {id} stalled: no runnable or in-flight nodes")
            }
        }
    }
}

impl std::error::Error for SimError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SimError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl SimError {
    /// Convenience constructor for output-path failures.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SimError::Io {
            path: path.into(),
            source,
        }
    }
}
