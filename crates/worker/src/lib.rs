//! Subprocess plumbing for the local inference worker.
//!
//! This crate owns everything that touches child processes: running host
//! commands under a deadline, the newline-delimited JSON protocol, and the
//! [`WorkerSupervisor`] that keeps one long-lived worker alive across calls.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use visperflow_worker::{WorkerIdentity, WorkerSupervisor};
//!
//! let supervisor = WorkerSupervisor::default();
//! let identity = WorkerIdentity::new(
//!     "/opt/runtime/venv/bin/python",
//!     "/opt/app/parakeet_infer.py",
//!     "/opt/models/parakeet/model.onnx",
//!     None,
//! );
//! let text = supervisor.transcribe(&identity, Path::new("/tmp/clip.wav"))?;
//! println!("{text}");
//! # Ok::<(), visperflow_worker::WorkerError>(())
//! ```

pub mod command;
mod error_kind;
mod process;
pub mod protocol;
mod supervisor;

use std::time::Duration;

pub use command::{run_with_timeout, terminate, CommandError, CommandOutput};
pub use error_kind::{WorkerErrorKind, WorkerFailure};
pub use process::WorkerIdentity;
pub use protocol::{Op, Request, Response};
pub use supervisor::{SupervisorConfig, WorkerSupervisor};

use thiserror::Error;

/// Errors from talking to the inference worker.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// The worker executable could not be launched.
    #[error("Failed to start worker {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A fresh worker never answered its warmup ping.
    #[error("Worker warmup failed: {0}")]
    WarmupFailed(Box<WorkerError>),

    /// The worker process went away while a request was outstanding.
    #[error("Worker exited unexpectedly (code {code:?})")]
    Exited { code: Option<i32>, stderr: String },

    /// No response line arrived before the deadline.
    #[error("Worker {op} request timed out after {}s", timeout.as_secs())]
    Timeout { op: Op, timeout: Duration },

    /// A response line was not valid protocol JSON.
    #[error("Malformed worker response: {0}")]
    MalformedResponse(String),

    /// The response answered a different request.
    #[error("Worker response id {actual} does not match request {expected}")]
    IdMismatch { expected: String, actual: String },

    /// The worker ran and reported a failure.
    #[error("{0}")]
    Failed(WorkerFailure),

    /// A one-shot invocation could not run to completion.
    #[error(transparent)]
    Command(#[from] CommandError),
}

impl WorkerError {
    /// Failures of the channel itself rather than of the work requested.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            WorkerError::Spawn { .. }
                | WorkerError::WarmupFailed(_)
                | WorkerError::Exited { .. }
                | WorkerError::Timeout { .. }
                | WorkerError::MalformedResponse(_)
                | WorkerError::IdMismatch { .. }
        )
    }

    /// The persistent worker could not be brought up at all.
    pub fn is_unusable_channel(&self) -> bool {
        matches!(self, WorkerError::Spawn { .. } | WorkerError::WarmupFailed(_))
    }

    /// Worker-reported category, including codes printed on stderr by a
    /// worker that crashed before it could answer.
    pub fn failure_kind(&self) -> Option<WorkerErrorKind> {
        match self {
            WorkerError::Failed(failure) => Some(failure.kind),
            WorkerError::WarmupFailed(inner) => inner.failure_kind(),
            WorkerError::Exited { stderr, .. } => {
                stderr
                    .lines()
                    .rev()
                    .map(|line| WorkerErrorKind::classify(None, line))
                    .find(|kind| *kind != WorkerErrorKind::Unknown)
            }
            _ => None,
        }
    }

    pub fn indicates_drift(&self) -> bool {
        self.failure_kind()
            .map(WorkerErrorKind::indicates_drift)
            .unwrap_or(false)
    }
}
