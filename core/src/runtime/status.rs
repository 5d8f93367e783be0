use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RuntimePhase {
    Idle,
    Bootstrapping,
    Ready,
    Failed,
}

impl RuntimePhase {
    /// `Ready -> Bootstrapping` is only taken for a forced repair.
    pub fn can_transition_to(self, next: RuntimePhase) -> bool {
        use RuntimePhase::*;
        matches!(
            (self, next),
            (Idle | Failed | Ready, Bootstrapping)
                | (Bootstrapping, Bootstrapping | Ready | Failed)
        )
    }
}

/// Fine-grained progress inside the bootstrapping phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum BootstrapStep {
    #[strum(to_string = "Preparing runtime directories")]
    PreparingDirectories,
    #[strum(to_string = "Selecting Python interpreter")]
    SelectingInterpreter,
    #[strum(to_string = "Downloading portable Python")]
    DownloadingInterpreter,
    #[strum(to_string = "Creating virtual environment")]
    CreatingEnvironment,
    #[strum(to_string = "Installing dependencies")]
    InstallingDependencies,
    #[strum(to_string = "Verifying dependency imports")]
    VerifyingImports,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeBootstrapStatus {
    pub phase: RuntimePhase,
    pub detail: String,
    pub runtime_root: Option<PathBuf>,
    pub executable: Option<PathBuf>,
    /// Failure category when `phase` is failed
    pub failure_category: Option<String>,
    /// Unix timestamp of the last change
    pub updated_at: u64,
}

impl RuntimeBootstrapStatus {
    fn idle(runtime_root: PathBuf) -> Self {
        Self {
            phase: RuntimePhase::Idle,
            detail: "Runtime not checked yet".to_string(),
            runtime_root: Some(runtime_root),
            executable: None,
            failure_category: None,
            updated_at: now(),
        }
    }
}

/// Process-wide status value with change notifications.
pub(crate) struct StatusCell {
    status: Mutex<RuntimeBootstrapStatus>,
    events: broadcast::Sender<RuntimeBootstrapStatus>,
}

impl StatusCell {
    pub(crate) fn new(runtime_root: PathBuf) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            status: Mutex::new(RuntimeBootstrapStatus::idle(runtime_root)),
            events,
        }
    }

    pub(crate) fn get(&self) -> RuntimeBootstrapStatus {
        self.status.lock().unwrap().clone()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<RuntimeBootstrapStatus> {
        self.events.subscribe()
    }

    /// Apply a change if the phase table allows it. Returns whether it did.
    pub(crate) fn publish(
        &self,
        phase: RuntimePhase,
        detail: impl Into<String>,
        executable: Option<PathBuf>,
        failure_category: Option<String>,
    ) -> bool {
        let snapshot = {
            let mut status = self.status.lock().unwrap();
            if !status.phase.can_transition_to(phase) {
                warn!(
                    "Ignoring runtime status change {} -> {}",
                    status.phase, phase
                );
                return false;
            }
            status.phase = phase;
            status.detail = detail.into();
            status.executable = executable;
            status.failure_category = failure_category;
            status.updated_at = now();
            status.clone()
        };

        debug!("Runtime {}: {}", snapshot.phase, snapshot.detail);
        let _ = self.events.send(snapshot);
        true
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
