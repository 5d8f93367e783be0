use visperflow_worker::{WorkerError, WorkerErrorKind};

use super::state_manager::{SessionState, TransitionRejection};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("A session is already active")]
    Busy(#[source] TransitionRejection),
    #[error("Local provider is not active")]
    ProviderInactive,
    #[error("Model setup in progress: {0}")]
    ModelSetupInProgress(String),
    #[error("Runtime setup in progress")]
    RuntimeSetupInProgress,
    #[error("Runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("Model validation failed: {0}")]
    ValidationFailed(#[source] WorkerError),
    #[error("No active session (state: {0})")]
    NotActive(SessionState),
    #[error("No audio captured")]
    NoAudio,
    #[error("Recording too short: {duration_ms}ms")]
    TooShort { duration_ms: u64 },
    #[error("Failed to write audio: {0}")]
    Audio(#[from] hound::Error),
    #[error("Local transcription failed: {0}")]
    Worker(#[source] WorkerError),
    #[error("Local runtime needs repair: {0}")]
    Drift(#[source] WorkerError),
    #[error("Background task failed: {0}")]
    Task(String),
}

impl SessionError {
    /// Map a worker failure, separating environment drift from ordinary errors.
    pub fn from_worker(err: WorkerError) -> Self {
        if err.indicates_drift() {
            SessionError::Drift(err)
        } else {
            SessionError::Worker(err)
        }
    }

    pub fn is_drift(&self) -> bool {
        match self {
            SessionError::Drift(_) => true,
            SessionError::ValidationFailed(e) => e.indicates_drift(),
            _ => false,
        }
    }

    /// Returns a user-friendly error message suitable for display in the UI
    pub fn user_message(&self) -> String {
        match self {
            SessionError::Busy(_) => "Already recording or transcribing. Please wait.".to_string(),
            SessionError::ProviderInactive => {
                "The local model is not the active provider. Select it in Preferences.".to_string()
            }
            SessionError::ModelSetupInProgress(_) => {
                "The local model is still downloading. Try again in a moment.".to_string()
            }
            SessionError::RuntimeSetupInProgress => {
                "The local runtime is being set up. Try again in a moment.".to_string()
            }
            SessionError::RuntimeUnavailable(_) => {
                "The local runtime is unavailable. A repair has been started.".to_string()
            }
            SessionError::ValidationFailed(e) if e.indicates_drift() => {
                "The local runtime needs repair. A repair has been started.".to_string()
            }
            SessionError::ValidationFailed(_) => {
                "The local model failed to load. Try downloading it again.".to_string()
            }
            SessionError::NotActive(_) => "No recording in progress.".to_string(),
            SessionError::NoAudio => "No audio was captured. Please try again.".to_string(),
            SessionError::TooShort { .. } => {
                "Recording too short. Hold the key a little longer.".to_string()
            }
            SessionError::Audio(_) => "Failed to save audio. Please try again.".to_string(),
            SessionError::Drift(_) => {
                "The local runtime needs repair. A repair has been started.".to_string()
            }
            SessionError::Worker(e) => match e {
                WorkerError::Timeout { .. } => "Transcription took too long. Try again.".to_string(),
                _ => match e.failure_kind() {
                    Some(WorkerErrorKind::AudioFormat) => {
                        "The recording could not be read. Please try again.".to_string()
                    }
                    Some(WorkerErrorKind::TokenizerMissing | WorkerErrorKind::Tokenizer) => {
                        "The model's tokenizer is missing. Try downloading the model again."
                            .to_string()
                    }
                    Some(WorkerErrorKind::ModelLoad) => {
                        "The local model failed to load. Try downloading it again.".to_string()
                    }
                    _ => "Local transcription failed. Please try again.".to_string(),
                },
            },
            SessionError::Task(_) => "Local transcription failed. Please try again.".to_string(),
        }
    }
}
