use std::fmt;
use std::str::FromStr;

/// Category of a failure reported by the worker itself.
///
/// Parsed once at the process boundary from either the structured `kind`
/// field or the upper-case code prefixing the message
/// (`DEPENDENCY_MISSING: ...`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::AsRefStr,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum WorkerErrorKind {
    DependencyMissing,
    DependencyError,
    #[strum(to_string = "model_load_error", serialize = "model_load")]
    ModelLoad,
    #[strum(to_string = "model_signature_error", serialize = "model_signature")]
    ModelSignature,
    #[strum(to_string = "model_output_error", serialize = "model_output")]
    ModelOutput,
    #[strum(to_string = "audio_format_error", serialize = "audio_format")]
    AudioFormat,
    TokenizerMissing,
    #[strum(to_string = "tokenizer_error", serialize = "tokenizer")]
    Tokenizer,
    #[strum(to_string = "inference_error", serialize = "inference")]
    Inference,
    Unknown,
}

impl WorkerErrorKind {
    /// Classify a worker error from its optional `kind` field and message.
    pub fn classify(kind: Option<&str>, message: &str) -> Self {
        if let Some(kind) = kind.and_then(|k| Self::from_str(k.trim()).ok()) {
            return kind;
        }

        let message = message.trim();
        if let Some((code, _)) = message.split_once(':') {
            if let Ok(kind) = Self::from_str(code.trim()) {
                return kind;
            }
        }

        // Workers predating error codes only surface the Python exception.
        if message.contains("ModuleNotFoundError") || message.contains("No module named") {
            return Self::DependencyMissing;
        }

        Self::Unknown
    }

    /// Whether the failure means the runtime or model on disk no longer
    /// matches what the worker expects.
    pub fn indicates_drift(self) -> bool {
        matches!(
            self,
            Self::DependencyMissing | Self::DependencyError | Self::ModelSignature
        )
    }
}

/// A failure reported by the worker, with its parsed category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    pub kind: WorkerErrorKind,
    pub message: String,
}

impl WorkerFailure {
    pub fn new(kind: Option<&str>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: WorkerErrorKind::classify(kind, &message),
            message,
        }
    }
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}
