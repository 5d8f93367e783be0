//! Built-in download locations and their resolution for a variant.

use std::collections::BTreeSet;

use super::catalog::ModelVariant;

/// One file to download.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteArtifact {
    pub url: String,
    pub expected_size: Option<u64>,
    /// Lowercase hex SHA-256
    pub sha256: Option<String>,
}

impl RemoteArtifact {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            expected_size: None,
            sha256: None,
        }
    }

    /// Last path segment of the URL, without query or fragment.
    pub fn filename(&self) -> Option<&str> {
        let path = self.url.split(['?', '#']).next()?;
        path.rsplit('/').next().filter(|name| !name.is_empty())
    }
}

/// Concrete location of every artifact of one variant.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSource {
    pub source_id: String,
    pub display_name: String,
    pub model: RemoteArtifact,
    pub sidecar: Option<RemoteArtifact>,
    pub tokenizer: Option<RemoteArtifact>,
    pub auxiliary: Vec<RemoteArtifact>,
    /// Set when the source cannot produce a runnable model
    pub validation_error: Option<String>,
}

impl ResolvedSource {
    pub fn is_usable(&self) -> bool {
        self.validation_error.is_none()
    }
}

/// A repository that may host the catalog's files.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceCandidate {
    pub id: String,
    pub display_name: String,
    /// Prefix joined with each file name
    pub base_url: String,
    /// False for repositories that only host a format the worker cannot run
    pub runnable: bool,
    /// Replaces the catalog's primary file name
    pub model_file: Option<String>,
}

impl SourceCandidate {
    fn resolve(&self, variant: &ModelVariant) -> ResolvedSource {
        let url = |file: &str| format!("{}/{}", self.base_url.trim_end_matches('/'), file);
        let files = &variant.files;
        let model_file = self.model_file.as_deref().unwrap_or(&files.model);

        let model = RemoteArtifact::new(url(model_file));
        let validation_error = validate(self, &model);

        ResolvedSource {
            source_id: self.id.clone(),
            display_name: self.display_name.clone(),
            model,
            sidecar: files.sidecar.as_deref().map(|f| RemoteArtifact::new(url(f))),
            tokenizer: files.tokenizer.as_deref().map(|f| RemoteArtifact::new(url(f))),
            auxiliary: files
                .auxiliary
                .iter()
                .map(|f| RemoteArtifact::new(url(f)))
                .collect(),
            validation_error,
        }
    }
}

fn validate(candidate: &SourceCandidate, model: &RemoteArtifact) -> Option<String> {
    if !candidate.runnable {
        return Some(format!(
            "{} does not provide a model the local runtime can execute",
            candidate.display_name
        ));
    }
    match reqwest::Url::parse(&model.url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {}
        Ok(url) => return Some(format!("Unsupported URL scheme '{}'", url.scheme())),
        Err(e) => return Some(format!("Invalid model URL '{}': {}", model.url, e)),
    }
    match model.filename() {
        Some(name) if name.to_ascii_lowercase().ends_with(".onnx") => None,
        Some(name) => Some(format!("Model file '{}' is not an ONNX graph", name)),
        None => Some(format!("Model URL '{}' has no file name", model.url)),
    }
}

/// Ordered set of candidates; the first one is the recommended source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceCatalog {
    candidates: Vec<SourceCandidate>,
}

impl SourceCatalog {
    pub fn new(candidates: Vec<SourceCandidate>) -> Self {
        Self { candidates }
    }

    pub fn builtin() -> Self {
        Self::new(vec![
            SourceCandidate {
                id: "huggingface".into(),
                display_name: "Hugging Face (istupakov ONNX export)".into(),
                base_url: "https://huggingface.co/istupakov/parakeet-ctc-0.6b-onnx/resolve/main"
                    .into(),
                runnable: true,
                model_file: None,
            },
            SourceCandidate {
                id: "hf-mirror".into(),
                display_name: "HF Mirror".into(),
                base_url: "https://hf-mirror.com/istupakov/parakeet-ctc-0.6b-onnx/resolve/main"
                    .into(),
                runnable: true,
                model_file: None,
            },
            SourceCandidate {
                id: "nvidia-nemo".into(),
                display_name: "NVIDIA NeMo checkpoint".into(),
                base_url: "https://huggingface.co/nvidia/parakeet-ctc-0.6b/resolve/main".into(),
                runnable: false,
                model_file: Some("parakeet-ctc-0.6b.nemo".into()),
            },
        ])
    }

    pub fn candidates(&self) -> &[SourceCandidate] {
        &self.candidates
    }

    pub fn recommended_id(&self) -> Option<&str> {
        self.candidates.first().map(|c| c.id.as_str())
    }

    pub fn recommended(&self, variant: &ModelVariant) -> Option<ResolvedSource> {
        self.candidates.first().map(|c| c.resolve(variant))
    }

    /// Resolve by id; unknown ids fall back to the recommended source.
    pub fn resolve(&self, variant: &ModelVariant, source_id: Option<&str>) -> Option<ResolvedSource> {
        source_id
            .and_then(|id| self.candidates.iter().find(|c| c.id == id))
            .map(|c| c.resolve(variant))
            .or_else(|| self.recommended(variant))
    }

    /// First usable candidate not yet attempted.
    pub fn next_candidate(
        &self,
        variant: &ModelVariant,
        attempted: &BTreeSet<String>,
    ) -> Option<ResolvedSource> {
        self.candidates
            .iter()
            .filter(|c| !attempted.contains(&c.id))
            .map(|c| c.resolve(variant))
            .find(ResolvedSource::is_usable)
    }
}

impl Default for SourceCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
