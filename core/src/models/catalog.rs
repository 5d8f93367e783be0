use serde::{Deserialize, Serialize};

/// Files a variant is made of, named as they appear in a source repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFiles {
    /// Primary ONNX graph
    pub model: String,
    /// External tensor data stored next to the graph, if the export needs one
    pub sidecar: Option<String>,
    /// Tokenizer vocabulary
    pub tokenizer: Option<String>,
    /// Other files the worker reads (decoder/joint graphs, config, normalizer)
    pub auxiliary: Vec<String>,
}

/// Static information about a model variant.
/// This is hardcoded and never changes at runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelVariant {
    /// Unique identifier, no spaces (e.g., "parakeet-ctc-0.6b-int8")
    pub id: String,
    /// Human-readable name (e.g., "Parakeet CTC 0.6B INT8")
    pub display_name: String,
    pub description: String,
    /// Approximate size of all artifacts together, used for progress
    pub expected_size: u64,
    /// Smallest primary artifact that can be a complete model
    pub min_valid_size: u64,
    /// Primary artifact location relative to the models directory
    pub relative_path: String,
    pub files: RemoteFiles,
}

/// Check if a variant id exists in the catalog
pub fn is_model_in_catalog(id: &str) -> bool {
    get_model_catalog().iter().any(|v| v.id == id)
}

pub fn find_variant(id: &str) -> Option<ModelVariant> {
    get_model_catalog().into_iter().find(|v| v.id == id)
}

/// Variant used when nothing has been selected yet.
pub fn default_variant() -> ModelVariant {
    let mut catalog = get_model_catalog();
    catalog.remove(0)
}

/// Hardcoded catalog of local transcription models
/// ONNX exports of NVIDIA Parakeet CTC via Hugging Face
pub fn get_model_catalog() -> Vec<ModelVariant> {
    vec![
        ModelVariant {
            id: "parakeet-ctc-0.6b-int8".into(),
            display_name: "Parakeet CTC 0.6B INT8".into(),
            description: "Quantized English model, fast on CPU. Recommended.".into(),
            expected_size: 653_000_000, // ~623 MB total
            min_valid_size: 100 * 1024 * 1024,
            relative_path: "parakeet-ctc-0.6b-int8/model.int8.onnx".into(),
            files: RemoteFiles {
                model: "model.int8.onnx".into(),
                sidecar: None,
                tokenizer: Some("vocab.txt".into()),
                auxiliary: vec!["config.json".into()],
            },
        },
        ModelVariant {
            id: "parakeet-ctc-0.6b".into(),
            display_name: "Parakeet CTC 0.6B".into(),
            description: "Full precision English model. Slightly more accurate, needs ~3GB RAM."
                .into(),
            expected_size: 2_440_000_000, // ~2.3 GB, mostly external tensor data
            min_valid_size: 1024 * 1024,
            relative_path: "parakeet-ctc-0.6b/model.onnx".into(),
            files: RemoteFiles {
                model: "model.onnx".into(),
                sidecar: Some("model.onnx.data".into()),
                tokenizer: Some("vocab.txt".into()),
                auxiliary: vec!["config.json".into()],
            },
        },
    ]
}
