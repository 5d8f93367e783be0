mod catalog;
pub mod events;
mod fetcher;
pub mod sources;
mod status;
pub mod transfer;
mod verify;

pub use catalog::{
    default_variant, find_variant, get_model_catalog, is_model_in_catalog, ModelVariant,
    RemoteFiles,
};
pub use events::FetchEvent;
pub use fetcher::{ArtifactFetcher, FetchError, FetchFailureCategory, FetchReport, FetchSettings};
pub use sources::{RemoteArtifact, ResolvedSource, SourceCandidate, SourceCatalog};
pub use status::{
    check_readiness, partial_path, probe_tokenizer, sidecar_path, ArtifactLayout, ModelStatus,
    Readiness, CONVENTIONAL_TOKENIZERS,
};
pub use transfer::{ResumeToken, TransportKind};
pub use verify::sha256_file;

use serde::{Deserialize, Serialize};

/// Combined view for listing (catalog + status merged).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    // From catalog
    pub id: String,
    pub display_name: String,
    pub description: String,
    pub expected_size: u64,

    // From source
    pub source_id: String,
    pub source_error: Option<String>,

    // From status
    pub is_ready: bool,
    pub is_downloading: bool,
    pub downloaded_bytes: u64,
}

impl ModelInfo {
    pub fn from_catalog_and_status(
        variant: &ModelVariant,
        source: &ResolvedSource,
        status: &ModelStatus,
    ) -> Self {
        Self {
            id: variant.id.clone(),
            display_name: variant.display_name.clone(),
            description: variant.description.clone(),
            expected_size: variant.expected_size,
            source_id: source.source_id.clone(),
            source_error: source.validation_error.clone(),
            is_ready: status.is_ready,
            is_downloading: status.is_downloading,
            downloaded_bytes: status.downloaded_bytes,
        }
    }
}
