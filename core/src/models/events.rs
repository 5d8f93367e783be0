//! Fetch lifecycle events.
//!
//! Broadcast by the fetcher to the provisioning coordinator and any UI layer.
//! Every fetch ends with exactly one of `Complete`, `Failed` or `Cancelled`.

use serde::{Deserialize, Serialize};

use super::fetcher::FetchFailureCategory;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum FetchEvent {
    /// A fetch was accepted for the variant
    Started {
        variant_id: String,
        source_id: String,
    },
    /// Overall progress across all artifacts, in `[0, 1]`
    Progress { variant_id: String, fraction: f64 },
    /// Transfer finished, validating artifacts
    Verifying { variant_id: String },
    /// Primary artifact was not found and another source took over
    SourceSwitched {
        variant_id: String,
        from: String,
        to: String,
    },
    Complete { variant_id: String },
    Failed {
        variant_id: String,
        error: String,
        category: FetchFailureCategory,
    },
    Cancelled { variant_id: String },
}

impl FetchEvent {
    pub fn variant_id(&self) -> &str {
        match self {
            FetchEvent::Started { variant_id, .. }
            | FetchEvent::Progress { variant_id, .. }
            | FetchEvent::Verifying { variant_id }
            | FetchEvent::SourceSwitched { variant_id, .. }
            | FetchEvent::Complete { variant_id }
            | FetchEvent::Failed { variant_id, .. }
            | FetchEvent::Cancelled { variant_id } => variant_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FetchEvent::Complete { .. } | FetchEvent::Failed { .. } | FetchEvent::Cancelled { .. }
        )
    }
}
