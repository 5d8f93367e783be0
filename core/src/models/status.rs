use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::catalog::ModelVariant;
use super::sources::{RemoteArtifact, ResolvedSource};
use crate::paths::AppPaths;

/// Tokenizer names the worker looks for next to the model.
pub const CONVENTIONAL_TOKENIZERS: [&str; 3] = ["tokenizer.model", "tokenizer.json", "vocab.txt"];

/// Runtime status of a model - computed, not stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatus {
    /// Are all artifacts on disk and valid?
    pub is_ready: bool,
    /// Is a fetch currently running for the model?
    pub is_downloading: bool,
    /// Bytes held in `.partial` files (for resume support)
    pub downloaded_bytes: u64,
}

/// Local destination of every artifact of a variant for one source.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactLayout {
    pub primary: PathBuf,
    pub sidecar: Option<PathBuf>,
    pub tokenizer: Option<PathBuf>,
    pub auxiliary: Vec<PathBuf>,
}

impl ArtifactLayout {
    pub fn new(paths: &AppPaths, variant: &ModelVariant, source: &ResolvedSource) -> Self {
        let primary = paths.model_path(variant);
        let dir = primary.parent().map(Path::to_path_buf).unwrap_or_default();
        let beside = |artifact: &RemoteArtifact| artifact.filename().map(|name| dir.join(name));

        Self {
            sidecar: source.sidecar.as_ref().map(|_| sidecar_path(&primary)),
            tokenizer: source.tokenizer.as_ref().and_then(beside),
            auxiliary: source.auxiliary.iter().filter_map(beside).collect(),
            primary,
        }
    }

    /// Every final artifact path.
    pub fn all(&self) -> Vec<&Path> {
        let mut all = vec![self.primary.as_path()];
        all.extend(self.sidecar.as_deref());
        all.extend(self.tokenizer.as_deref());
        all.extend(self.auxiliary.iter().map(PathBuf::as_path));
        all
    }

    /// Configured tokenizer, or the first conventional one on disk.
    pub fn resolve_tokenizer(&self) -> Option<PathBuf> {
        match &self.tokenizer {
            Some(path) => path.is_file().then(|| path.clone()),
            None => self.primary.parent().and_then(probe_tokenizer),
        }
    }
}

/// `<primary>.data`, where ONNX external tensor data lives.
pub fn sidecar_path(primary: &Path) -> PathBuf {
    let mut name = primary.as_os_str().to_owned();
    name.push(".data");
    PathBuf::from(name)
}

/// Temporary sibling a transfer writes into before placement.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

pub fn probe_tokenizer(dir: &Path) -> Option<PathBuf> {
    CONVENTIONAL_TOKENIZERS
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Outcome of the filesystem-only readiness check.
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    Ready,
    Missing(PathBuf),
    TooSmall {
        path: PathBuf,
        actual: u64,
        minimum: u64,
    },
    SizeMismatch {
        path: PathBuf,
        actual: u64,
        expected: u64,
    },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        *self == Readiness::Ready
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Ready => write!(f, "ready"),
            Readiness::Missing(path) => write!(f, "{} is missing", path.display()),
            Readiness::TooSmall {
                path,
                actual,
                minimum,
            } => write!(
                f,
                "{} is too small ({} bytes, need at least {})",
                path.display(),
                actual,
                minimum
            ),
            Readiness::SizeMismatch {
                path,
                actual,
                expected,
            } => write!(
                f,
                "{} has {} bytes, expected {}",
                path.display(),
                actual,
                expected
            ),
        }
    }
}

/// Decide from file metadata alone whether a variant is usable.
///
/// Never reads file contents or touches the network, so repeated calls
/// on an unchanged directory return the same verdict.
pub fn check_readiness(
    variant: &ModelVariant,
    source: &ResolvedSource,
    layout: &ArtifactLayout,
) -> Readiness {
    let primary = check_file(
        &layout.primary,
        variant.min_valid_size,
        source.model.expected_size,
    );
    if !primary.is_ready() {
        return primary;
    }

    let secondary = [
        (layout.sidecar.as_ref(), source.sidecar.as_ref()),
        (layout.tokenizer.as_ref(), source.tokenizer.as_ref()),
    ]
    .into_iter()
    .chain(
        layout
            .auxiliary
            .iter()
            .zip(source.auxiliary.iter())
            .map(|(path, artifact)| (Some(path), Some(artifact))),
    );

    for (path, artifact) in secondary {
        if let (Some(path), Some(artifact)) = (path, artifact) {
            let verdict = check_file(path, 1, artifact.expected_size);
            if !verdict.is_ready() {
                return verdict;
            }
        }
    }

    Readiness::Ready
}

fn check_file(path: &Path, minimum: u64, expected: Option<u64>) -> Readiness {
    let actual = match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => return Readiness::Missing(path.to_path_buf()),
    };
    if actual < minimum {
        return Readiness::TooSmall {
            path: path.to_path_buf(),
            actual,
            minimum,
        };
    }
    match expected {
        Some(expected) if expected != actual => Readiness::SizeMismatch {
            path: path.to_path_buf(),
            actual,
            expected,
        },
        _ => Readiness::Ready,
    }
}

/// Bytes sitting in `.partial` files for the layout.
pub fn partial_bytes(layout: &ArtifactLayout) -> u64 {
    layout
        .all()
        .into_iter()
        .filter_map(|path| std::fs::metadata(partial_path(path)).ok())
        .map(|meta| meta.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::catalog::ModelVariant;
    use crate::models::sources::{SourceCandidate, SourceCatalog};
    use crate::models::RemoteFiles;

    fn variant() -> ModelVariant {
        ModelVariant {
            id: "tiny".into(),
            display_name: "Tiny".into(),
            description: String::new(),
            expected_size: 20,
            min_valid_size: 8,
            relative_path: "tiny/model.onnx".into(),
            files: RemoteFiles {
                model: "model.onnx".into(),
                sidecar: None,
                tokenizer: Some("vocab.txt".into()),
                auxiliary: vec![],
            },
        }
    }

    fn source(variant: &ModelVariant) -> ResolvedSource {
        SourceCatalog::new(vec![SourceCandidate {
            id: "local".into(),
            display_name: "Local".into(),
            base_url: "http://127.0.0.1:9".into(),
            runnable: true,
            model_file: None,
        }])
        .recommended(variant)
        .expect("source")
    }

    #[test]
    fn readiness_follows_files_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path());
        let variant = variant();
        let source = source(&variant);
        let layout = ArtifactLayout::new(&paths, &variant, &source);

        assert!(matches!(
            check_readiness(&variant, &source, &layout),
            Readiness::Missing(_)
        ));

        std::fs::create_dir_all(layout.primary.parent().unwrap()).unwrap();
        std::fs::write(&layout.primary, b"abc").unwrap();
        assert!(matches!(
            check_readiness(&variant, &source, &layout),
            Readiness::TooSmall { actual: 3, minimum: 8, .. }
        ));

        std::fs::write(&layout.primary, b"0123456789").unwrap();
        assert_eq!(
            check_readiness(&variant, &source, &layout),
            Readiness::Missing(layout.tokenizer.clone().unwrap())
        );

        std::fs::write(layout.tokenizer.as_ref().unwrap(), b"a\nb\n").unwrap();
        let first = check_readiness(&variant, &source, &layout);
        let second = check_readiness(&variant, &source, &layout);
        assert!(first.is_ready());
        assert_eq!(first, second);
    }

    #[test]
    fn partial_files_are_ignored_by_readiness() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path());
        let variant = variant();
        let source = source(&variant);
        let layout = ArtifactLayout::new(&paths, &variant, &source);

        std::fs::create_dir_all(layout.primary.parent().unwrap()).unwrap();
        std::fs::write(partial_path(&layout.primary), vec![0u8; 64]).unwrap();

        assert!(!check_readiness(&variant, &source, &layout).is_ready());
        assert_eq!(partial_bytes(&layout), 64);
    }

    #[test]
    fn tokenizer_probing_uses_conventional_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("tokenizer.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("vocab.txt"), b"a").unwrap();

        assert_eq!(
            probe_tokenizer(dir.path()),
            Some(dir.path().join("tokenizer.json"))
        );
    }

    #[test]
    fn sibling_paths() {
        let primary = Path::new("/m/parakeet/model.onnx");
        assert_eq!(sidecar_path(primary), PathBuf::from("/m/parakeet/model.onnx.data"));
        assert_eq!(
            partial_path(primary),
            PathBuf::from("/m/parakeet/model.onnx.partial")
        );
    }
}
