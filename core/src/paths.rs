use std::path::{Path, PathBuf};

use crate::config::ConfigError;
use crate::models::ModelVariant;

const APP_DIR_NAME: &str = "Visperflow";

/// On-disk layout under the application-support root.
///
/// ```text
/// <root>/config.json
/// <root>/models/<variant relative path>
/// <root>/runtime/<provider>/venv/...
/// <root>/runtime/<provider>/python-packages/...
/// <root>/runtime/<provider>/bin/python-shim
/// <root>/runtime/toolchain/...
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    root: PathBuf,
}

impl AppPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Platform application-support directory (e.g. `~/Library/Application Support/Visperflow`).
    pub fn from_system() -> Result<Self, ConfigError> {
        let base = dirs_next::data_dir().ok_or(ConfigError::NoDataDir)?;
        Ok(Self::new(base.join(APP_DIR_NAME)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    /// Destination of a variant's primary artifact.
    pub fn model_path(&self, variant: &ModelVariant) -> PathBuf {
        self.models_dir().join(&variant.relative_path)
    }

    pub fn runtime_dir(&self, provider: &str) -> PathBuf {
        self.root.join("runtime").join(provider)
    }

    pub fn venv_dir(&self, provider: &str) -> PathBuf {
        self.runtime_dir(provider).join("venv")
    }

    pub fn venv_python(&self, provider: &str) -> PathBuf {
        let venv = self.venv_dir(provider);
        if cfg!(windows) {
            venv.join("Scripts").join("python.exe")
        } else {
            venv.join("bin").join("python")
        }
    }

    pub fn packages_dir(&self, provider: &str) -> PathBuf {
        self.runtime_dir(provider).join("python-packages")
    }

    pub fn shim_path(&self, provider: &str) -> PathBuf {
        self.runtime_dir(provider).join("bin").join("python-shim")
    }

    /// Cache for a downloaded portable interpreter.
    pub fn toolchain_dir(&self) -> PathBuf {
        self.root.join("runtime").join("toolchain")
    }

    /// Default location of the bundled inference worker script.
    pub fn default_worker_script(&self) -> PathBuf {
        self.root.join("scripts").join("parakeet_infer.py")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.models_dir())?;
        std::fs::create_dir_all(self.root.join("runtime"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::get_model_catalog;

    #[test]
    fn runtime_layout_is_per_provider() {
        let paths = AppPaths::new("/support");

        assert_eq!(
            paths.venv_dir("parakeet"),
            PathBuf::from("/support/runtime/parakeet/venv")
        );
        assert_eq!(
            paths.packages_dir("parakeet"),
            PathBuf::from("/support/runtime/parakeet/python-packages")
        );
        assert_eq!(
            paths.shim_path("parakeet"),
            PathBuf::from("/support/runtime/parakeet/bin/python-shim")
        );
        assert_eq!(paths.toolchain_dir(), PathBuf::from("/support/runtime/toolchain"));
    }

    #[test]
    fn model_path_uses_relative_path() {
        let paths = AppPaths::new("/support");
        let variant = &get_model_catalog()[0];

        let path = paths.model_path(variant);
        assert!(path.starts_with("/support/models"));
        assert!(path.ends_with(&variant.relative_path));
    }
}
