use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::telemetry::TelemetrySnapshot;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not determine the application data directory")]
    NoDataDir,
    #[error("Failed to serialize config value: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Failed to write config file {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Provider types supported by the application
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Provider {
    #[serde(rename = "open_ai", alias = "openai", alias = "open_a_i")]
    OpenAI,
    #[serde(
        rename = "azure_open_ai",
        alias = "azure",
        alias = "azure_openai",
        alias = "azure_open_a_i"
    )]
    AzureOpenAI,
    #[serde(rename = "local")]
    Local,
}

/// Type-safe configuration key that associates a key name with its value type
#[derive(Debug, Clone, Copy)]
pub struct ConfigKey<T> {
    name: &'static str,
    _phantom: PhantomData<T>,
}

impl<T> ConfigKey<T> {
    const fn new(name: &'static str) -> Self {
        Self {
            name,
            _phantom: PhantomData,
        }
    }

    pub fn key_name(&self) -> &'static str {
        self.name
    }
}

// ===== App Configuration =====

/// App configuration (stored locally)
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Currently active provider (only one can be active)
    #[serde(alias = "active_provider")]
    pub active_provider: Option<Provider>,
}

impl ConfigKey<AppConfig> {
    pub const APP: Self = Self::new("appConfig");
}

// ===== Local Model Configuration =====

/// Local model provider configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalModelConfig {
    /// Id of the selected model variant (e.g., "parakeet-ctc-0.6b-int8")
    #[serde(alias = "selected_model")]
    pub selected_model: Option<String>,
    /// Id of the download source last used for the selected model
    #[serde(default, alias = "source_id")]
    pub source_id: Option<String>,
    /// Operator-supplied interpreter, trusted only after an import check
    #[serde(default, alias = "python_override")]
    pub python_override: Option<PathBuf>,
    /// Inference worker script; defaults to the bundled copy
    #[serde(default, alias = "worker_script")]
    pub worker_script: Option<PathBuf>,
}

impl ConfigKey<LocalModelConfig> {
    pub const LOCAL_MODEL: Self = Self::new("localModelConfig");
}

// ===== Telemetry =====

impl ConfigKey<TelemetrySnapshot> {
    pub const TELEMETRY: Self = Self::new("provisioningTelemetry");
}

// ===== Type-Safe Config Store =====

pub trait ConfigStore {
    fn get<T: DeserializeOwned>(&self, key: &ConfigKey<T>) -> Option<T>;
    fn set<T: Serialize>(&self, key: &ConfigKey<T>, value: T) -> Result<(), ConfigError>;
    fn delete<T>(&self, key: &ConfigKey<T>) -> Result<(), ConfigError>;
}

/// JSON document on disk holding every config key.
///
/// Saves go to a sibling temp file first and are renamed into place.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl JsonFileStore {
    /// Open the store, starting empty when the file is missing or unreadable.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Map<String, Value>>(&raw) {
                Ok(values) => values,
                Err(e) => {
                    warn!("Ignoring unreadable config file {:?}: {}", path, e);
                    Map::new()
                }
            },
            Err(_) => {
                debug!("No config file at {:?}, starting empty", path);
                Map::new()
            }
        };

        Self {
            path,
            values: Mutex::new(values),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().unwrap().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: Value) {
        self.values.lock().unwrap().insert(key.to_string(), value);
    }

    pub fn delete(&self, key: &str) {
        self.values.lock().unwrap().remove(key);
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let contents = {
            let values = self.values.lock().unwrap();
            serde_json::to_string_pretty(&*values)?
        };

        let write_err = |source| ConfigError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents).map_err(write_err)?;
        std::fs::rename(&tmp, &self.path).map_err(write_err)?;
        Ok(())
    }
}

/// Type-safe configuration store shared by every service
#[derive(Debug, Clone)]
pub struct Config {
    store: Arc<JsonFileStore>,
}

impl Config {
    pub fn new(store: Arc<JsonFileStore>) -> Self {
        Self { store }
    }

    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(JsonFileStore::open(path)))
    }

    /// Whether the local provider is the active one.
    pub fn local_provider_selected(&self) -> bool {
        self.get(&ConfigKey::APP)
            .and_then(|app| app.active_provider)
            == Some(Provider::Local)
    }

    pub fn set_active_provider(&self, provider: Provider) -> Result<(), ConfigError> {
        let mut app: AppConfig = self.get(&ConfigKey::APP).unwrap_or_default();
        app.active_provider = Some(provider);
        self.set(&ConfigKey::APP, app)
    }

    pub fn local_model(&self) -> LocalModelConfig {
        self.get(&ConfigKey::LOCAL_MODEL).unwrap_or_default()
    }

    /// Read-modify-write of the local model configuration.
    pub fn update_local_model(
        &self,
        update: impl FnOnce(&mut LocalModelConfig),
    ) -> Result<(), ConfigError> {
        let mut local = self.local_model();
        update(&mut local);
        self.set(&ConfigKey::LOCAL_MODEL, local)
    }
}

impl ConfigStore for Config {
    fn get<T: DeserializeOwned>(&self, key: &ConfigKey<T>) -> Option<T> {
        self.store
            .get(key.key_name())
            .and_then(|v| serde_json::from_value(v).ok())
    }

    fn set<T: Serialize>(&self, key: &ConfigKey<T>, value: T) -> Result<(), ConfigError> {
        let val = serde_json::to_value(value)?;
        self.store.set(key.key_name(), val);
        self.store.save()
    }

    fn delete<T>(&self, key: &ConfigKey<T>) -> Result<(), ConfigError> {
        self.store.delete(key.key_name());
        self.store.save()
    }
}
