//! Provisioning counters persisted alongside the rest of the config.
//!
//! Nothing leaves the machine; the snapshot exists so support can ask a user
//! to read it back (`visperflow-setup --telemetry`).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::{Config, ConfigKey, ConfigStore};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    /// Runtime bootstrap failures keyed by failure category
    #[serde(default)]
    pub bootstrap_failures: BTreeMap<String, u64>,
    #[serde(default)]
    pub bootstrap_retries: u64,
    /// Coordinator-level download retries (after a failed fetch)
    #[serde(default)]
    pub download_retries_scheduled: u64,
    /// Transport-level retries inside a single fetch
    #[serde(default)]
    pub download_retries_transport: u64,
    /// Download failures keyed by failure category
    #[serde(default)]
    pub download_failures: BTreeMap<String, u64>,
    /// Unix timestamp of the last update
    #[serde(default)]
    pub last_updated: Option<u64>,
}

/// Which layer scheduled a download retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLevel {
    Scheduled,
    Transport,
}

#[derive(Debug, Clone)]
pub struct Telemetry {
    config: Config,
    snapshot: Arc<Mutex<TelemetrySnapshot>>,
}

impl Telemetry {
    pub fn new(config: Config) -> Self {
        let snapshot = config.get(&ConfigKey::TELEMETRY).unwrap_or_default();
        Self {
            config,
            snapshot: Arc::new(Mutex::new(snapshot)),
        }
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.snapshot.lock().unwrap().clone()
    }

    pub fn record_bootstrap_failure(&self, category: &str) {
        self.update(|s| *s.bootstrap_failures.entry(category.to_string()).or_default() += 1);
    }

    pub fn record_bootstrap_retry(&self) {
        self.update(|s| s.bootstrap_retries += 1);
    }

    pub fn record_download_retry(&self, level: RetryLevel) {
        self.update(|s| match level {
            RetryLevel::Scheduled => s.download_retries_scheduled += 1,
            RetryLevel::Transport => s.download_retries_transport += 1,
        });
    }

    pub fn record_download_failure(&self, category: &str) {
        self.update(|s| *s.download_failures.entry(category.to_string()).or_default() += 1);
    }

    pub fn reset(&self) {
        self.update(|s| *s = TelemetrySnapshot::default());
    }

    fn update(&self, apply: impl FnOnce(&mut TelemetrySnapshot)) {
        let snapshot = {
            let mut snapshot = self.snapshot.lock().unwrap();
            apply(&mut snapshot);
            snapshot.last_updated = Some(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
            );
            snapshot.clone()
        };

        if let Err(e) = self.config.set(&ConfigKey::TELEMETRY, snapshot) {
            warn!("Failed to persist provisioning telemetry: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_persist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        let telemetry = Telemetry::new(Config::open(&path));

        telemetry.record_download_failure("transport");
        telemetry.record_download_failure("transport");
        telemetry.record_download_failure("integrity");
        telemetry.record_download_retry(RetryLevel::Scheduled);
        telemetry.record_download_retry(RetryLevel::Transport);
        telemetry.record_bootstrap_failure("command_timeout");
        telemetry.record_bootstrap_retry();

        let reloaded = Telemetry::new(Config::open(&path)).snapshot();
        assert_eq!(reloaded.download_failures.get("transport"), Some(&2));
        assert_eq!(reloaded.download_failures.get("integrity"), Some(&1));
        assert_eq!(reloaded.download_retries_scheduled, 1);
        assert_eq!(reloaded.download_retries_transport, 1);
        assert_eq!(reloaded.bootstrap_failures.get("command_timeout"), Some(&1));
        assert_eq!(reloaded.bootstrap_retries, 1);
        assert!(reloaded.last_updated.is_some());
    }

    #[test]
    fn reset_clears_counters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let telemetry = Telemetry::new(Config::open(dir.path().join("config.json")));

        telemetry.record_bootstrap_retry();
        telemetry.reset();

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.bootstrap_retries, 0);
        assert!(snapshot.bootstrap_failures.is_empty());
    }
}
