//! Store configuration, loadable from YAML or JSON. Every field has a default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::{BackoffExecutor, DEFAULT_MAX_ATTEMPTS};
use crate::error::StoreError;
use crate::repair::MAX_NESTING_DEPTH;
use crate::validation::{FOLDERS, SETTINGS, WORKFLOWS, WORKFLOW_HOSTS};

fn default_store_name() -> String {
    "local".to_string()
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_critical_keys() -> Vec<String> {
    [WORKFLOWS, FOLDERS, WORKFLOW_HOSTS, SETTINGS]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

fn default_max_nesting_depth() -> usize {
    MAX_NESTING_DEPTH
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Name reported in security incidents
    pub store_name: String,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Quiet period before a coalesced save is written
    pub debounce_ms: u64,
    /// Keys that get backups and read-back verification on every write
    pub critical_keys: Vec<String>,
    pub max_nesting_depth: usize,
    /// Backups kept per key by `purge_backups` when no count is given
    pub backup_retention: Option<usize>,
    pub audit_log_path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_name: default_store_name(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            debounce_ms: default_debounce_ms(),
            critical_keys: default_critical_keys(),
            max_nesting_depth: default_max_nesting_depth(),
            backup_retention: None,
            audit_log_path: None,
        }
    }
}

impl StoreConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self, StoreError> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| StoreError::Config(format!("invalid YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self, StoreError> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| StoreError::Config(format!("invalid JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json` file, or YAML for any other extension
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_yaml_str(&content)
        }
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.store_name.trim().is_empty() {
            return Err(StoreError::Config("store_name must not be empty".into()));
        }
        if self.max_attempts == 0 {
            return Err(StoreError::Config("max_attempts must be at least 1".into()));
        }
        if self.debounce_ms == 0 {
            return Err(StoreError::Config("debounce_ms must be at least 1".into()));
        }
        if self.max_nesting_depth == 0 {
            return Err(StoreError::Config(
                "max_nesting_depth must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn is_critical(&self, key: &str) -> bool {
        self.critical_keys.iter().any(|k| k == key)
    }

    pub fn backoff(&self) -> BackoffExecutor {
        BackoffExecutor::new(self.max_attempts, Duration::from_millis(self.base_delay_ms))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
