//! Hub configuration
//!
//! ```toml
//! max_depth = 2
//! max_concurrency = 8
//! default_task_timeout_ms = 300000
//! state_dir = ".agents"
//! extra_kinds = ["security", "qa"]
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::agent::AgentKind;
use crate::error::{ConfigError, StoreError};
use crate::graph::CompileLimits;
use crate::request::whole_millis;
use crate::store::{AgentStateStore, FileStore, MemoryStore};

/// Settings for a [`crate::Hub`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Deepest delegation level a request may compile to
    pub max_depth: u32,
    /// Cap on invocations running at once across all executions; unbounded if unset
    pub max_concurrency: Option<usize>,
    /// Deadline applied to tasks that carry none of their own
    pub default_task_timeout_ms: Option<u64>,
    /// Directory for persisted agent records; in-memory if unset
    pub state_dir: Option<PathBuf>,
    /// Custom agent kinds accepted besides the built-in ones
    pub extra_kinds: Vec<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_depth: 2,
            max_concurrency: None,
            default_task_timeout_ms: None,
            state_dir: None,
            extra_kinds: Vec::new(),
        }
    }
}

impl HubConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the hub cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == Some(0) {
            return Err(ConfigError::Invalid("max_concurrency must be at least 1".into()));
        }
        if let Some(name) = self
            .extra_kinds
            .iter()
            .find(|name| !AgentKind::is_valid_name(AgentKind::from(name.as_str()).as_str()))
        {
            return Err(ConfigError::Invalid(format!(
                "extra kind {name:?} is not a valid agent name"
            )));
        }
        Ok(())
    }

    /// Read a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&contents)?;
        info!(path = %path.display(), "Loaded hub config");
        Ok(config)
    }

    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_task_timeout_ms = Some(whole_millis(timeout));
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn with_extra_kind(mut self, kind: impl Into<String>) -> Self {
        self.extra_kinds.push(kind.into());
        self
    }

    pub fn default_task_timeout(&self) -> Option<Duration> {
        self.default_task_timeout_ms.map(Duration::from_millis)
    }

    /// Limits for `compile`; extra kinds are normalized and unusable names dropped
    pub fn compile_limits(&self) -> CompileLimits {
        CompileLimits {
            max_depth: self.max_depth,
            extra_kinds: self
                .extra_kinds
                .iter()
                .map(|name| AgentKind::from(name.as_str()).to_string())
                .filter(|name| AgentKind::is_valid_name(name))
                .collect(),
        }
    }

    /// Store implied by `state_dir`
    pub fn open_store(&self) -> Result<Arc<dyn AgentStateStore>, StoreError> {
        match &self.state_dir {
            Some(dir) => Ok(Arc::new(FileStore::open(dir)?)),
            None => {
                debug!("No state_dir configured, keeping agent records in memory");
                Ok(Arc::new(MemoryStore::new()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.max_depth, 2);
        assert!(config.max_concurrency.is_none());
        assert!(config.default_task_timeout().is_none());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = HubConfig::from_toml_str(
            r#"
            max_concurrency = 4
            default_task_timeout_ms = 2500
            extra_kinds = ["qa"]
            "#,
        )
        .unwrap();

        assert_eq!(config.max_depth, 2);
        assert_eq!(config.max_concurrency, Some(4));
        assert_eq!(config.default_task_timeout(), Some(Duration::from_millis(2500)));
        assert!(config.compile_limits().extra_kinds.contains("qa"));
    }

    #[test]
    fn test_parse_rejects_bad_types() {
        let err = HubConfig::from_toml_str("max_depth = \"deep\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file_and_open_store() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("agents");
        let path = dir.path().join("conclave.toml");
        std::fs::write(
            &path,
            format!("max_depth = 3\nstate_dir = {:?}\n", state.display().to_string()),
        )
        .unwrap();

        let config = HubConfig::load(&path).unwrap();
        assert_eq!(config.max_depth, 3);

        let store = config.open_store().unwrap();
        store.get(&AgentKind::Backend).unwrap();
        assert!(state.join("backend").join("record.json").is_file());
    }

    #[test]
    fn test_load_missing_file() {
        let err = HubConfig::load("/nonexistent/conclave.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = HubConfig::from_toml_str("max_concurrency = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = HubConfig::from_toml_str(r#"extra_kinds = ["../escaped"]"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("escaped")));

        let config = HubConfig::default().with_extra_kind("a/b").with_extra_kind("QA");
        assert!(config.validate().is_err());
        let limits = config.compile_limits();
        assert!(limits.extra_kinds.contains("qa"));
        assert_eq!(limits.extra_kinds.len(), 1);
    }

    #[test]
    fn test_default_timeout_rounds_up() {
        let config = HubConfig::default().with_default_timeout(Duration::from_micros(500));
        assert_eq!(config.default_task_timeout_ms, Some(1));
        assert_eq!(config.default_task_timeout(), Some(Duration::from_millis(1)));
    }
}
