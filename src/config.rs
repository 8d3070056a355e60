//! Engine configuration, read from TOML.
//!
//! ```toml
//! [engine]
//! node_timeout_secs = 900
//! cancel_on_failure = true
//! output_rule = { terminal = "CommitCreate" }
//! secret_namespace = "secrets"
//! log_level = "debug"
//! ```
//!
//! Every field is optional.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::{DeployGraphError, Result};

/// Which node's output becomes the deployment output.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputRule {
    /// Output of the last node, in registration order, that completed.
    #[default]
    LastCompleted,
    /// Output of the named node, whatever its position.
    Terminal(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Deadline applied to every task function that does not set its own.
    pub node_timeout_secs: Option<u64>,
    /// Fail not-yet-started nodes as soon as any node fails.
    pub cancel_on_failure: bool,
    pub output_rule: OutputRule,
    /// Namespace holding per-deployment secrets.
    pub secret_namespace: String,
    pub log_level: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_timeout_secs: None,
            cancel_on_failure: false,
            output_rule: OutputRule::LastCompleted,
            secret_namespace: "secrets".to_string(),
            log_level: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfigFile {
    #[serde(default)]
    engine: EngineConfig,
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            DeployGraphError::Validation(format!("reading config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let raw: RawConfigFile = toml::from_str(contents)
            .map_err(|e| DeployGraphError::Validation(format!("parsing config: {e}")))?;
        raw.engine.validate()?;
        Ok(raw.engine)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_timeout_secs == Some(0) {
            return Err(DeployGraphError::Validation(
                "node_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if let OutputRule::Terminal(name) = &self.output_rule {
            if name.trim().is_empty() {
                return Err(DeployGraphError::Validation(
                    "output_rule terminal task name must not be empty".to_string(),
                ));
            }
        }
        if self.secret_namespace.trim().is_empty() {
            return Err(DeployGraphError::Validation(
                "secret_namespace must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn node_timeout(&self) -> Option<Duration> {
        self.node_timeout_secs.map(Duration::from_secs)
    }
}
