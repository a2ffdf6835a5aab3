//! Engine configuration.
//!
//! Every field has a default, so an empty TOML document (or `{}` in JSON)
//! yields the stock timings.

use crate::types::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Timing budgets for the transaction phases and retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Budget for a member to answer one query during PREPARE.
    #[serde(default = "default_phase_timeout")]
    pub prepare_timeout_ms: u64,
    #[serde(default = "default_phase_timeout")]
    pub precommit_timeout_ms: u64,
    #[serde(default = "default_phase_timeout")]
    pub commit_timeout_ms: u64,
    #[serde(default = "default_phase_timeout")]
    pub abort_timeout_ms: u64,
    /// A member not heard from within this window is considered expired.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,
    /// Retry delay while waiting on missing peers.
    #[serde(default = "default_retry_short")]
    pub retry_short_ms: u64,
    /// Retry delay after a failed transaction.
    #[serde(default = "default_retry_idle")]
    pub retry_idle_ms: u64,
}

// Default value functions
fn default_phase_timeout() -> u64 { 5_000 }
fn default_heartbeat_timeout() -> u64 { 30_000 }
fn default_retry_short() -> u64 { 2_000 }
fn default_retry_idle() -> u64 { 10_000 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            prepare_timeout_ms: default_phase_timeout(),
            precommit_timeout_ms: default_phase_timeout(),
            commit_timeout_ms: default_phase_timeout(),
            abort_timeout_ms: default_phase_timeout(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            retry_short_ms: default_retry_short(),
            retry_idle_ms: default_retry_idle(),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> EngineResult<Self> {
        toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Load config from a TOML file.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> EngineResult<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_timeout_ms)
    }

    pub fn precommit_timeout(&self) -> Duration {
        Duration::from_millis(self.precommit_timeout_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    pub fn abort_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_timeout_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn retry_short(&self) -> Duration {
        Duration::from_millis(self.retry_short_ms)
    }

    pub fn retry_idle(&self) -> Duration {
        Duration::from_millis(self.retry_idle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.prepare_timeout(), Duration::from_secs(5));
        assert_eq!(config.heartbeat_timeout_ms, 30_000);
        assert_eq!(config.retry_short(), Duration::from_secs(2));
        assert_eq!(config.retry_idle(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_toml() {
        let config = EngineConfig::from_toml_str("commit_timeout_ms = 250\n").unwrap();
        assert_eq!(config.commit_timeout_ms, 250);
        assert_eq!(config.prepare_timeout_ms, 5_000);
    }

    #[test]
    fn test_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str("{\"retry_idle_ms\": 1}").unwrap();
        assert_eq!(config.retry_idle_ms, 1);
        assert_eq!(config.abort_timeout_ms, 5_000);
    }

    #[test]
    fn test_bad_toml() {
        let err = EngineConfig::from_toml_str("prepare_timeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "prepare_timeout_ms = 100").unwrap();
        writeln!(file, "heartbeat_timeout_ms = 900").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.prepare_timeout_ms, 100);
        assert_eq!(config.heartbeat_timeout_ms, 900);

        let missing = EngineConfig::load(Path::new("/nonexistent/trellis.toml"));
        assert!(matches!(missing, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = EngineConfig {
            retry_short_ms: 7,
            ..Default::default()
        };
        let text = config.to_toml().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }
}
