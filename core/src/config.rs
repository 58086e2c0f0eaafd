// Configuration for a pairing endpoint
//
// Stored as JSON. Durations are written as integer milliseconds.

use crate::coordinator::CoordinatorConfig;
use crate::relay::RelayClientConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_RELAY_HOST: &str = "matrix.papers.tech";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairwireConfig {
    /// Application name announced in pairing requests and responses
    pub name: String,

    /// Optional icon url announced to the counterpart
    pub icon_url: Option<String>,

    /// Optional application url announced to the counterpart
    pub app_url: Option<String>,

    /// Candidate relay hosts; one is picked per replica by hash distance
    pub relay_hosts: Vec<String>,

    /// Number of concurrent relay connections
    pub replication_count: usize,

    pub relay: RelayClientConfig,

    pub coordinator: CoordinatorConfig,

    /// Upper bound for availability probes (e.g. extension discovery)
    #[serde(with = "duration_ms")]
    pub probe_timeout: Duration,
}

impl Default for PairwireConfig {
    fn default() -> Self {
        Self {
            name: "pairwire".to_string(),
            icon_url: None,
            app_url: None,
            relay_hosts: vec![DEFAULT_RELAY_HOST.to_string()],
            replication_count: 1,
            relay: RelayClientConfig::default(),
            coordinator: CoordinatorConfig::default(),
            probe_timeout: Duration::from_secs(1),
        }
    }
}

impl PairwireConfig {
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Load config from file, or return the default if it does not exist
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: PairwireConfig =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to encode config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.relay_hosts.is_empty(), "relay_hosts must not be empty");
        anyhow::ensure!(self.replication_count >= 1, "replication_count must be at least 1");
        Ok(())
    }
}

/// Serde adapter: `Duration` as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PairwireConfig::default();

        assert_eq!(config.relay_hosts, vec![DEFAULT_RELAY_HOST.to_string()]);
        assert_eq!(config.replication_count, 1);
        assert_eq!(config.relay.poll_timeout, Duration::from_secs(30));
        assert_eq!(config.relay.retry_budget, 3);
        assert_eq!(config.relay.retry_interval, Duration::from_secs(5));
        assert_eq!(config.coordinator.election_timeout, Duration::from_secs(1));
        assert_eq!(config.probe_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_durations_are_millis_on_disk() {
        let json = serde_json::to_value(PairwireConfig::default()).unwrap();

        assert_eq!(json["relay"]["poll_timeout"], 30_000);
        assert_eq!(json["probe_timeout"], 1_000);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: PairwireConfig =
            serde_json::from_str(r#"{"name":"wallet","relay":{"retry_budget":5}}"#).unwrap();

        assert_eq!(config.name, "wallet");
        assert_eq!(config.relay.retry_budget, 5);
        assert_eq!(config.relay.poll_timeout, Duration::from_secs(30));
        assert_eq!(config.replication_count, 1);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = PairwireConfig::with_name("dapp");
        config.relay_hosts = vec!["a.example.org".to_string(), "b.example.org".to_string()];

        config.save(&path).unwrap();
        assert_eq!(PairwireConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file_is_default_and_invalid_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            PairwireConfig::load(dir.path().join("absent.json")).unwrap(),
            PairwireConfig::default()
        );

        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"relay_hosts":[]}"#).unwrap();
        assert!(PairwireConfig::load(&path).is_err());
    }
}
