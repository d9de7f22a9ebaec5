//! Configuration for influence synchronization.
//!
//! Loaded from `sync_config.json` with an environment variable override.

use std::{
    env, fs, io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

pub const BUILTIN_SYNC_CONFIG: &str = include_str!("data/sync_config.json");

pub const SYNC_CONFIG_PATH_ENV: &str = "INFLUENCE_SYNC_CONFIG_PATH";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Wait after a scene finishes loading before the resync pass runs.
    pub settle_delay_ms: u64,
    /// Minimum gap between two outgoing broadcasts.
    pub broadcast_spacing_ms: u64,
    /// Run the consistency audit as part of the authority's scene pass.
    pub audit_on_scene_change: bool,
    /// Address the `sync_hub` relay listens on.
    pub relay_bind: SocketAddr,
    /// How long the relay waits on a peer that stopped reading before it
    /// drops that peer. Zero disables the limit.
    pub relay_write_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 500,
            broadcast_spacing_ms: 50,
            audit_on_scene_change: true,
            relay_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 41100),
            relay_write_timeout_ms: 2000,
        }
    }
}

impl SyncConfig {
    pub fn builtin() -> Arc<Self> {
        match Self::from_json_str(BUILTIN_SYNC_CONFIG) {
            Ok(config) => Arc::new(config),
            Err(err) => {
                tracing::error!(
                    target: "influence_sync::config",
                    error = %err,
                    "sync_config.builtin_invalid"
                );
                Arc::new(Self::default())
            }
        }
    }

    /// No settle delay and no pacing; every step happens on the next pump.
    pub fn immediate() -> Self {
        Self {
            settle_delay_ms: 0,
            broadcast_spacing_ms: 0,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_file(path: &Path) -> Result<Self, SyncConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| SyncConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = SyncConfig::from_json_str(&contents)?;
        Ok(config)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn broadcast_spacing(&self) -> Duration {
        Duration::from_millis(self.broadcast_spacing_ms)
    }

    pub fn relay_write_timeout(&self) -> Option<Duration> {
        (self.relay_write_timeout_ms > 0).then(|| Duration::from_millis(self.relay_write_timeout_ms))
    }
}

#[derive(Debug, Error)]
pub enum SyncConfigError {
    #[error("failed to parse sync config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read sync config from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Shared handle to the active configuration.
#[derive(Debug, Clone)]
pub struct SyncConfigHandle(pub Arc<SyncConfig>);

impl SyncConfigHandle {
    pub fn new(config: Arc<SyncConfig>) -> Self {
        Self(config)
    }

    pub fn get(&self) -> Arc<SyncConfig> {
        Arc::clone(&self.0)
    }

    pub fn replace(&mut self, config: Arc<SyncConfig>) {
        self.0 = config;
    }
}

/// Loads the config named by `INFLUENCE_SYNC_CONFIG_PATH`, falling back to the
/// builtin copy. Also returns the path that was used, if any.
pub fn load_sync_config_from_env() -> (Arc<SyncConfig>, Option<PathBuf>) {
    match env::var(SYNC_CONFIG_PATH_ENV).ok().map(PathBuf::from) {
        Some(path) => load_sync_config(Some(&path)),
        None => load_sync_config(None),
    }
}

pub fn load_sync_config(path: Option<&Path>) -> (Arc<SyncConfig>, Option<PathBuf>) {
    if let Some(path) = path {
        match SyncConfig::from_file(path) {
            Ok(config) => {
                tracing::info!(
                    target: "influence_sync::config",
                    path = %path.display(),
                    "sync_config.loaded=file"
                );
                return (Arc::new(config), Some(path.to_path_buf()));
            }
            Err(err) => {
                tracing::warn!(
                    target: "influence_sync::config",
                    path = %path.display(),
                    error = %err,
                    "sync_config.load_failed"
                );
            }
        }
    }

    tracing::info!(target: "influence_sync::config", "sync_config.loaded=builtin");
    (SyncConfig::builtin(), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_config_matches_defaults() {
        assert_eq!(*SyncConfig::builtin(), SyncConfig::default());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = SyncConfig::from_json_str(r#"{ "broadcast_spacing_ms": 10 }"#)
            .expect("partial config parses");
        assert_eq!(config.broadcast_spacing(), Duration::from_millis(10));
        assert_eq!(config.settle_delay_ms, 500);
        assert!(config.audit_on_scene_change);
        assert_eq!(config.relay_write_timeout(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn zero_write_timeout_disables_limit() {
        let config = SyncConfig::from_json_str(r#"{ "relay_write_timeout_ms": 0 }"#)
            .expect("config parses");
        assert_eq!(config.relay_write_timeout(), None);
    }

    #[test]
    fn missing_file_falls_back_to_builtin() {
        let (config, path) = load_sync_config(Some(Path::new("/nonexistent/sync_config.json")));
        assert!(path.is_none());
        assert_eq!(*config, SyncConfig::default());
    }

    #[test]
    fn bad_json_is_a_parse_error() {
        assert!(SyncConfig::from_json_str("{ nope").is_err());
    }
}
