//! Store configuration.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use keg_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Query-string parameters attached to a store URI.
pub type StoreParams = BTreeMap<String, String>;

/// Configuration shared by every store backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// The logical store directory embedded in path fingerprints.
    #[serde(default = "default_store_dir")]
    pub store_dir: String,
    /// Capacity of the in-memory path-info cache.
    #[serde(default = "default_path_info_cache_size")]
    pub path_info_cache_size: usize,
    /// Seconds a cached "path exists" answer stays valid.
    #[serde(default = "default_ttl_positive_secs")]
    pub ttl_positive_secs: u64,
    /// Seconds a cached "path is absent" answer stays valid.
    #[serde(default = "default_ttl_negative_secs")]
    pub ttl_negative_secs: u64,
    /// Worker bound for parallel validity queries and closure copies.
    #[serde(default = "default_max_substitution_jobs")]
    pub max_substitution_jobs: usize,
    /// Keep copying remaining paths after a per-path failure.
    #[serde(default)]
    pub keep_going: bool,
    /// Maximum live connections per remote store.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Trusted public keys, `keyname:base64` each.
    #[serde(default)]
    pub trusted_public_keys: Vec<String>,
    /// Substituter store URIs, consulted in priority order.
    #[serde(default)]
    pub substituters: Vec<String>,
    /// Path of the on-disk lookup cache database, if any.
    #[serde(default)]
    pub disk_cache_path: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            path_info_cache_size: default_path_info_cache_size(),
            ttl_positive_secs: default_ttl_positive_secs(),
            ttl_negative_secs: default_ttl_negative_secs(),
            max_substitution_jobs: default_max_substitution_jobs(),
            keep_going: false,
            max_connections: default_max_connections(),
            trusted_public_keys: Vec::new(),
            substituters: Vec::new(),
            disk_cache_path: None,
        }
    }
}

impl StoreConfig {
    /// Load configuration from `keg.toml` layered with `KEG_*` environment
    /// variables.
    pub fn load() -> Result<Self> {
        Figment::new()
            .merge(Toml::file("keg.toml"))
            .merge(Env::prefixed("KEG_"))
            .extract()
            .map_err(|e| Error::Other(format!("configuration error: {e}")))
    }

    pub fn positive_ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_positive_secs)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_negative_secs)
    }

    pub fn store_dir(&self) -> Result<keg_core::StoreDir> {
        keg_core::StoreDir::new(self.store_dir.clone())
    }
}

fn default_store_dir() -> String {
    keg_core::DEFAULT_STORE_DIR.to_string()
}

fn default_path_info_cache_size() -> usize {
    65536
}

fn default_ttl_positive_secs() -> u64 {
    // 30 days; positive answers only change through explicit registration
    30 * 24 * 3600
}

fn default_ttl_negative_secs() -> u64 {
    3600
}

fn default_max_substitution_jobs() -> usize {
    16
}

fn default_max_connections() -> usize {
    4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.store_dir, "/nix/store");
        assert_eq!(config.negative_ttl(), Duration::from_secs(3600));
        assert!(!config.keep_going);
        assert!(config.store_dir().is_ok());
    }

    #[test]
    fn test_deserialize_partial_toml() {
        let config: StoreConfig =
            toml_from_str("store_dir = \"/gnu/store\"\nkeep_going = true\n");
        assert_eq!(config.store_dir, "/gnu/store");
        assert!(config.keep_going);
        // unspecified fields fall back to defaults
        assert_eq!(config.max_connections, 4);
    }

    fn toml_from_str(s: &str) -> StoreConfig {
        Figment::new()
            .merge(Toml::string(s))
            .extract()
            .unwrap()
    }
}
