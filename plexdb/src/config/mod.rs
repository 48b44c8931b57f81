use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// File name looked up in the database root by `Database::open`.
pub const CONFIG_FILE: &str = "plexdb.yaml";

/// Tunables for a database instance. Every field has a default, so a
/// `plexdb.yaml` only needs to list the values it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub cache: CacheConfig,
    /// Milliseconds between metadata autosaves
    pub autosave_interval_ms: u64,
    /// Default stagger between task invocations in `Collection::query_all`
    pub query_pacing_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Resident entry count at which the eviction check starts evicting
    pub high_water_mark: usize,
    /// Minimum number of entries dropped by one eviction pass
    pub eviction_batch: usize,
    /// Milliseconds between eviction checks
    pub check_interval_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            cache: CacheConfig::default(),
            autosave_interval_ms: 5_000,
            query_pacing_ms: 20,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            high_water_mark: 10_000,
            eviction_batch: 200,
            check_interval_ms: 1_000,
        }
    }
}

impl DatabaseConfig {
    /// Parse a configuration from a YAML string
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: DatabaseConfig = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Load `plexdb.yaml` from a database root, falling back to defaults
    /// when the file is not there.
    pub fn discover(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        if path.is_file() {
            log::debug!("Loading configuration from {}", path.display());
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_millis(self.autosave_interval_ms.max(1))
    }

    pub fn query_pacing(&self) -> Duration {
        Duration::from_millis(self.query_pacing_ms)
    }
}

impl CacheConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }
}
