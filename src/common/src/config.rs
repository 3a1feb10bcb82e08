use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

use crate::model::CleaningPolicy;

/// Object storage configuration for the table base path
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// DSN of the table base path (file://, memory:// or s3://)
    pub dsn: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("file:///.data/basindb"),
        }
    }
}

/// Retention/cleaning configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanerConfig {
    /// Which retention policy drives planning
    pub policy: CleaningPolicy,
    /// For `KeepLatestFileVersions`: slices retained per file group
    pub retained_file_versions: usize,
    /// For `KeepLatestCommits`: completed commits whose files are retained
    pub retained_commits: usize,
    /// Restrict planning to partitions touched since the last clean
    pub incremental_clean_mode: bool,
    /// Also delete external bootstrap source files when the original
    /// file-group version is cleaned
    pub clean_bootstrap_base_file_enabled: bool,
    /// Concurrent in-flight deletes during plan execution
    pub delete_parallelism: usize,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            policy: CleaningPolicy::KeepLatestCommits,
            retained_file_versions: 3,
            retained_commits: 10,
            incremental_clean_mode: false,
            clean_bootstrap_base_file_enabled: false,
            delete_parallelism: 10,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Configuration {
    /// Object storage configuration
    pub storage: StorageConfig,
    /// Cleaner/retention configuration
    pub cleaner: CleanerConfig,
}

impl Configuration {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file("basindb.toml"))
            .merge(Env::prefixed("BASINDB__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }
}
