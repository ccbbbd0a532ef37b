//! Configuration management for the query engine
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (query.toml)
//! - Environment variables (QUERY_*)
//!
//! ## Example config file (query.toml):
//! ```toml
//! [search]
//! max_search_count = 25
//! penalty_cost = 100.0
//!
//! [cache]
//! graph_capacity = 100
//! invocation_cache_enabled = true
//!
//! [query]
//! failure_behaviour = "throw"
//! ```

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::query::FailureBehaviour;

/// Main configuration for the query engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Path search settings
    #[serde(default)]
    pub search: SearchConfig,

    /// Cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Per-query defaults
    #[serde(default)]
    pub query: QueryDefaults,
}

/// Graph search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Maximum number of proposed paths per (start, target) pair
    #[serde(default = "default_max_search_count")]
    pub max_search_count: usize,

    /// Cost assigned to an edge implicated in a failed evaluation
    #[serde(default = "default_penalty_cost")]
    pub penalty_cost: f64,

    /// Cost of every edge before anything has been evaluated
    #[serde(default = "default_initial_edge_cost")]
    pub initial_edge_cost: f64,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached graphs per builder
    #[serde(default = "default_graph_capacity")]
    pub graph_capacity: usize,

    /// Wrap the operation invoker with a per-query result cache
    #[serde(default = "default_true")]
    pub invocation_cache_enabled: bool,
}

/// Defaults applied to each query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryDefaults {
    /// What to do when a top-level query cannot be resolved
    #[serde(default)]
    pub failure_behaviour: FailureBehaviour,

    /// Most operation calls in flight at once for a gather-mode query
    #[serde(default = "default_result_buffer")]
    pub result_buffer: usize,
}

// Default value functions
fn default_max_search_count() -> usize {
    25
}

fn default_penalty_cost() -> f64 {
    100.0
}

fn default_initial_edge_cost() -> f64 {
    1.0
}

fn default_graph_capacity() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_result_buffer() -> usize {
    16
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_search_count: default_max_search_count(),
            penalty_cost: default_penalty_cost(),
            initial_edge_cost: default_initial_edge_cost(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            graph_capacity: default_graph_capacity(),
            invocation_cache_enabled: true,
        }
    }
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            failure_behaviour: FailureBehaviour::default(),
            result_buffer: default_result_buffer(),
        }
    }
}

impl QueryConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from a specific file
    pub fn load_from(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        // Load from default locations
        let config_locations = ["query.toml", ".query.toml", "config/query.toml"];

        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        // Load from XDG config directory
        if let Some(config_dir) = directories::ProjectDirs::from("dev", "familiar", "query") {
            let xdg_config = config_dir.config_dir().join("query.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        // Load from specified path
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Load from environment variables (QUERY_*)
        builder = builder.add_source(
            Environment::with_prefix("QUERY")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Save configuration to a file
    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    pub fn with_max_search_count(mut self, count: usize) -> Self {
        self.search.max_search_count = count;
        self
    }

    pub fn with_failure_behaviour(mut self, behaviour: FailureBehaviour) -> Self {
        self.query.failure_behaviour = behaviour;
        self
    }

    pub fn with_invocation_cache(mut self, enabled: bool) -> Self {
        self.cache.invocation_cache_enabled = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueryConfig::default();
        assert_eq!(config.search.max_search_count, 25);
        assert_eq!(config.search.penalty_cost, 100.0);
        assert!(config.cache.invocation_cache_enabled);
        assert_eq!(config.query.failure_behaviour, FailureBehaviour::Throw);
    }

    #[test]
    fn test_serialize_config() {
        let config = QueryConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[search]"));
        assert!(toml_str.contains("[cache]"));
        assert!(toml_str.contains("failure_behaviour = \"throw\""));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[search]\nmax_search_count = 5\n\n[query]\nfailure_behaviour = \"send_failure_marker\"\n",
        )
        .unwrap();

        let config = QueryConfig::load_from(path.to_str()).unwrap();
        assert_eq!(config.search.max_search_count, 5);
        assert_eq!(config.search.penalty_cost, 100.0);
        assert_eq!(
            config.query.failure_behaviour,
            FailureBehaviour::SendFailureMarker
        );
    }

    #[test]
    fn test_builders() {
        let config = QueryConfig::default()
            .with_max_search_count(3)
            .with_invocation_cache(false);
        assert_eq!(config.search.max_search_count, 3);
        assert!(!config.cache.invocation_cache_enabled);
    }
}
