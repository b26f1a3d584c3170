//! Configuration handling.
//!
//! Settings come from an optional `fp_pipeline.toml`, then `.env` /
//! environment overrides. Every section has defaults, so an empty or
//! missing file yields a working configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::db;
use crate::error::ConfigError;
use crate::rules::RuleSet;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "fp_pipeline.toml";

/// Environment variable overriding `database.path`.
pub const DB_PATH_ENV: &str = "FP_DB_PATH";

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Business rules (analytic ids, multipliers, split shares).
    #[serde(default)]
    pub rules: RuleSet,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Destination table for the cleaned summary.
    #[serde(default = "default_summary_table")]
    pub summary_table: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            summary_table: default_summary_table(),
        }
    }
}

fn default_db_path() -> String {
    "fp_data.db".to_string()
}

fn default_summary_table() -> String {
    "cleaned_fp_summary_data".to_string()
}

/// Execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Transformation workers; 0 means one per available core.
    #[serde(default)]
    pub worker_threads: usize,

    /// Raw records handed to a worker at a time.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_chunk_size() -> usize {
    5000
}

impl RuntimeConfig {
    pub fn effective_workers(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl PipelineConfig {
    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Load configuration with the standard precedence.
    ///
    /// An explicit path must exist; otherwise `fp_pipeline.toml` is used when
    /// present. `FP_DB_PATH` (also read from `.env`) overrides the database path.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => PipelineConfig::default(),
        };

        if let Ok(db_path) = std::env::var(DB_PATH_ENV) {
            if !db_path.trim().is_empty() {
                config.database.path = db_path;
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let table = &self.database.summary_table;
        if !db::is_valid_identifier(table) {
            return Err(ConfigError::Invalid {
                key: "database.summary_table".to_string(),
                message: format!("'{}' is not a valid table name", table),
            });
        }

        if self.runtime.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                key: "runtime.chunk_size".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        self.rules.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Method;
    use crate::rules::MultiplierScope;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.database.summary_table, "cleaned_fp_summary_data");
        assert_eq!(config.rules.national_label, "National");
        assert_eq!(config.rules.multiplier_scope, MultiplierScope::ServiceOnly);
        assert!(config.validate().is_ok());
        assert!(config.runtime.effective_workers() >= 1);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = PipelineConfig::from_toml("").unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_partial_toml_override() {
        let toml = r#"
            [database]
            path = "/tmp/fp.db"

            [rules]
            multiplier_scope = "all_methods"
            national_label = "Kenya"

            [rules.multipliers]
            "Male Condoms" = 12.0

            [[rules.method_rules]]
            id = "service"
            pattern = "711"
            method = "Service"

            [runtime]
            worker_threads = 2
        "#;

        let config = PipelineConfig::from_toml(toml).unwrap();
        assert_eq!(config.database.path, "/tmp/fp.db");
        assert_eq!(config.database.summary_table, "cleaned_fp_summary_data");
        assert_eq!(config.rules.multiplier_scope, MultiplierScope::AllMethods);
        assert_eq!(config.rules.national_label, "Kenya");
        assert_eq!(config.rules.multipliers.get("Male Condoms"), Some(&12.0));
        assert_eq!(config.rules.method_rules.len(), 1);
        assert_eq!(config.rules.method_rules[0].method, Method::Service);
        // Unspecified rule tables keep their defaults
        assert_eq!(config.rules.split_rules.len(), 1);
        assert_eq!(config.runtime.effective_workers(), 2);
    }

    #[test]
    fn test_invalid_table_name_rejected() {
        let toml = r#"
            [database]
            summary_table = "summary; DROP TABLE raw_fp_data"
        "#;
        assert!(matches!(
            PipelineConfig::from_toml(toml),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_invalid_split_rejected() {
        let toml = r#"
            [[rules.split_rules]]
            source = "2 Rod"
            parts = [
                { analytic = "Jadelle", share = 0.7 },
                { analytic = "Levoplant", share = 0.2 },
            ]
        "#;
        assert!(matches!(
            PipelineConfig::from_toml(toml),
            Err(ConfigError::InvalidSplitShares { .. })
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[runtime]\nchunk_size = 10").unwrap();
        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.runtime.chunk_size, 10);

        assert!(matches!(
            PipelineConfig::from_file(Path::new("/definitely/missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
