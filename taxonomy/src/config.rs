//! Catalog configuration loading
//!
//! Loads configuration from `~/.config/catalog/catalog.toml` (or `CATALOG_CONFIG` env).
//! Every key is optional; a missing file yields the defaults.

use crate::auditor::ShareBasis;
use crate::errors::{Result, TaxonomyError};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration for the catalog tooling
#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    /// Path to the warehouse SQLite database
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Path to the TOML rules document
    #[serde(default = "default_rules_path")]
    pub rules_path: String,

    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Convergence audit settings
    #[serde(default)]
    pub convergence: ConvergenceConfig,

    /// Offender listing settings
    #[serde(default)]
    pub offenders: OffendersConfig,
}

fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".config").join("catalog"))
}

fn default_db_path() -> String {
    config_dir()
        .map(|d| d.join("warehouse.db").to_string_lossy().into_owned())
        .unwrap_or_else(|| "warehouse.db".to_string())
}

fn default_rules_path() -> String {
    config_dir()
        .map(|d| d.join("rules.toml").to_string_lossy().into_owned())
        .unwrap_or_else(|| "rules.toml".to_string())
}

/// Classification engine configuration
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Split large batches across the rayon pool
    #[serde(default = "default_parallel")]
    pub parallel: bool,

    /// Smallest batch that is worth parallelizing
    #[serde(default = "default_parallel_min_batch")]
    pub parallel_min_batch: usize,
}

fn default_parallel() -> bool {
    true
}

fn default_parallel_min_batch() -> usize {
    2048
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallel: default_parallel(),
            parallel_min_batch: default_parallel_min_batch(),
        }
    }
}

/// Convergence audit configuration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ConvergenceConfig {
    /// Catch-all share of a category above which a warning is raised
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Compute shares over record counts or unit volume
    #[serde(default)]
    pub basis: ShareBasis,
}

fn default_threshold() -> f64 {
    0.20
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            basis: ShareBasis::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct OffendersConfig {
    #[serde(default = "default_offender_limit")]
    pub default_limit: usize,
}

fn default_offender_limit() -> usize {
    20
}

impl Default for OffendersConfig {
    fn default() -> Self {
        Self {
            default_limit: default_offender_limit(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            rules_path: default_rules_path(),
            engine: EngineConfig::default(),
            convergence: ConvergenceConfig::default(),
            offenders: OffendersConfig::default(),
        }
    }
}

impl CatalogConfig {
    /// Environment variable naming an explicit config file
    pub const ENV_CONFIG_PATH: &'static str = "CATALOG_CONFIG";

    pub const DEFAULT_CONFIG_FILENAME: &'static str = "catalog.toml";

    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let path = Self::resolve_config_path();

        if !path.exists() {
            tracing::info!(
                path = %path.display(),
                "Catalog config not found, using defaults"
            );
            return Ok(Self::default());
        }

        Self::load_from_path(&path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TaxonomyError::config_with_source(
                format!("failed to read config at {}", path.display()),
                e,
            )
        })?;

        Self::parse(&contents)
    }

    /// Parse configuration from TOML string
    pub fn parse(contents: &str) -> Result<Self> {
        let cfg: CatalogConfig = toml::from_str(contents)
            .map_err(|e| TaxonomyError::config_with_source("failed to parse config", e))?;

        cfg.validate()?;
        Ok(cfg)
    }

    fn resolve_config_path() -> PathBuf {
        if let Ok(path) = std::env::var(Self::ENV_CONFIG_PATH) {
            return PathBuf::from(path);
        }

        config_dir()
            .map(|d| d.join(Self::DEFAULT_CONFIG_FILENAME))
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_CONFIG_FILENAME))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let threshold = self.convergence.threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(TaxonomyError::config(format!(
                "convergence.threshold must be in (0, 1], got {threshold}"
            )));
        }

        if threshold < 0.01 {
            tracing::warn!(
                threshold,
                "Convergence threshold below 1%; nearly every catch-all will warn"
            );
        }

        if self.engine.parallel && self.engine.parallel_min_batch == 0 {
            tracing::warn!("engine.parallel_min_batch is 0; treating it as 1");
        }

        if self.offenders.default_limit == 0 {
            tracing::warn!("offenders.default_limit is 0; offender listings will be empty");
        }

        Ok(())
    }

    /// Get the resolved database path (expanding ~ if needed)
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_home(&self.db_path)
    }

    /// Get the resolved rules path (expanding ~ if needed)
    pub fn resolved_rules_path(&self) -> PathBuf {
        expand_home(&self.rules_path)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    PathBuf::from(path)
}
