use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::workflow::MAX_SLA_DAYS;

/// Main configuration structure for the review workflow service
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReviewWorkflowConfig {
    /// Observability settings
    pub observability: ObservabilityConfig,
    /// RPC boundary settings
    pub service: ServiceConfig,
    /// SLA clock and sweep settings
    pub sla: SlaConfig,
    /// Conflict-of-interest detection settings
    pub coi: CoiConfig,
    /// Where workflow definitions come from and how long they are cached
    pub definitions: DefinitionsConfig,
    /// Database settings (optional)
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level used when RUST_LOG is not set
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones
    pub json_logs: bool,
    /// Log engine metrics on shutdown
    pub metrics_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Roles allowed to call override, clock-adjustment and analytics operations
    pub elevated_roles: Vec<String>,
    /// Actor id recorded for background jobs
    pub system_actor_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SlaConfig {
    /// Seconds between sweep ticks
    pub sweep_interval_seconds: u64,
    /// Window used by the sweep when none is given
    pub default_warning_days: i64,
    /// Minimum hours between two firings of a REPEATING escalation
    pub repeat_interval_hours: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CoiConfig {
    /// Former employers within this many years count as a conflict
    pub recent_employment_years: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DefinitionsConfig {
    /// Directory of TOML workflow definitions loaded at startup
    pub directory: PathBuf,
    /// Active-definition cache TTL
    pub cache_ttl_seconds: u64,
    /// Maximum cached definitions
    pub cache_capacity: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL (SQLite file path or connection string)
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

impl Default for ReviewWorkflowConfig {
    fn default() -> Self {
        Self {
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                json_logs: true,
                metrics_enabled: true,
            },
            service: ServiceConfig {
                elevated_roles: vec!["ADMIN".to_string(), "PROGRAM_MANAGER".to_string()],
                system_actor_id: "system".to_string(),
            },
            sla: SlaConfig {
                sweep_interval_seconds: 300,
                default_warning_days: 2,
                repeat_interval_hours: 24,
            },
            coi: CoiConfig {
                recent_employment_years: 2,
            },
            definitions: DefinitionsConfig {
                directory: PathBuf::from("definitions"),
                cache_ttl_seconds: 300,
                cache_capacity: 256,
            },
            database: None,
        }
    }
}

impl ReviewWorkflowConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (review-workflow.toml)
    /// 3. Environment variables (prefixed with REVIEW_WORKFLOW__)
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("review-workflow.toml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if path.exists() {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("REVIEW_WORKFLOW")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("service.elevated_roles")
                .try_parsing(true),
        );

        let config: ReviewWorkflowConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.sla.sweep_interval_seconds == 0 {
            anyhow::bail!("sla.sweep_interval_seconds must be positive");
        }
        if !(1..=24 * MAX_SLA_DAYS).contains(&self.sla.repeat_interval_hours) {
            anyhow::bail!("sla.repeat_interval_hours must be between 1 and {}", 24 * MAX_SLA_DAYS);
        }
        if !(0..=MAX_SLA_DAYS).contains(&self.sla.default_warning_days) {
            anyhow::bail!("sla.default_warning_days must be between 0 and {MAX_SLA_DAYS}");
        }
        if !(1..=100).contains(&self.coi.recent_employment_years) {
            anyhow::bail!("coi.recent_employment_years must be between 1 and 100");
        }
        Ok(())
    }

    pub fn is_elevated(&self, role: &str) -> bool {
        self.service.elevated_roles.iter().any(|r| r == role)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<ReviewWorkflowConfig, anyhow::Error>> = std::sync::LazyLock::new(|| {
    let _ = ReviewWorkflowConfig::load_env_file();
    ReviewWorkflowConfig::load()
});

/// Get the global configuration
pub fn config() -> Result<&'static ReviewWorkflowConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (called at startup)
pub fn init_config() -> Result<()> {
    let _config = config()?;
    tracing::info!("Configuration loaded successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() {
        let dir = TempDir::new().unwrap();
        let config = ReviewWorkflowConfig::load_from(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.sla.default_warning_days, 2);
        assert!(config.is_elevated("ADMIN"));
        assert!(!config.is_elevated("REVIEWER"));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("review-workflow.toml");

        let mut custom = ReviewWorkflowConfig::default();
        custom.sla.sweep_interval_seconds = 30;
        custom.service.elevated_roles = vec!["COORDINATOR".to_string()];
        custom.save_to_file(&path).unwrap();

        let loaded = ReviewWorkflowConfig::load_from(&path).unwrap();
        assert_eq!(loaded.sla.sweep_interval_seconds, 30);
        assert!(loaded.is_elevated("COORDINATOR"));
        assert!(!loaded.is_elevated("ADMIN"));
    }

    #[test]
    fn test_rejects_zero_sweep_interval() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("review-workflow.toml");
        let mut custom = ReviewWorkflowConfig::default();
        custom.sla.sweep_interval_seconds = 0;
        custom.save_to_file(&path).unwrap();
        assert!(ReviewWorkflowConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_rejects_out_of_range_durations() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("review-workflow.toml");

        let mut custom = ReviewWorkflowConfig::default();
        custom.coi.recent_employment_years = i64::MAX;
        custom.save_to_file(&path).unwrap();
        assert!(ReviewWorkflowConfig::load_from(&path).is_err());

        let mut custom = ReviewWorkflowConfig::default();
        custom.sla.repeat_interval_hours = i64::MAX / 1000;
        custom.save_to_file(&path).unwrap();
        assert!(ReviewWorkflowConfig::load_from(&path).is_err());
    }
}
