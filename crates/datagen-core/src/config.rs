use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_MISFIRE_GRACE_SECS: u64 = 60;
pub const DEFAULT_TIMEZONE: &str = "Asia/Shanghai";
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_WEBHOOK_TIMEOUT_SECS: u64 = 30; // task-triggered delivery
pub const DEFAULT_TEST_TIMEOUT_SECS: u64 = 10; // ad-hoc "test" delivery

/// Top-level config (datagen.toml + DATAGEN_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatagenConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Worker pool and timing knobs for the recurring task scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of task runs executing at the same time.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// A fire that arrives later than this is treated as a misfire.
    #[serde(default = "default_misfire_grace_secs")]
    pub misfire_grace_secs: u64,
    /// Timezone applied to tasks created without one.
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
    /// How long `stop` waits for in-flight runs before giving up.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            misfire_grace_secs: DEFAULT_MISFIRE_GRACE_SECS,
            default_timezone: default_timezone(),
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
        }
    }
}

/// Output delivery settings shared by every sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,
    #[serde(default = "default_test_timeout_secs")]
    pub test_timeout_secs: u64,
    /// Fallback directory for the storage sink.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            webhook_timeout_secs: DEFAULT_WEBHOOK_TIMEOUT_SECS,
            test_timeout_secs: DEFAULT_TEST_TIMEOUT_SECS,
            storage_dir: default_storage_dir(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}
fn default_misfire_grace_secs() -> u64 {
    DEFAULT_MISFIRE_GRACE_SECS
}
fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}
fn default_shutdown_timeout_secs() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_SECS
}
fn default_webhook_timeout_secs() -> u64 {
    DEFAULT_WEBHOOK_TIMEOUT_SECS
}
fn default_test_timeout_secs() -> u64 {
    DEFAULT_TEST_TIMEOUT_SECS
}
fn default_user_agent() -> String {
    format!("datagen-scheduler/{}", env!("CARGO_PKG_VERSION"))
}
fn default_db_path() -> String {
    format!("{}/datagen.db", datagen_home())
}
fn default_storage_dir() -> String {
    format!("{}/exports", datagen_home())
}

fn datagen_home() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.datagen", home)
}

impl DatagenConfig {
    /// Load config from a TOML file with DATAGEN_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `DATAGEN_SCHEDULER__WORKERS=4`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: DatagenConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("DATAGEN_").split("__"))
            .extract()
            .map_err(|e| crate::error::DatagenError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        let problem = if self.scheduler.workers == 0 {
            Some("scheduler.workers must be at least 1".to_string())
        } else if self
            .scheduler
            .default_timezone
            .parse::<chrono_tz::Tz>()
            .is_err()
        {
            Some(format!(
                "unknown scheduler.default_timezone: {}",
                self.scheduler.default_timezone
            ))
        } else {
            None
        };

        match problem {
            Some(msg) => {
                warn!(%msg, "invalid configuration");
                Err(crate::error::DatagenError::Config(msg))
            }
            None => Ok(()),
        }
    }
}

fn default_config_path() -> String {
    format!("{}/datagen.toml", datagen_home())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_single_node_deployment() {
        let config = DatagenConfig::default();
        assert_eq!(config.scheduler.workers, 10);
        assert_eq!(config.scheduler.misfire_grace_secs, 60);
        assert_eq!(config.output.webhook_timeout_secs, 30);
        assert_eq!(config.output.test_timeout_secs, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_overrides_nested_sections() {
        let config: DatagenConfig = Figment::new()
            .merge(Toml::string(
                "[scheduler]\nworkers = 3\ndefault_timezone = \"UTC\"\n",
            ))
            .extract()
            .unwrap();
        assert_eq!(config.scheduler.workers, 3);
        assert_eq!(config.scheduler.default_timezone, "UTC");
        // untouched sections keep their defaults
        assert_eq!(config.output.test_timeout_secs, 10);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut config = DatagenConfig::default();
        config.scheduler.workers = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
        assert!(err.to_string().contains("scheduler.workers"));
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        let mut config = DatagenConfig::default();
        config.scheduler.default_timezone = "Mars/Olympus".to_string();
        assert!(config.validate().is_err());
    }
}
