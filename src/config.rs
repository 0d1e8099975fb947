use crate::error::{DistributionError, Result};
use crate::types::*;
use chrono::Weekday;
use config::{Config, ConfigError, Environment, File};
use std::env;

/// Burn account; sorts before every real account in the frontier chain
pub const BURN_ACCOUNT: &str = "nano_1111111111111111111111111111111111111111111111111111hifc8npp";

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                rpc_url: "http://127.0.0.1:7076".to_string(),
                request_timeout_secs: 30,
            },
            enumeration: EnumerationConfig {
                anchor_account: BURN_ACCOUNT.to_string(),
                page_size: 500_000,
            },
            classification: ClassificationConfig {
                batch_size: 5_000,
                batch_delay_ms: 1_000,
                history_count: 2,
                max_concurrent_history: 500,
                excluded_window_start: 1_598_572_800,
                excluded_window_end: 1_598_659_200,
            },
            storage: StorageConfig {
                data_dir: "./data".to_string(),
            },
            schedule: ScheduleConfig {
                weekdays: vec!["tue".to_string(), "fri".to_string()],
                hour: 5,
                minute: 15,
                utc_offset_minutes: 0,
            },
            retry: RetryConfig {
                max_attempts: 5,
                base_delay_ms: 250,
                max_delay_ms: 5_000,
                jitter_pct: 0.2,
            },
            status_report_interval_secs: 30,
        }
    }
}

impl IndexerConfig {
    /// Load configuration from config files and environment variables
    pub fn load() -> Result<Self> {
        let mut config_builder =
            Config::builder().add_source(Config::try_from(&IndexerConfig::default())?);

        if let Ok(config_file) = env::var("DISTRIBUTION_CONFIG_FILE") {
            config_builder = config_builder.add_source(File::with_name(&config_file).required(false));
        }

        config_builder = config_builder
            .add_source(File::with_name("distribution.toml").required(false))
            .add_source(File::with_name("config/distribution.toml").required(false))
            .add_source(File::with_name("/etc/distribution-indexer/config.toml").required(false))
            .add_source(Self::environment());

        let indexer_config: IndexerConfig = config_builder.build()?.try_deserialize()?;
        indexer_config.validate()?;
        Ok(indexer_config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(Config::try_from(&IndexerConfig::default())?)
            .add_source(File::with_name(path))
            .build()?;

        let indexer_config: IndexerConfig = config.try_deserialize()?;
        indexer_config.validate()?;
        Ok(indexer_config)
    }

    /// Create configuration from environment variables only
    pub fn from_env() -> Result<Self> {
        let config = Config::builder()
            .add_source(Config::try_from(&IndexerConfig::default())?)
            .add_source(Self::environment())
            .build()?;

        let indexer_config: IndexerConfig = config.try_deserialize()?;
        indexer_config.validate()?;
        Ok(indexer_config)
    }

    // DISTRIBUTION_NODE__RPC_URL -> node.rpc_url
    fn environment() -> Environment {
        Environment::with_prefix("DISTRIBUTION")
            .prefix_separator("_")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("schedule.weekdays")
            .try_parsing(true)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.node.rpc_url.trim().is_empty() {
            return Err(invalid("Node RPC URL cannot be empty"));
        }

        if !self.node.rpc_url.starts_with("http://") && !self.node.rpc_url.starts_with("https://") {
            return Err(invalid("Node RPC URL must start with http:// or https://"));
        }

        if self.node.request_timeout_secs == 0 {
            return Err(invalid("Request timeout must be greater than 0"));
        }

        if self.enumeration.anchor_account.trim().is_empty() {
            return Err(invalid("Anchor account cannot be empty"));
        }

        if self.enumeration.page_size == 0 {
            return Err(invalid("Page size must be greater than 0"));
        }

        if self.classification.batch_size == 0 {
            return Err(invalid("Batch size must be greater than 0"));
        }

        if self.classification.history_count == 0 {
            return Err(invalid("History count must be greater than 0"));
        }

        if self.classification.max_concurrent_history == 0 {
            return Err(invalid("Max concurrent history lookups must be greater than 0"));
        }

        if self.classification.excluded_window_start > self.classification.excluded_window_end {
            return Err(invalid("Excluded window start must not be after its end"));
        }

        if self.storage.data_dir.trim().is_empty() {
            return Err(invalid("Data directory cannot be empty"));
        }

        if self.schedule.weekdays.is_empty() {
            return Err(invalid("At least one schedule weekday must be specified"));
        }

        for day in &self.schedule.weekdays {
            if day.trim().parse::<Weekday>().is_err() {
                return Err(invalid(&format!("Unknown schedule weekday '{}'", day)));
            }
        }

        if self.schedule.hour > 23 || self.schedule.minute > 59 {
            return Err(invalid("Schedule time must be a valid hour (0-23) and minute (0-59)"));
        }

        if self.schedule.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(invalid("Schedule UTC offset must be less than 24 hours"));
        }

        if self.retry.max_attempts == 0 {
            return Err(invalid("Retry max attempts must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.retry.jitter_pct) {
            return Err(invalid("Retry jitter must be between 0 and 1"));
        }

        if self.status_report_interval_secs == 0 {
            return Err(invalid("Status report interval must be greater than 0"));
        }

        Ok(())
    }

    /// Calendar rebuilds only fire in production
    pub fn is_production(&self) -> bool {
        environment_name() == "production"
    }

    /// Check if this is a development environment
    pub fn is_development(&self) -> bool {
        environment_name() == "development"
    }

    /// Get the log level
    pub fn log_level(&self) -> String {
        env::var("DISTRIBUTION_LOG_LEVEL")
            .or_else(|_| env::var("RUST_LOG"))
            .unwrap_or_else(|_| {
                if self.is_development() {
                    "debug".to_string()
                } else {
                    "info".to_string()
                }
            })
    }
}

fn environment_name() -> String {
    env::var("DISTRIBUTION_ENV")
        .or_else(|_| env::var("RUST_ENV"))
        .unwrap_or_default()
}

fn invalid(message: &str) -> DistributionError {
    DistributionError::Config(ConfigError::Message(message.to_string()))
}

/// Initialize tracing with the given configuration
pub fn init_tracing(config: &IndexerConfig) -> Result<()> {
    use tracing_subscriber::{filter::LevelFilter, fmt, EnvFilter};

    let log_level = config.log_level();

    let mut filter = EnvFilter::builder()
        .with_default_directive(
            log_level
                .parse::<LevelFilter>()
                .unwrap_or(LevelFilter::INFO)
                .into(),
        )
        .from_env_lossy();

    if let Ok(directive) = "hyper=info".parse() {
        filter = filter.add_directive(directive);
    }
    if let Ok(directive) = "reqwest=info".parse() {
        filter = filter.add_directive(directive);
    }

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(config.is_development())
        .try_init()
        .map_err(|e| DistributionError::Other(format!("Failed to initialize tracing: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = IndexerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.enumeration.anchor_account, BURN_ACCOUNT);
        assert_eq!(config.classification.batch_size, 5_000);
    }

    #[test]
    fn test_empty_rpc_url() {
        let mut config = IndexerConfig::default();
        config.node.rpc_url = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let mut config = IndexerConfig::default();
        config.enumeration.page_size = 0;
        assert!(config.validate().is_err());

        let mut config = IndexerConfig::default();
        config.classification.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_window_rejected() {
        let mut config = IndexerConfig::default();
        config.classification.excluded_window_start = config.classification.excluded_window_end + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_schedule() {
        let mut config = IndexerConfig::default();
        config.schedule.weekdays = vec!["someday".to_string()];
        assert!(config.validate().is_err());

        let mut config = IndexerConfig::default();
        config.schedule.hour = 24;
        assert!(config.validate().is_err());

        let mut config = IndexerConfig::default();
        config.schedule.weekdays.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[node]\nrpc_url = \"http://node.example:7076\"\n\n[classification]\nbatch_size = 100"
        )
        .unwrap();

        let config = IndexerConfig::load_from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.node.rpc_url, "http://node.example:7076");
        assert_eq!(config.classification.batch_size, 100);
        assert_eq!(config.classification.history_count, 2);
        assert_eq!(config.schedule.weekdays, vec!["tue", "fri"]);
    }
}
