use proxy::config::{Config as ProxyConfig, ValidationError};
use serde::Deserialize;
use std::fs::File;
use std::path::Path;

#[derive(Clone, Debug, Deserialize)]
pub struct MetricsConfig {
    pub statsd_host: String,
    #[serde(default = "default_statsd_port")]
    pub statsd_port: u16,
}

fn default_statsd_port() -> u16 {
    8125
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfig {
    pub sentry_dsn: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
    #[serde(flatten)]
    pub proxy: ProxyConfig,
}

impl Config {
    /// Loads and validates the configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.proxy.validate()?;

        Ok(config)
    }

    pub fn sentry_dsn(&self) -> Option<&str> {
        self.logging.as_ref()?.sentry_dsn.as_deref()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    ValidationError(#[from] ValidationError),
}
