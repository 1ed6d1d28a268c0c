/// Configuration management for puente
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::health::check::HealthCheckConfig;
use crate::health::observer::ObserverConfig;
use crate::router::score::BalanceConfig;

/// Main puente configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backend fleet configuration
    pub backends: BackendsConfig,
    /// Health check configuration
    pub health: HealthConfig,
    /// Rebalance configuration
    pub balance: BalanceSection,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Static backend fleet used when no cluster registry is wired in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendsConfig {
    /// SQL addresses of the backends (`host:port`)
    pub addrs: Vec<String>,
    /// Port of the HTTP status endpoint shared by all backends
    pub status_port: u16,
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Probe round period in milliseconds
    pub check_interval_ms: u64,
    /// TCP dial plus greeting read budget in milliseconds
    pub dial_timeout_ms: u64,
    /// Additional status endpoint budget in milliseconds
    pub http_timeout_ms: u64,
    /// Concurrent probes per round
    pub parallelism: usize,
    /// Path of the status endpoint
    pub status_path: String,
    /// Optional schema-freshness endpoint
    pub schema_path: Option<String>,
}

/// Rebalance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSection {
    /// Rebalance tick period in milliseconds
    pub rebalance_interval_ms: u64,
    /// Redirects emitted per tick at most
    pub max_redirects_per_tick: usize,
    /// Busiest/idlest score ratio that triggers migration; must exceed 1.0
    pub max_score_ratio: f64,
    /// Cooldown before retrying a failed redirect, in milliseconds
    pub redirect_fail_cooldown_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backends: BackendsConfig {
                addrs: vec!["127.0.0.1:4000".to_string()],
                status_port: 10080,
            },
            health: HealthConfig {
                check_interval_ms: 3000,
                dial_timeout_ms: 3000,
                http_timeout_ms: 2000,
                parallelism: 16,
                status_path: "/status".to_string(),
                schema_path: None,
            },
            balance: BalanceSection {
                rebalance_interval_ms: 10,
                max_redirects_per_tick: 100,
                max_score_ratio: 1.2,
                redirect_fail_cooldown_ms: 3000,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backends.addrs.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one backend address is required".to_string(),
            ));
        }
        for addr in &self.backends.addrs {
            let port = addr.rsplit_once(':').map(|(_, port)| port);
            if port.map_or(true, |p| p.parse::<u16>().is_err()) {
                return Err(ConfigError::ValidationError(format!(
                    "invalid backend address: {addr}"
                )));
            }
        }

        if self.health.check_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "check_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.health.dial_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "dial_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.health.parallelism == 0 {
            return Err(ConfigError::ValidationError(
                "parallelism must be greater than 0".to_string(),
            ));
        }

        if self.balance.rebalance_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "rebalance_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.balance.max_redirects_per_tick == 0 {
            return Err(ConfigError::ValidationError(
                "max_redirects_per_tick must be greater than 0".to_string(),
            ));
        }
        if self.balance.max_score_ratio <= 1.0 {
            return Err(ConfigError::ValidationError(
                "max_score_ratio must be greater than 1.0".to_string(),
            ));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "invalid log level: {}",
                    self.logging.level
                )))
            }
        }
        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Write an example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let config = Config {
            backends: BackendsConfig {
                addrs: vec![
                    "10.0.1.10:4000".to_string(),
                    "10.0.1.11:4000".to_string(),
                    "10.0.1.12:4000".to_string(),
                ],
                status_port: 10080,
            },
            ..Default::default()
        };
        config.save_to_file(path)
    }
}

impl HealthConfig {
    /// Probe knobs for the health check ladder
    pub fn check_config(&self) -> HealthCheckConfig {
        HealthCheckConfig {
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
            http_timeout: Duration::from_millis(self.http_timeout_ms),
            status_path: self.status_path.clone(),
            schema_path: self.schema_path.clone(),
        }
    }

    /// Cadence knobs for the observer loop
    pub fn observer_config(&self) -> ObserverConfig {
        ObserverConfig {
            check_interval: Duration::from_millis(self.check_interval_ms),
            parallelism: self.parallelism,
        }
    }
}

impl BalanceSection {
    /// Runtime knobs for the router control loop
    pub fn balance_config(&self) -> BalanceConfig {
        BalanceConfig {
            rebalance_interval: Duration::from_millis(self.rebalance_interval_ms),
            max_redirects_per_tick: self.max_redirects_per_tick,
            max_score_ratio: self.max_score_ratio,
            redirect_fail_cooldown: Duration::from_millis(self.redirect_fail_cooldown_ms),
        }
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.backends.addrs = vec![];
        assert!(config.validate().is_err());
        config.backends.addrs = vec!["not-an-address".to_string()];
        assert!(config.validate().is_err());
        config.backends.addrs = vec!["10.0.0.1:4000".to_string()];
        assert!(config.validate().is_ok());

        config.balance.max_score_ratio = 1.0;
        assert!(config.validate().is_err());
        config.balance.max_score_ratio = 1.2;

        config.health.parallelism = 0;
        assert!(config.validate().is_err());
        config.health.parallelism = 16;

        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
        config.logging.level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.backends.addrs, config.backends.addrs);
    }

    #[test]
    fn test_config_file_operations() {
        let config = Config::default();
        let temp_file = NamedTempFile::new().unwrap();

        config.save_to_file(temp_file.path()).unwrap();
        let loaded = Config::load_from_file(temp_file.path()).unwrap();
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn test_example_config() {
        let temp_file = NamedTempFile::new().unwrap();
        Config::create_example_config(temp_file.path()).unwrap();
        let loaded = Config::load_from_file(temp_file.path()).unwrap();
        assert_eq!(loaded.backends.addrs.len(), 3);
    }

    #[test]
    fn test_runtime_conversions() {
        let config = Config::default();
        let check = config.health.check_config();
        assert_eq!(check.dial_timeout, Duration::from_millis(3000));
        let observer = config.health.observer_config();
        assert_eq!(observer.parallelism, 16);
        let balance = config.balance.balance_config();
        assert_eq!(balance.max_redirects_per_tick, 100);
        assert_eq!(balance.rebalance_interval, Duration::from_millis(10));
    }
}
