//! Configuration data types.

use crate::backoff::{self, Backoff};
use crate::discovery::{DiscoveryError, DynamicEndpointGroup, EndpointGroup, FileEndpointGroup};
use crate::endpoint::{Endpoint, SessionProtocol};
use crate::health::{HealthCheckedEndpointGroupBuilder, Probe, ProbeCheckerFactory};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Health check settings
    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// Where candidate endpoints come from
    pub discovery: DiscoveryConfig,
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Group name used in logs and metric labels
    #[serde(default = "default_group_name")]
    pub name: String,

    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// How often the health snapshot is logged
    #[serde(default = "default_report_interval", with = "humantime_serde")]
    pub report_interval: Duration,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            name: default_group_name(),
            log_level: default_log_level(),
            log_format: LogFormat::Json,
            report_interval: default_report_interval(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    /// Type of health check: tcp or http
    #[serde(default, rename = "type")]
    pub check_type: HealthCheckType,

    /// Protocol used to derive the default check port
    #[serde(default)]
    pub protocol: SessionProtocol,

    /// Probe this port instead of each endpoint's own port
    #[serde(default)]
    pub port: Option<u16>,

    /// HTTP path to check (for HTTP health checks)
    #[serde(default)]
    pub path: Option<String>,

    /// Expected HTTP status code (for HTTP health checks)
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,

    /// Timeout for a single probe
    #[serde(default = "default_health_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Delay between probes of the same endpoint
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,

    /// Random jitter applied to the retry interval, as a fraction
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Which candidates are checked
    #[serde(default)]
    pub strategy: StrategyConfig,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_type: HealthCheckType::Tcp,
            protocol: SessionProtocol::default(),
            port: None,
            path: None,
            expected_status: default_expected_status(),
            timeout: default_health_timeout(),
            retry_interval: default_retry_interval(),
            jitter: default_jitter(),
            strategy: StrategyConfig::default(),
        }
    }
}

impl HealthCheckConfig {
    /// The probe described by this configuration.
    pub fn probe(&self) -> Probe {
        match self.check_type {
            HealthCheckType::Tcp => Probe::Tcp,
            HealthCheckType::Http => Probe::Http {
                path: self.path.clone().unwrap_or_else(|| "/".to_string()),
                expected_status: self.expected_status,
            },
        }
    }

    /// Fixed retry interval with the configured jitter.
    pub fn backoff(&self) -> Arc<dyn Backoff> {
        let millis = i64::try_from(self.retry_interval.as_millis()).unwrap_or(i64::MAX);
        let fixed = <dyn Backoff>::fixed(millis);
        backoff::with_jitter(fixed, self.jitter)
    }

    /// Checker factory running the configured probe.
    pub fn checker_factory(&self) -> ProbeCheckerFactory {
        ProbeCheckerFactory::new(self.probe(), self.timeout)
    }

    /// Apply protocol, port, backoff and strategy to a group builder.
    pub fn configure(
        &self,
        builder: HealthCheckedEndpointGroupBuilder,
    ) -> HealthCheckedEndpointGroupBuilder {
        let mut builder = builder
            .protocol(self.protocol)
            .retry_backoff(self.backoff());
        if let Some(port) = self.port {
            builder = builder.port(port);
        }
        if let StrategyConfig::Partial {
            max_endpoint_count,
            max_endpoint_ratio,
        } = &self.strategy
        {
            if let Some(count) = max_endpoint_count {
                builder = builder.max_endpoint_count(*count);
            }
            if let Some(ratio) = max_endpoint_ratio {
                builder = builder.max_endpoint_ratio(*ratio);
            }
        }
        builder
    }
}

/// Type of health check.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckType {
    #[default]
    Tcp,
    Http,
}

/// Health check strategy.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyConfig {
    /// Check every candidate.
    #[default]
    All,
    /// Check a bounded subset of the candidates.
    Partial {
        #[serde(default)]
        max_endpoint_count: Option<usize>,
        #[serde(default)]
        max_endpoint_ratio: Option<f64>,
    },
}

/// Discovery configuration: a static list or a watched file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    /// Static candidate endpoints
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,

    /// YAML file with an `endpoints` list, reloaded on change
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl DiscoveryConfig {
    /// Start the configured discovery source.
    pub fn start(&self, runtime: &Handle) -> Result<Arc<dyn EndpointGroup>, DiscoveryError> {
        match &self.file {
            Some(path) => Ok(Arc::new(FileEndpointGroup::start(path, runtime)?)),
            None => Ok(Arc::new(DynamicEndpointGroup::with_endpoints(
                self.endpoints.clone(),
            ))),
        }
    }
}

// Default value functions
fn default_group_name() -> String {
    "default".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_report_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_retry_interval() -> Duration {
    backoff::DEFAULT_RETRY_INTERVAL
}

fn default_jitter() -> f64 {
    backoff::DEFAULT_JITTER_RATE
}

fn default_expected_status() -> u16 {
    200
}

/// Custom serde module for humantime durations.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_health_check() {
        let config = HealthCheckConfig::default();
        assert_eq!(config.check_type, HealthCheckType::Tcp);
        assert_eq!(config.retry_interval, Duration::from_secs(3));
        assert_eq!(config.jitter, 0.2);
        assert_eq!(config.strategy, StrategyConfig::All);
        assert_eq!(config.probe(), Probe::Tcp);
    }

    #[test]
    fn test_strategy_serde() {
        let strategy: StrategyConfig = serde_yaml::from_str("type: all").unwrap();
        assert_eq!(strategy, StrategyConfig::All);

        let strategy: StrategyConfig =
            serde_yaml::from_str("type: partial\nmax_endpoint_ratio: 0.5").unwrap();
        assert_eq!(
            strategy,
            StrategyConfig::Partial {
                max_endpoint_count: None,
                max_endpoint_ratio: Some(0.5)
            }
        );
    }

    #[test]
    fn test_health_check_serde() {
        let yaml = r#"
type: http
protocol: https
path: /internal/l7check
expected_status: 204
timeout: 2s
retry_interval: 500ms
jitter: 0
"#;
        let config: HealthCheckConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.protocol, SessionProtocol::Https);
        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(config.retry_interval, Duration::from_millis(500));
        assert_eq!(
            config.probe(),
            Probe::Http {
                path: "/internal/l7check".to_string(),
                expected_status: 204
            }
        );
        // No jitter: every delay is the interval
        assert_eq!(config.backoff().next_delay_millis(1), 500);
    }
}
