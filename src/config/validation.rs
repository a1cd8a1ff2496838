//! Configuration validation.

use crate::config::{Config, HealthCheckType, StrategyConfig};
use crate::health::EndpointLimit;
use std::collections::HashSet;

/// Validate the configuration.
///
/// Checks for:
/// - Exactly one discovery source, without duplicate endpoints
/// - HTTP health checks have an absolute path
/// - Non-zero port, timeout and retry interval, jitter within `0..=1`
/// - A partial strategy has exactly one valid limit
/// - A known log level
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing every problem.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    // Discovery
    let discovery = &config.discovery;
    match (discovery.endpoints.is_empty(), &discovery.file) {
        (true, None) => errors.push("discovery must define endpoints or a file".to_string()),
        (false, Some(_)) => {
            errors.push("discovery endpoints and file are mutually exclusive".to_string())
        }
        _ => {}
    }

    let mut seen = HashSet::new();
    for endpoint in &discovery.endpoints {
        if !seen.insert(endpoint) {
            errors.push(format!("duplicate endpoint: {}", endpoint));
        }
    }

    // Health check
    let hc = &config.health_check;
    if hc.check_type == HealthCheckType::Http {
        match hc.path.as_deref() {
            None => errors.push("HTTP health check but no path specified".to_string()),
            Some(path) if !path.starts_with('/') => {
                errors.push(format!("health check path '{}' must start with '/'", path))
            }
            Some(_) => {}
        }
    }

    if hc.port == Some(0) {
        errors.push("health check port must be between 1 and 65535".to_string());
    }

    if hc.timeout.is_zero() {
        errors.push("health check timeout must be greater than 0".to_string());
    }

    if hc.retry_interval.is_zero() {
        errors.push("health check retry_interval must be greater than 0".to_string());
    }

    if !(0.0..=1.0).contains(&hc.jitter) {
        errors.push(format!(
            "health check jitter must be between 0 and 1, got {}",
            hc.jitter
        ));
    }

    if let StrategyConfig::Partial {
        max_endpoint_count,
        max_endpoint_ratio,
    } = &hc.strategy
    {
        match (max_endpoint_count, max_endpoint_ratio) {
            (Some(_), Some(_)) => errors.push(
                "partial strategy takes max_endpoint_count or max_endpoint_ratio, not both"
                    .to_string(),
            ),
            (None, None) => errors.push(
                "partial strategy requires max_endpoint_count or max_endpoint_ratio".to_string(),
            ),
            (Some(count), None) => {
                if let Err(e) = EndpointLimit::count(*count) {
                    errors.push(e.to_string());
                }
            }
            (None, Some(ratio)) => {
                if let Err(e) = EndpointLimit::ratio(*ratio) {
                    errors.push(e.to_string());
                }
            }
        }
    }

    // Validate log level
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if config.global.name.is_empty() {
        errors.push("group name cannot be empty".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;
    use crate::endpoint::Endpoint;
    use std::path::PathBuf;
    use std::time::Duration;

    fn minimal_config() -> Config {
        Config {
            global: GlobalConfig::default(),
            health_check: HealthCheckConfig::default(),
            discovery: DiscoveryConfig {
                endpoints: vec![Endpoint::of("127.0.0.1", 9000)],
                file: None,
            },
        }
    }

    #[test]
    fn test_valid_config() {
        let config = minimal_config();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_no_discovery_source() {
        let mut config = minimal_config();
        config.discovery.endpoints.clear();
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("endpoints or a file"));
    }

    #[test]
    fn test_both_discovery_sources() {
        let mut config = minimal_config();
        config.discovery.file = Some(PathBuf::from("/etc/endpoints.yaml"));
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("mutually exclusive"));
    }

    #[test]
    fn test_duplicate_endpoints() {
        let mut config = minimal_config();
        config.discovery.endpoints.push(Endpoint::of("127.0.0.1", 9000));
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("duplicate endpoint"));
    }

    #[test]
    fn test_http_health_check_missing_path() {
        let mut config = minimal_config();
        config.health_check.check_type = HealthCheckType::Http;
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("no path specified"));

        config.health_check.path = Some("health".to_string());
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("must start with '/'"));
    }

    #[test]
    fn test_zero_durations_and_bad_jitter() {
        let mut config = minimal_config();
        config.health_check.timeout = Duration::ZERO;
        config.health_check.retry_interval = Duration::ZERO;
        config.health_check.jitter = 1.5;
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("timeout"));
        assert!(err.contains("retry_interval"));
        assert!(err.contains("jitter"));
    }

    #[test]
    fn test_partial_strategy_limits() {
        let mut config = minimal_config();
        config.health_check.strategy = StrategyConfig::Partial {
            max_endpoint_count: None,
            max_endpoint_ratio: None,
        };
        assert!(validate_config(&config).unwrap_err().contains("requires"));

        config.health_check.strategy = StrategyConfig::Partial {
            max_endpoint_count: Some(1),
            max_endpoint_ratio: Some(0.5),
        };
        assert!(validate_config(&config).unwrap_err().contains("not both"));

        config.health_check.strategy = StrategyConfig::Partial {
            max_endpoint_count: None,
            max_endpoint_ratio: Some(0.0),
        };
        assert!(validate_config(&config).unwrap_err().contains("ratio"));

        config.health_check.strategy = StrategyConfig::Partial {
            max_endpoint_count: Some(2),
            max_endpoint_ratio: None,
        };
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_errors_are_collected() {
        let mut config = minimal_config();
        config.global.log_level = "loud".to_string();
        config.health_check.port = Some(0);
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("invalid log level"));
        assert!(err.contains("port"));
        assert!(err.contains("; "));
    }
}
