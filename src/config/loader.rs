//! Configuration file loading.

use crate::config::{validate_config, Config};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Load configuration from a YAML file.
///
/// Reads the file, parses the YAML and validates the result.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    validate_config(&config).map_err(ConfigError::ValidationError)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthCheckType, StrategyConfig};
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_minimal_config() {
        let yaml = r#"
discovery:
  endpoints:
    - "127.0.0.1:9000"
    - "[::1]:9001"
"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.discovery.endpoints.len(), 2);
        assert_eq!(config.discovery.endpoints[1].host(), "::1");
        assert_eq!(config.health_check.check_type, HealthCheckType::Tcp);
        assert_eq!(config.health_check.strategy, StrategyConfig::All);
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_config("/nonexistent/path/config.yaml");
        assert!(matches!(result.unwrap_err(), ConfigError::ReadError(_)));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"not: valid: yaml: {{{}}}").unwrap();

        let result = load_config(file.path());
        assert!(matches!(result.unwrap_err(), ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_invalid_endpoint() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"discovery:\n  endpoints: [\"host:notaport\"]\n")
            .unwrap();

        let result = load_config(file.path());
        assert!(matches!(result.unwrap_err(), ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_fails_validation() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"discovery: {}\n").unwrap();

        let result = load_config(file.path());
        assert!(matches!(result.unwrap_err(), ConfigError::ValidationError(_)));
    }
}
