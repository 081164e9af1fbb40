use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::logging::parse_log_level;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub signaling: SignalingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Signaling socket limits and the ICE servers handed to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Maximum inbound WebSocket frame size in bytes
    pub max_message_size: usize,
    /// Per-connection outbound queue depth; frames beyond it are dropped
    pub outbound_buffer: usize,
    /// STUN/TURN URLs offered to clients
    pub ice_servers: Vec<String>,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024,
            outbound_buffer: 1000,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    ///
    /// Priority (highest first):
    /// 1. Environment variables (`DUET_SERVER__PORT`, `DUET_LOGGING__LEVEL`, ...)
    /// 2. Config file (if provided and present)
    /// 3. Built-in defaults
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::from(Path::new(path)));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("DUET")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("signaling.ice_servers")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Listen address in `host:port` form
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Check the configuration, collecting every problem instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.host.trim().is_empty() {
            errors.push("server.host must not be empty".to_string());
        }
        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if let Err(e) = parse_log_level(&self.logging.level) {
            errors.push(format!("logging.level: {e}"));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }
        if self.signaling.max_message_size == 0 {
            errors.push("signaling.max_message_size must be non-zero".to_string());
        }
        if self.signaling.outbound_buffer == 0 {
            errors.push("signaling.outbound_buffer must be non-zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.http_address(), "0.0.0.0:5000");
        assert_eq!(config.signaling.max_message_size, 64 * 1024);
        assert_eq!(
            config.signaling.ice_servers,
            vec!["stun:stun.l.google.com:19302".to_string()]
        );
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.server.port = 0;
        config.logging.format = "xml".to_string();
        config.signaling.outbound_buffer = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("server.port")));
        assert!(errors.iter().any(|e| e.contains("logging.format")));
        assert!(errors.iter().any(|e| e.contains("outbound_buffer")));
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "server:\n  port: 7000\nlogging:\n  format: json\nsignaling:\n  ice_servers:\n    - stun:stun.example.com:3478\n"
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = Config::from_file(&path).unwrap();

        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.logging.format, "json");
        assert_eq!(
            config.signaling.ice_servers,
            vec!["stun:stun.example.com:3478".to_string()]
        );
        assert_eq!(config.signaling.outbound_buffer, 1000);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::from_file("/nonexistent/duet.yaml").unwrap();
        assert_eq!(config.server.port, 5000);
    }
}
