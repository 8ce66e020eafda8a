//! Configuration loading from disk and environment.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::AppConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value {value:?} for environment variable {var}")]
    Env { var: &'static str, value: String },

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse configuration from TOML text without validating it.
pub fn parse_config(content: &str) -> Result<AppConfig, ConfigError> {
    Ok(toml::from_str(content)?)
}

/// Load configuration: TOML file (if any), then environment overrides,
/// then validation.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut config = match path {
        Some(path) => parse_config(&fs::read_to_string(path)?)?,
        None => AppConfig::default(),
    };
    apply_env_overrides(&mut config, |var| std::env::var(var).ok())?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Apply `SERVICE_NAME`, `LISTEN_PORT`, `OTEL_AGENT_HOST`, `OTEL_AGENT_PORT`
/// and `LOG_LEVEL` from `lookup`.
pub fn apply_env_overrides(
    config: &mut AppConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(name) = lookup("SERVICE_NAME") {
        config.service.name = name;
    }
    if let Some(port) = lookup("LISTEN_PORT") {
        let port = parse_port("LISTEN_PORT", port)?;
        let mut addr: SocketAddr = config
            .listener
            .bind_address
            .parse()
            .map_err(|_| ConfigError::Env {
                var: "LISTEN_PORT",
                value: config.listener.bind_address.clone(),
            })?;
        addr.set_port(port);
        config.listener.bind_address = addr.to_string();
    }
    if let Some(host) = lookup("OTEL_AGENT_HOST") {
        config.tracing.agent_host = host;
    }
    if let Some(port) = lookup("OTEL_AGENT_PORT") {
        config.tracing.agent_port = parse_port("OTEL_AGENT_PORT", port)?;
    }
    if let Some(level) = lookup("LOG_LEVEL") {
        config.observability.log_level = level;
    }
    Ok(())
}

fn parse_port(var: &'static str, value: String) -> Result<u16, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env { var, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ExporterKind;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = parse_config(
            r#"
            [service]
            name = "greeter"

            [tracing]
            exporter = "log"
            max_batch_size = 64
            "#,
        )
        .unwrap();
        assert_eq!(config.service.name, "greeter");
        assert_eq!(config.tracing.exporter, ExporterKind::Log);
        assert_eq!(config.tracing.max_batch_size, 64);
        assert_eq!(config.tracing.agent_port, 6831);
        assert_eq!(config.listener.bind_address, "0.0.0.0:8000");
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        assert!(matches!(
            parse_config("[tracing]\nagent_port = \"x\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("SERVICE_NAME", "svc"),
            ("LISTEN_PORT", "9000"),
            ("OTEL_AGENT_HOST", "collector"),
            ("OTEL_AGENT_PORT", "6832"),
            ("LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();
        let mut config = AppConfig::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.service.name, "svc");
        assert_eq!(config.listener.bind_address, "0.0.0.0:9000");
        assert_eq!(config.tracing.agent_host, "collector");
        assert_eq!(config.tracing.agent_port, 6832);
        assert_eq!(config.observability.log_level, "debug");
    }

    #[test]
    fn bad_port_in_environment_is_rejected() {
        let mut config = AppConfig::default();
        let err = apply_env_overrides(&mut config, |k| {
            (k == "OTEL_AGENT_PORT").then(|| "70000".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "OTEL_AGENT_PORT", .. }));
    }

    #[test]
    fn validation_errors_are_joined() {
        let err = ConfigError::Validation(vec![
            ValidationError { field: "a", message: "x".into() },
            ValidationError { field: "b", message: "y".into() },
        ]);
        assert_eq!(err.to_string(), "Validation failed: a: x, b: y");
    }
}
