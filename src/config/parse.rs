use super::types::*;
use super::{expand_env_vars, expand_tilde, unexpanded_env_vars};
use crate::query::{resolve, ReportQuery};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config(&yaml).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })
}

/// Expand, parse and validate a YAML config document.
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let yaml = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml)?;

    let mut config: Config = serde_yaml::from_str(&yaml)?;
    config.storage.path = expand_tilde(&config.storage.path);

    validate_config(&config)?;
    Ok(config)
}

fn check_unexpanded_vars(yaml: &str) -> Result<(), ConfigError> {
    let names = unexpanded_env_vars(yaml);
    match names.as_slice() {
        [] => Ok(()),
        [name] => Err(ConfigError::Validation(format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=...\n\
             2. Replace $env{{{0}}} in the config file with an actual value",
            name
        ))),
        _ => Err(ConfigError::Validation(format!(
            "Environment variables are not set: {}",
            names.join(", ")
        ))),
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.storage.path.as_os_str().is_empty() {
        errors.push("storage.path cannot be empty".to_string());
    }
    if config.web.listen.parse::<std::net::SocketAddr>().is_err() {
        errors.push(format!(
            "web.listen '{}' is not a valid socket address",
            config.web.listen
        ));
    }

    validate_reports(&config.reports, &mut errors);
    if let Some(prometheus) = &config.prometheus {
        validate_prometheus(prometheus, &mut errors);
    }
    validate_datasources(config, &mut errors);
    validate_queries(&config.queries, &mut errors);
    validate_scheduled_reports(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_reports(reports: &ReportsConfig, errors: &mut Vec<String>) {
    for (field, value) in [
        ("readiness_timeout", reports.readiness_timeout),
        ("poll_interval", reports.poll_interval),
        ("schedule_check_interval", reports.schedule_check_interval),
    ] {
        if value.is_zero() {
            errors.push(format!("reports.{} must be greater than zero", field));
        }
    }
}

fn validate_prometheus(prometheus: &PrometheusConfig, errors: &mut Vec<String>) {
    if !prometheus.url.starts_with("http://") && !prometheus.url.starts_with("https://") {
        errors.push(format!(
            "prometheus.url '{}' must start with http:// or https://",
            prometheus.url
        ));
    }
    for (field, value) in [
        ("step", prometheus.step),
        ("chunk_size", prometheus.chunk_size),
        ("poll_interval", prometheus.poll_interval),
        ("timeout", prometheus.timeout),
    ] {
        if value.is_zero() {
            errors.push(format!("prometheus.{} must be greater than zero", field));
        }
    }
    if prometheus.chunk_size < prometheus.step {
        errors.push("prometheus.chunk_size must be at least one step".to_string());
    }
    if prometheus.max_retries == 0 {
        errors.push("prometheus.max_retries must be at least 1".to_string());
    }
}

fn validate_datasources(config: &Config, errors: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for definition in &config.datasources {
        if definition.name.is_empty() {
            errors.push("data source name cannot be empty".to_string());
            continue;
        }
        if !seen.insert(definition.name.as_str()) {
            errors.push(format!("duplicate data source '{}'", definition.name));
        }
        if let Some(source) = &definition.prometheus {
            if source.query.trim().is_empty() {
                errors.push(format!(
                    "data source '{}': prometheus.query cannot be empty",
                    definition.name
                ));
            }
            if config.prometheus.is_none() {
                errors.push(format!(
                    "data source '{}' has a prometheus query but no prometheus section is configured",
                    definition.name
                ));
            }
        }
    }
}

fn validate_queries(queries: &[ReportQuery], errors: &mut Vec<String>) {
    let mut by_name: BTreeMap<String, ReportQuery> = BTreeMap::new();
    for query in queries {
        if let Err(e) = query.validate() {
            errors.push(e.to_string());
            continue;
        }
        if by_name.insert(query.name.clone(), query.clone()).is_some() {
            errors.push(format!("duplicate report query '{}'", query.name));
        }
    }

    // Data sources may be registered at import time, so only query references
    // are checked here.
    let mut reported = HashSet::new();
    for name in by_name.keys() {
        if let Err(e) = resolve(&by_name, |_| true, name) {
            let message = e.to_string();
            if reported.insert(message.clone()) {
                errors.push(message);
            }
        }
    }
}

fn validate_scheduled_reports(config: &Config, errors: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for schedule in &config.scheduled_reports {
        if schedule.name.is_empty() {
            errors.push("scheduled report name cannot be empty".to_string());
            continue;
        }
        if !seen.insert(schedule.name.as_str()) {
            errors.push(format!("duplicate scheduled report '{}'", schedule.name));
        }
        if schedule.period.is_zero() {
            errors.push(format!(
                "scheduled report '{}': period must be greater than zero",
                schedule.name
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const BASE: &str = r#"
storage:
  path: /tmp/metering.duckdb
web:
  listen: 127.0.0.1:8080
"#;

    fn with_base(extra: &str) -> String {
        format!("{}{}", BASE, extra)
    }

    fn validation_errors(yaml: &str) -> Vec<String> {
        match parse_config(yaml) {
            Err(ConfigError::ValidationList(errors)) => errors,
            other => panic!("expected validation errors, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_full_config() {
        let config = parse_config(&with_base(
            r#"
reports:
  readiness_timeout: 10m
prometheus:
  url: http://prometheus:9090
  step: 1m
datasources:
  - name: pod-request-cpu-cores
    prometheus:
      query: sum(kube_pod_container_resource_requests{resource="cpu"}) by (pod, namespace, node)
queries:
  - name: pod-cpu-request
    data_sources: [pod-request-cpu-cores]
    query: SELECT 1 FROM {{ datasource "pod-request-cpu-cores" }}
scheduled_reports:
  - name: hourly
    query: pod-cpu-request
    period: 1h
    start: 2024-01-01T00:00:00Z
"#,
        ))
        .unwrap();

        assert_eq!(config.reports.readiness_timeout, Duration::from_secs(600));
        assert_eq!(config.datasources.len(), 1);
        assert_eq!(config.queries[0].name, "pod-cpu-request");
        assert_eq!(config.scheduled_reports[0].period, Duration::from_secs(3600));
    }

    #[test]
    fn test_env_vars_expanded_before_parse() {
        std::env::set_var("METERING_PARSE_LISTEN", "0.0.0.0:9000");
        let config = parse_config(
            "storage:\n  path: /tmp/db\nweb:\n  listen: $env{METERING_PARSE_LISTEN}\n",
        )
        .unwrap();
        assert_eq!(config.web.listen, "0.0.0.0:9000");
        std::env::remove_var("METERING_PARSE_LISTEN");
    }

    #[test]
    fn test_unset_env_var_is_named() {
        let err = parse_config(
            "storage:\n  path: $env{METERING_PARSE_UNSET}\nweb:\n  listen: 127.0.0.1:1\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref msg) if msg.contains("METERING_PARSE_UNSET")));
    }

    #[test]
    fn test_query_cycle_rejected() {
        let errors = validation_errors(&with_base(
            r#"
queries:
  - name: a
    report_queries: [b]
    query: SELECT * FROM {{ query "b" }}
  - name: b
    report_queries: [a]
    query: SELECT * FROM {{ query "a" }}
"#,
        ));
        assert_eq!(errors.len(), 2, "{:?}", errors);
        assert!(errors.iter().all(|e| e.contains("circular")));
    }

    #[test]
    fn test_query_errors_collected() {
        let errors = validation_errors(&with_base(
            r#"
queries:
  - name: undeclared
    query: SELECT * FROM {{ datasource "x" }}
  - name: missing-dep
    report_queries: [nowhere]
    query: SELECT * FROM {{ query "nowhere" }}
  - name: dup
    query: SELECT 1
  - name: dup
    query: SELECT 2
"#,
        ));
        assert_eq!(errors.len(), 3, "{:?}", errors);
        assert!(errors.iter().any(|e| e.contains("duplicate report query 'dup'")));
        assert!(errors.iter().any(|e| e.contains("nowhere")));
    }

    #[test]
    fn test_invalid_settings_collected() {
        let errors = validation_errors(
            r#"
storage:
  path: /tmp/db
web:
  listen: not-an-address
reports:
  poll_interval: 0s
prometheus:
  url: prometheus:9090
  step: 5m
  chunk_size: 1m
datasources:
  - name: a
  - name: a
scheduled_reports:
  - name: s
    query: q
    period: 0s
    start: 2024-01-01T00:00:00Z
"#,
        );
        assert!(errors.iter().any(|e| e.contains("web.listen")));
        assert!(errors.iter().any(|e| e.contains("reports.poll_interval")));
        assert!(errors.iter().any(|e| e.contains("prometheus.url")));
        assert!(errors.iter().any(|e| e.contains("chunk_size")));
        assert!(errors.iter().any(|e| e.contains("duplicate data source 'a'")));
        assert!(errors.iter().any(|e| e.contains("period")));
    }

    #[test]
    fn test_prometheus_datasource_requires_prometheus_section() {
        let errors = validation_errors(&with_base(
            r#"
datasources:
  - name: a
    prometheus:
      query: up
"#,
        ));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("no prometheus section"));
    }
}
