//! YAML configuration document and its validating loader.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use volley_core::{InputConf, OutputConf, ProtoConf, WorkerConf};

/// Configuration loading errors. All of them abort the run.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File not found
    #[error("config file not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Validation error
    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Payload source
    #[serde(rename = "Input")]
    pub input: InputConf,

    /// Result sinks
    #[serde(rename = "Output")]
    pub output: OutputConf,

    /// Workload shape
    #[serde(rename = "Workers")]
    pub workers: WorkerConf,

    /// Protocol driver selection and knobs
    #[serde(rename = "Protocol")]
    pub protocol: ProtoConf,
}

impl Configuration {
    /// Load and validate a configuration file.
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        tracing::info!("Loading config file: {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::load_str(&content)
    }

    /// Load and validate a configuration document from a string.
    pub fn load_str(content: &str) -> Result<Self, ConfigError> {
        let config: Configuration = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.protocol.driver.as_str() {
            "http" | "dummy" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "unsupported protocol driver: {other:?}"
                )));
            }
        }

        if self.workers.workload_schedule.is_empty() {
            return Err(ConfigError::Validation(
                "Workers.WorkloadSchedule must not be empty".into(),
            ));
        }

        for (i, level) in self.workers.workload_schedule.iter().enumerate() {
            if level.level_start < 0.0 || level.level_end < 0.0 {
                return Err(ConfigError::Validation(format!(
                    "WorkloadSchedule[{i}] has a negative level"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use volley_core::WorkloadMode;

    const SAMPLE: &str = r#"
Input:
  PayloadFile: payload.bin
  StringsFile: strings-in.txt
  EnableRegexes: true
  IterationLimit: 3

Output:
  LDJSONFile: results.ldjson
  BinaryFile: results.bin
  ReqRespFile: trace.txt
  ReqRespFileLevel: 400
  StringsFile: strings-out.txt

Workers:
  Mode: open
  WorkloadSchedule:
    - { LevelStart: 0, LevelEnd: 10, Duration: 5s }
    - { LevelStart: 10, LevelEnd: 10, Duration: 30s }
  StartingWorkers: 2
  MaxWorkers: 100
  Values:
    token: abc123

Protocol:
  Driver: http
  MaxConnections: 16
  Timeout: 2500ms
  TLSConf:
    InsecureSkipVerify: true
    MinVersion: TLS12
    MaxVersion: TLS13
"#;

    #[test]
    fn test_parse_full_document() {
        let config = Configuration::load_str(SAMPLE).unwrap();

        assert_eq!(config.input.payload_file, "payload.bin");
        assert!(config.input.enable_regexes);
        assert_eq!(config.input.iteration_limit, 3);

        assert_eq!(config.output.req_resp_file_level, 400);

        assert_eq!(config.workers.mode, WorkloadMode::Open);
        assert_eq!(config.workers.workload_schedule.len(), 2);
        assert_eq!(config.workers.workload_schedule[0].level_end, 10.0);
        assert_eq!(
            config.workers.workload_schedule[1].duration,
            Duration::from_secs(30)
        );
        assert_eq!(config.workers.values["token"], "abc123");

        assert_eq!(config.protocol.max_connections, 16);
        assert_eq!(config.protocol.timeout, Duration::from_millis(2500));
        assert!(config.protocol.tls.insecure_skip_verify);
        assert_eq!(config.protocol.tls.min_version, "TLS12");
    }

    #[test]
    fn test_protocol_defaults_apply() {
        let config = Configuration::load_str(
            r#"
Workers:
  Mode: closed
  WorkloadSchedule:
    - { LevelStart: 0, LevelEnd: 5, Duration: 10s }
Protocol:
  Driver: dummy
"#,
        )
        .unwrap();

        assert_eq!(config.workers.mode, WorkloadMode::Closed);
        assert_eq!(config.protocol.max_connections, 1);
        assert_eq!(config.protocol.timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_unknown_driver_rejected() {
        let result = Configuration::load_str(
            r#"
Workers:
  WorkloadSchedule:
    - { LevelStart: 0, LevelEnd: 1, Duration: 1s }
Protocol:
  Driver: gopher
"#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_empty_schedule_rejected() {
        let result = Configuration::load_str("Protocol:\n  Driver: dummy\n");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_load_file_missing_path() {
        let result = Configuration::load_file("/definitely/not/here.yaml");
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volley.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = Configuration::load_file(&path).unwrap();
        assert_eq!(config.protocol.driver, "http");
    }
}
