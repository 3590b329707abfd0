//! Configuration sections consumed by the engine.
//!
//! Field names mirror the YAML document keys; durations accept
//! humantime strings such as `1s` or `250ms`.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::workload::{WorkloadLevel, WorkloadMode};

/// `Input` section: where payloads come from.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InputConf {
    /// Path to the binary payload file
    #[serde(rename = "PayloadFile")]
    pub payload_file: String,

    /// Path to the read-only string index used to resolve payload ids
    #[serde(rename = "StringsFile")]
    pub strings_file: String,

    /// Give every worker its own payload reader (needed when
    /// extractors feed per-worker values)
    #[serde(rename = "EnableRegexes")]
    pub enable_regexes: bool,

    /// How many passes over the payload file to make; 0 = unlimited
    #[serde(rename = "IterationLimit")]
    pub iteration_limit: i64,
}

/// `Output` section: result sinks.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutputConf {
    /// Line-delimited JSON results file
    #[serde(rename = "LDJSONFile")]
    pub ldjson_file: String,

    /// Request/response trace file
    #[serde(rename = "ReqRespFile")]
    pub req_resp_file: String,

    /// Minimum status recorded into the trace file
    /// (0 = everything, 400 = failures, 600 = transport errors only)
    #[serde(rename = "ReqRespFileLevel")]
    pub req_resp_file_level: u16,

    /// Compact fixed-width binary results file
    #[serde(rename = "BinaryFile")]
    pub binary_file: String,

    /// Writable string index shared by the sinks
    #[serde(rename = "StringsFile")]
    pub strings_file: String,
}

/// `Workers` section: workload shape.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkerConf {
    /// Open (target rate) or closed (target concurrency) model
    #[serde(rename = "Mode")]
    pub mode: WorkloadMode,

    /// Piecewise-linear levels describing the workload
    #[serde(rename = "WorkloadSchedule")]
    pub workload_schedule: Vec<WorkloadLevel>,

    /// Workers spawned before the first schedule offset
    #[serde(rename = "StartingWorkers")]
    pub starting_workers: usize,

    /// Hard cap on the worker pool
    #[serde(rename = "MaxWorkers")]
    pub max_workers: usize,

    /// Seed values for `${name}` substitution, copied per worker
    #[serde(rename = "Values")]
    pub values: HashMap<String, String>,
}

/// `Protocol` section: driver selection and connection knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtoConf {
    /// Protocol driver name: `http` or `dummy`
    #[serde(rename = "Driver")]
    pub driver: String,

    /// Idle connections kept per target address
    #[serde(rename = "MaxConnections")]
    pub max_connections: usize,

    /// Overall per-request deadline and dial timeout
    #[serde(rename = "Timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// TLS knobs for `https` targets
    #[serde(rename = "TLSConf")]
    pub tls: TlsConf,
}

impl Default for ProtoConf {
    fn default() -> Self {
        Self {
            driver: String::new(),
            max_connections: 1,
            timeout: Duration::from_secs(1),
            tls: TlsConf::default(),
        }
    }
}

/// TLS configuration for the HTTP driver.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConf {
    /// Skip server certificate verification
    #[serde(rename = "InsecureSkipVerify")]
    pub insecure_skip_verify: bool,

    /// Cipher suite allow-list, e.g. `TLS13_AES_128_GCM_SHA256`;
    /// empty means the provider defaults
    #[serde(rename = "TLSCipherSuites")]
    pub cipher_suites: Vec<String>,

    /// Minimum protocol version (`TLS12` or `TLS13`)
    #[serde(rename = "MinVersion")]
    pub min_version: String,

    /// Maximum protocol version (`TLS12` or `TLS13`)
    #[serde(rename = "MaxVersion")]
    pub max_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proto_defaults() {
        let conf = ProtoConf::default();
        assert_eq!(conf.max_connections, 1);
        assert_eq!(conf.timeout, Duration::from_secs(1));
        assert!(!conf.tls.insecure_skip_verify);
    }

    #[test]
    fn test_worker_conf_defaults() {
        let conf = WorkerConf::default();
        assert_eq!(conf.mode, WorkloadMode::Open);
        assert!(conf.workload_schedule.is_empty());
        assert_eq!(conf.max_workers, 0);
    }
}
