//! Payload and result items flowing through the engine.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Serialize, Serializer};

use crate::strindex::{IndexError, StringIndex};
use crate::values::{AssertRegex, ExtractRegex};

/// Status recorded when the exchange failed below the protocol level.
pub const TRANSPORT_ERROR_STATUS: u16 = 999;

/// One unit of input work: a raw wire-level request plus the
/// substitution, extraction and assertion attached to it.
///
/// String fields are either materialised or carry an index into the
/// string index; resolution is lazy via [`PayloadItem::resolve`].
#[derive(Debug, Clone, Default)]
pub struct PayloadItem {
    /// Result label, possibly empty until resolved
    pub label: String,
    /// String-index id of the label (0 = none)
    pub label_idx: u16,
    /// Target address, possibly empty until resolved
    pub address: String,
    /// String-index id of the address (0 = none)
    pub address_idx: u16,
    /// Raw request bytes sent on the wire
    pub payload: Vec<u8>,
    /// Variable names substituted into the payload before sending
    pub replaces: Vec<String>,
    /// Extractors applied to the response recording
    pub extractors: HashMap<String, ExtractRegex>,
    /// Assertions applied to the response recording
    pub asserts: Vec<AssertRegex>,
}

impl PayloadItem {
    /// Materialise label and address from their index ids.
    pub fn resolve(&mut self, index: &StringIndex) -> Result<(), IndexError> {
        if self.label.is_empty() && self.label_idx != 0 {
            self.label = index.get(self.label_idx)?;
        }
        if self.address.is_empty() && self.address_idx != 0 {
            self.address = index.get(self.address_idx)?;
        }
        Ok(())
    }
}

fn ser_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// One result record. The serialized form is the LDJSON line: raw
/// bytes and index ids are omitted, durations become float seconds.
#[derive(Debug, Clone, Serialize)]
pub struct OutputItem {
    /// Monotonic start of the exchange (drift measurement)
    #[serde(skip)]
    pub start: Instant,

    /// Wall-clock start of the exchange
    #[serde(skip)]
    pub start_wall: SystemTime,

    /// Start time as epoch seconds
    #[serde(rename = "StartTS")]
    pub start_ts: u64,

    /// HTTP status, or 999 for a transport error
    #[serde(rename = "Status")]
    pub status: u16,

    /// Error message; set exactly when status is 999, or by assertions
    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Interned id of the error message (binary sink)
    #[serde(skip)]
    pub error_idx: u16,

    /// Index of the worker that produced the result
    #[serde(rename = "Worker")]
    pub worker: u32,

    /// Busy-worker count observed at finish
    #[serde(rename = "Concurrency")]
    pub concurrency: u32,

    /// Total wall time of the exchange
    #[serde(rename = "Elapsed", serialize_with = "ser_secs")]
    pub elapsed: Duration,

    /// Time to acquire the connection
    #[serde(rename = "Connect", serialize_with = "ser_secs")]
    pub connect_time: Duration,

    /// Time to write the request
    #[serde(rename = "Sent", serialize_with = "ser_secs")]
    pub sent_time: Duration,

    /// Delay until the first response byte
    #[serde(rename = "FirstByte", serialize_with = "ser_secs")]
    pub first_byte_time: Duration,

    /// Time spent reading the response
    #[serde(rename = "Read", serialize_with = "ser_secs")]
    pub read_time: Duration,

    /// Bytes written to the wire
    #[serde(rename = "SentBytes")]
    pub sent_bytes: u64,

    /// Bytes read from the wire
    #[serde(rename = "RecvBytes")]
    pub recv_bytes: u64,

    /// Result label
    #[serde(rename = "Label")]
    pub label: String,

    /// Interned id of the label (binary sink)
    #[serde(skip)]
    pub label_idx: u16,

    /// Request bytes as sent (trace sink only)
    #[serde(skip)]
    pub req_bytes: Vec<u8>,

    /// Response bytes up to the recording cap (trace sink only)
    #[serde(skip)]
    pub resp_bytes: Vec<u8>,
}

impl Default for OutputItem {
    fn default() -> Self {
        Self::started()
    }
}

impl OutputItem {
    /// New item stamped with the current instant and wall clock.
    pub fn started() -> Self {
        let start_wall = SystemTime::now();
        Self {
            start: Instant::now(),
            start_wall,
            start_ts: epoch_secs(start_wall),
            status: 0,
            error: None,
            error_idx: 0,
            worker: 0,
            concurrency: 0,
            elapsed: Duration::ZERO,
            connect_time: Duration::ZERO,
            sent_time: Duration::ZERO,
            first_byte_time: Duration::ZERO,
            read_time: Duration::ZERO,
            sent_bytes: 0,
            recv_bytes: 0,
            label: String::new(),
            label_idx: 0,
            req_bytes: Vec::new(),
            resp_bytes: Vec::new(),
        }
    }

    /// Record a transport-level failure and stop the clock.
    pub fn end_with_error(&mut self, err: impl std::fmt::Display) {
        self.status = TRANSPORT_ERROR_STATUS;
        self.error = Some(err.to_string());
        self.elapsed = self.start.elapsed();
    }
}

/// Wall-clock time as whole epoch seconds.
pub fn epoch_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_marks_transport_status() {
        let mut item = OutputItem::started();
        assert!(item.error.is_none());
        item.end_with_error("dial tcp: refused");
        assert_eq!(item.status, TRANSPORT_ERROR_STATUS);
        assert_eq!(item.error.as_deref(), Some("dial tcp: refused"));
    }

    #[test]
    fn test_ldjson_form_omits_bytes() {
        let mut item = OutputItem::started();
        item.status = 200;
        item.label = "home".into();
        item.elapsed = Duration::from_millis(125);
        item.req_bytes = b"GET / HTTP/1.1\r\n\r\n".to_vec();

        let line = serde_json::to_string(&item).unwrap();
        assert!(line.contains("\"Status\":200"));
        assert!(line.contains("\"Label\":\"home\""));
        assert!(line.contains("\"Elapsed\":0.125"));
        assert!(!line.contains("GET /"));
        assert!(!line.contains("Error"));
    }

    #[test]
    fn test_resolve_is_lazy() {
        let index = StringIndex::new(None, false).unwrap();
        let label_idx = index.idx("checkout").unwrap();
        let address_idx = index.idx("http://localhost:8080").unwrap();

        let mut item = PayloadItem {
            label_idx,
            address_idx,
            ..Default::default()
        };
        item.resolve(&index).unwrap();
        assert_eq!(item.label, "checkout");
        assert_eq!(item.address, "http://localhost:8080");

        // materialised fields win over ids
        item.label = "kept".into();
        item.resolve(&index).unwrap();
        assert_eq!(item.label, "kept");
    }
}
