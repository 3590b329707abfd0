//! Output pipeline: a single drainer fanning results out to the
//! configured sinks, interning strings on the way.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::OutputConf;
use crate::item::OutputItem;
use crate::strindex::{IndexError, StringIndex};

/// Buffered capacity of the result channel.
const CHANNEL_CAPACITY: usize = 1;

/// Errors produced by the output pipeline. All of them are fatal to
/// the run.
#[derive(Error, Debug)]
pub enum OutputError {
    /// IO error on a sink file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Result serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// String interning failed
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// A result sink. `push` receives every drained item in arrival
/// order; `close` flushes buffered data.
pub trait Sink: Send {
    /// Persist one result.
    fn push(&mut self, item: &OutputItem) -> Result<(), OutputError>;
    /// Flush and release the sink.
    fn close(&mut self) -> Result<(), OutputError>;
}

/// Line-delimited JSON sink: one CRLF-terminated object per result.
pub struct LdjsonSink {
    writer: Mutex<BufWriter<File>>,
}

impl LdjsonSink {
    /// Create the sink, truncating the target file.
    pub fn create(path: &str) -> Result<Self, OutputError> {
        Ok(Self {
            writer: Mutex::new(BufWriter::new(File::create(path)?)),
        })
    }
}

impl Sink for LdjsonSink {
    fn push(&mut self, item: &OutputItem) -> Result<(), OutputError> {
        let line = serde_json::to_vec(item)?;
        // one lock per record keeps lines whole
        let mut w = self.writer.lock().unwrap();
        w.write_all(&line)?;
        w.write_all(b"\r\n")?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), OutputError> {
        self.writer.lock().unwrap().flush()?;
        Ok(())
    }
}

/// Size of one binary record on disk.
pub const BINARY_RECORD_LEN: usize = 74;

/// Compact fixed-width little-endian sink. Record layout:
/// `u32 ts, u16 status, u16 err_id, u32 concurrency, f64 elapsed_s,
/// f64 connect_s, f64 sent_s, f64 first_byte_s, f64 read_s,
/// u32 worker_id, u16 label_id, u64 sent_bytes, u64 recv_bytes`,
/// byte-packed with no framing.
pub struct BinarySink {
    writer: BufWriter<File>,
    last_sec: u64,
}

impl BinarySink {
    /// Create the sink, truncating the target file.
    pub fn create(path: &str) -> Result<Self, OutputError> {
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
            last_sec: 0,
        })
    }

    /// Encode one record into its on-disk form.
    pub fn encode(item: &OutputItem) -> [u8; BINARY_RECORD_LEN] {
        let mut buf = [0u8; BINARY_RECORD_LEN];
        let mut pos = 0;
        let mut put = |bytes: &[u8]| {
            buf[pos..pos + bytes.len()].copy_from_slice(bytes);
            pos += bytes.len();
        };

        put(&(item.start_ts as u32).to_le_bytes());
        put(&item.status.to_le_bytes());
        put(&item.error_idx.to_le_bytes());
        put(&item.concurrency.to_le_bytes());
        put(&item.elapsed.as_secs_f64().to_le_bytes());
        put(&item.connect_time.as_secs_f64().to_le_bytes());
        put(&item.sent_time.as_secs_f64().to_le_bytes());
        put(&item.first_byte_time.as_secs_f64().to_le_bytes());
        put(&item.read_time.as_secs_f64().to_le_bytes());
        put(&item.worker.to_le_bytes());
        put(&item.label_idx.to_le_bytes());
        put(&item.sent_bytes.to_le_bytes());
        put(&item.recv_bytes.to_le_bytes());
        debug_assert_eq!(pos, BINARY_RECORD_LEN);
        buf
    }
}

impl Sink for BinarySink {
    fn push(&mut self, item: &OutputItem) -> Result<(), OutputError> {
        self.writer.write_all(&Self::encode(item))?;
        if item.start_ts > self.last_sec {
            self.writer.flush()?;
            self.last_sec = item.start_ts;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Full request/response trace sink: JSON header line, request bytes,
/// response bytes, each CRLF-terminated. Records below the status
/// threshold are dropped (0 = everything, 400 = failures, 600 =
/// transport errors only).
pub struct ReqRespSink {
    writer: BufWriter<File>,
    level: u16,
}

impl ReqRespSink {
    /// Create the sink, truncating the target file.
    pub fn create(path: &str, level: u16) -> Result<Self, OutputError> {
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
            level,
        })
    }
}

impl Sink for ReqRespSink {
    fn push(&mut self, item: &OutputItem) -> Result<(), OutputError> {
        if item.status < self.level {
            return Ok(());
        }
        let header = serde_json::to_vec(item)?;
        self.writer.write_all(&header)?;
        self.writer.write_all(b"\r\n")?;
        self.writer.write_all(&item.req_bytes)?;
        self.writer.write_all(b"\r\n")?;
        self.writer.write_all(&item.resp_bytes)?;
        self.writer.write_all(b"\r\n")?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// The running pipeline: a sender for workers and the drainer handle.
pub struct OutputPipeline {
    /// Result channel handed to workers.
    pub sender: mpsc::Sender<OutputItem>,
    /// Drainer task; joins with the first sink error, if any.
    pub drainer: JoinHandle<Result<(), OutputError>>,
}

impl OutputPipeline {
    /// Open the configured sinks and start the drainer task.
    ///
    /// The pipeline finishes when every sender clone is dropped; the
    /// drainer then closes the sinks and reports the outcome.
    pub fn start(conf: &OutputConf, index: Arc<StringIndex>) -> Result<Self, OutputError> {
        let mut sinks: Vec<Box<dyn Sink>> = Vec::new();
        if !conf.ldjson_file.is_empty() {
            sinks.push(Box::new(LdjsonSink::create(&conf.ldjson_file)?));
        }
        if !conf.binary_file.is_empty() {
            sinks.push(Box::new(BinarySink::create(&conf.binary_file)?));
        }
        if !conf.req_resp_file.is_empty() {
            sinks.push(Box::new(ReqRespSink::create(
                &conf.req_resp_file,
                conf.req_resp_file_level,
            )?));
        }

        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let drainer = tokio::spawn(drain(receiver, sinks, index));
        Ok(Self { sender, drainer })
    }
}

async fn drain(
    mut receiver: mpsc::Receiver<OutputItem>,
    mut sinks: Vec<Box<dyn Sink>>,
    index: Arc<StringIndex>,
) -> Result<(), OutputError> {
    while let Some(mut item) = receiver.recv().await {
        intern(&mut item, &index)?;
        for sink in &mut sinks {
            sink.push(&item)?;
        }
    }

    tracing::debug!("Output channel closed, flushing sinks");
    for sink in &mut sinks {
        sink.close()?;
    }
    Ok(())
}

/// Give both binary and JSON sinks the same ids for a given string.
fn intern(item: &mut OutputItem, index: &StringIndex) -> Result<(), OutputError> {
    if item.error_idx == 0 {
        if let Some(err) = &item.error {
            item.error_idx = index.idx(err)?;
        }
    }
    if item.label_idx == 0 && !item.label.is_empty() {
        item.label_idx = index.idx(&item.label)?;
    }
    Ok(())
}
