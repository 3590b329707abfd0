//! Payload input source.
//!
//! Payloads come either from an injection channel (tests) or from a
//! binary payload file: records of one JSON metadata line followed by
//! exactly `plen` bytes of raw payload. The file is replayed on EOF
//! until the configured iteration limit is reached.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::InputConf;
use crate::item::PayloadItem;
use crate::strindex::{IndexError, StringIndex};
use crate::values::{AssertRegex, ExtractRegex};

/// Buffered capacity of the payload channel.
const CHANNEL_CAPACITY: usize = 16;

/// Window scanned for one metadata line.
const READ_WINDOW: usize = 4096;

/// Errors produced while reading payload records.
#[derive(Error, Debug)]
pub enum InputError {
    /// IO error on the payload file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata line is not valid JSON
    #[error("bad metadata line: {0}")]
    Json(#[from] serde_json::Error),

    /// Structurally broken record
    #[error("malformed record: {0}")]
    Malformed(String),

    /// Metadata references an unknown string id
    #[error(transparent)]
    Index(#[from] IndexError),

    /// Descriptor carries an invalid regex
    #[error("bad descriptor regex: {0}")]
    Regex(#[from] regex::Error),
}

/// Record metadata line. The compact form carries string-index ids
/// (`l,a,plen,r,e,c`), the expanded form materialised strings; the
/// parser accepts whichever appears.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MetaRecord {
    l: Option<u16>,
    a: Option<u16>,
    #[serde(alias = "PayloadLen")]
    plen: Option<usize>,
    r: Option<Vec<u16>>,
    e: Option<Vec<u16>>,
    c: Option<Vec<u16>>,
    label: Option<String>,
    address: Option<String>,
    replaces: Option<Vec<String>>,
    extracts: Option<Vec<String>>,
    asserts: Option<Vec<String>>,
}

/// Extractor descriptor: `name match group regex`.
fn parse_extractor(desc: &str) -> Result<(String, ExtractRegex), InputError> {
    let mut parts = desc.splitn(4, ' ');
    let mut field = |what: &str| {
        parts
            .next()
            .ok_or_else(|| InputError::Malformed(format!("extractor missing {what}: {desc:?}")))
    };

    let name = field("name")?.to_string();
    let match_no: isize = field("match")?
        .parse()
        .map_err(|_| InputError::Malformed(format!("bad extractor match in {desc:?}")))?;
    let group: usize = field("group")?
        .parse()
        .map_err(|_| InputError::Malformed(format!("bad extractor group in {desc:?}")))?;
    let re = regex::bytes::Regex::new(field("regex")?)?;

    Ok((name, ExtractRegex { re, group, match_no }))
}

/// Assertion descriptor: `invert regex`, invert != "0" means inverted.
fn parse_assert(desc: &str) -> Result<AssertRegex, InputError> {
    let (invert, re) = desc
        .split_once(' ')
        .ok_or_else(|| InputError::Malformed(format!("bad assertion descriptor: {desc:?}")))?;
    Ok(AssertRegex {
        re: regex::bytes::Regex::new(re)?,
        invert: invert != "0",
    })
}

/// Sequential reader over the binary payload file.
pub struct PayloadReader {
    file: File,
    index: Arc<StringIndex>,
    attempted: u64,
    parsed: u64,
}

impl PayloadReader {
    /// Open the payload file named by the configuration.
    pub fn open(conf: &InputConf, index: Arc<StringIndex>) -> Result<Self, InputError> {
        let file = File::open(&conf.payload_file)?;
        Ok(Self {
            file,
            index,
            attempted: 0,
            parsed: 0,
        })
    }

    /// Read the next record; `Ok(None)` signals EOF.
    pub fn next_record(&mut self) -> Result<Option<PayloadItem>, InputError> {
        let mut chunk = [0u8; READ_WINDOW];
        loop {
            let n = self.file.read(&mut chunk)?;
            if n == 0 {
                return Ok(None);
            }

            // skip record separators left from the previous payload
            let mut start = 0;
            while start < n && (chunk[start] == b'\r' || chunk[start] == b'\n') {
                start += 1;
            }
            if start == n {
                continue;
            }

            self.attempted += 1;
            let item = self.parse_record(&chunk[..n], start)?;
            self.parsed += 1;
            return Ok(Some(item));
        }
    }

    fn parse_record(&mut self, chunk: &[u8], start: usize) -> Result<PayloadItem, InputError> {
        let lf = chunk[start..]
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| InputError::Malformed("no metadata line in read window".into()))?;
        let meta_end = start + lf;

        // the unread suffix belongs to the payload; give it back
        let unread = chunk.len() - (meta_end + 1);
        self.file.seek(SeekFrom::Current(-(unread as i64)))?;

        let mut line = &chunk[start..meta_end];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        let meta: MetaRecord = serde_json::from_slice(line)?;

        let plen = meta
            .plen
            .ok_or_else(|| InputError::Malformed("metadata misses payload length".into()))?;
        let mut payload = vec![0u8; plen];
        self.file.read_exact(&mut payload)?;

        self.build_item(meta, payload)
    }

    fn build_item(&self, meta: MetaRecord, payload: Vec<u8>) -> Result<PayloadItem, InputError> {
        let mut item = PayloadItem {
            payload,
            label_idx: meta.l.unwrap_or(0),
            address_idx: meta.a.unwrap_or(0),
            label: meta.label.unwrap_or_default(),
            address: meta.address.unwrap_or_default(),
            ..Default::default()
        };

        for id in meta.r.unwrap_or_default() {
            item.replaces.push(self.index.get(id)?);
        }
        item.replaces.extend(meta.replaces.unwrap_or_default());

        for id in meta.e.unwrap_or_default() {
            let (name, ex) = parse_extractor(&self.index.get(id)?)?;
            item.extractors.insert(name, ex);
        }
        for desc in meta.extracts.unwrap_or_default() {
            let (name, ex) = parse_extractor(&desc)?;
            item.extractors.insert(name, ex);
        }

        for id in meta.c.unwrap_or_default() {
            item.asserts.push(parse_assert(&self.index.get(id)?)?);
        }
        for desc in meta.asserts.unwrap_or_default() {
            item.asserts.push(parse_assert(&desc)?);
        }

        Ok(item)
    }

    /// Rewind to the start of the file for another pass.
    pub fn rewind(&mut self) -> Result<(), InputError> {
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// True when fewer than half of the attempted records parsed.
    pub fn mostly_broken(&self) -> bool {
        self.attempted > 0 && self.parsed * 2 < self.attempted
    }
}

/// Start the payload file reader, returning its channel.
///
/// The reader runs on a blocking thread: it replays the file on EOF
/// until `IterationLimit` passes are done (0 = forever) and closes
/// the channel afterwards. A first pass with more than half of the
/// records broken aborts the process.
pub fn start_file_input(
    conf: &InputConf,
    index: Arc<StringIndex>,
) -> Result<mpsc::Receiver<PayloadItem>, InputError> {
    let mut reader = PayloadReader::open(conf, index)?;
    let limit = conf.iteration_limit;
    let path = conf.payload_file.clone();
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::task::spawn_blocking(move || {
        let mut passes: i64 = 0;
        loop {
            match reader.next_record() {
                Ok(Some(item)) => {
                    if tx.blocking_send(item).is_err() {
                        return; // all consumers are gone
                    }
                }
                Ok(None) => {
                    if passes == 0 && reader.mostly_broken() {
                        tracing::error!(
                            "More than half of the records in {} are broken, aborting",
                            path
                        );
                        std::process::exit(1);
                    }
                    passes += 1;
                    if limit > 0 && passes >= limit {
                        tracing::info!("Input exhausted after {} passes", passes);
                        return; // closes the channel
                    }
                    if let Err(e) = reader.rewind() {
                        tracing::error!("Cannot rewind {}: {}", path, e);
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!("Skipping unparseable record in {}: {}", path, e);
                }
            }
        }
    });

    Ok(rx)
}
