//! Persistent string index
//!
//! Maps small integer ids to strings bi-directionally. Index 0 is
//! permanently bound to the empty string. The index is persisted as
//! one string per LF-terminated line; line number = id.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use thiserror::Error;

/// Errors produced by the string index
#[derive(Error, Debug)]
pub enum IndexError {
    /// Requested id is not present
    #[error("string #{0} not found in index")]
    NotFound(u16),

    /// Mutation attempted on a read-only index
    #[error("attempt to change a read-only index for {0:?}")]
    ReadOnly(String),

    /// The id space (u16) is exhausted
    #[error("string index is full")]
    Full,

    /// IO error on the backing file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

struct IndexState {
    index: Vec<String>,
    mapping: HashMap<String, u16>,
    writer: Option<BufWriter<File>>,
}

/// Append-only string↔id dictionary with optional file persistence.
pub struct StringIndex {
    readonly: bool,
    path: Option<PathBuf>,
    state: RwLock<IndexState>,
}

impl StringIndex {
    /// Create an index, loading the backing file if it exists.
    /// An empty path means a purely in-memory index.
    pub fn new(path: Option<&Path>, readonly: bool) -> Result<Self, IndexError> {
        let mut state = IndexState {
            index: vec![String::new()], // id 0 is the empty string
            mapping: HashMap::from([(String::new(), 0u16)]),
            writer: None,
        };

        if let Some(p) = path {
            if p.exists() {
                tracing::info!("Loading string index from: {}", p.display());
                let file = File::open(p)?;
                for line in BufReader::new(file).lines() {
                    let text = line?;
                    let id = state.index.len() as u16;
                    state.mapping.insert(text.clone(), id);
                    state.index.push(text);
                }
            }
        }

        Ok(Self {
            readonly,
            path: path.map(Path::to_path_buf),
            state: RwLock::new(state),
        })
    }

    /// Look up the string bound to `id`.
    pub fn get(&self, id: u16) -> Result<String, IndexError> {
        let state = self.state.read().unwrap();
        state
            .index
            .get(id as usize)
            .cloned()
            .ok_or(IndexError::NotFound(id))
    }

    /// Return the id for `s`, appending it when the index is writable.
    ///
    /// Lookups take an optimistic read path; mutation acquires the
    /// write lock and repeats the lookup before appending.
    pub fn idx(&self, s: &str) -> Result<u16, IndexError> {
        {
            let state = self.state.read().unwrap();
            if let Some(&id) = state.mapping.get(s) {
                return Ok(id);
            }
        }

        if self.readonly {
            return Err(IndexError::ReadOnly(s.to_string()));
        }

        let mut state = self.state.write().unwrap();
        if let Some(&id) = state.mapping.get(s) {
            // lost the race to another writer
            return Ok(id);
        }

        if state.index.len() > u16::MAX as usize {
            return Err(IndexError::Full);
        }

        let id = state.index.len() as u16;
        state.index.push(s.to_string());
        state.mapping.insert(s.to_string(), id);
        Self::append_file(&self.path, &mut state, s)?;
        Ok(id)
    }

    /// Number of known strings, including the reserved empty string.
    pub fn len(&self) -> usize {
        self.state.read().unwrap().index.len()
    }

    /// True when only the reserved empty string is present.
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    fn append_file(
        path: &Option<PathBuf>,
        state: &mut IndexState,
        s: &str,
    ) -> Result<(), IndexError> {
        let Some(p) = path else {
            return Ok(());
        };

        if state.writer.is_none() {
            tracing::info!("Opening string index to append: {}", p.display());
            let file = OpenOptions::new().append(true).create(true).open(p)?;
            state.writer = Some(BufWriter::new(file));
        }

        let w = state.writer.as_mut().unwrap();
        w.write_all(s.as_bytes())?;
        w.write_all(b"\n")?;
        w.flush()?;
        Ok(())
    }
}
