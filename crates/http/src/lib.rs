//! Volley HTTP - raw-socket HTTP/1.1 driver with connection pooling
//!
//! The driver writes payloads to the wire exactly as given, parses
//! the response itself and keeps per-target pools of reusable
//! buffered connections.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conn;
pub mod error;
pub mod nib;
pub mod parse;
pub mod pool;
pub mod tls;

pub use conn::{BufferedConn, ConnError, DEFAULT_RECORD_LIMIT};
pub use error::HttpError;
pub use nib::HttpNib;
pub use pool::ConnPool;
