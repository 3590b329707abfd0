//! Error types for the HTTP driver.
//!
//! Every variant here is a transient transport error from the
//! engine's point of view: it is recorded on the output item as
//! status 999 and invalidates only the offending connection.

use thiserror::Error;

use crate::conn::ConnError;

/// Errors raised while dialing, writing or reading one exchange.
#[derive(Error, Debug)]
pub enum HttpError {
    /// Target address did not parse as a URL
    #[error("cannot parse address {0:?} as URL: {1}")]
    Address(String, String),

    /// DNS resolution yielded nothing
    #[error("no addresses resolved for {0:?}")]
    Dns(String),

    /// Dial or TLS handshake exceeded the configured timeout
    #[error("dial timeout")]
    DialTimeout,

    /// TLS setup failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// Socket-level failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure surfaced by the buffered connection
    #[error(transparent)]
    Conn(#[from] ConnError),

    /// The response did not parse as HTTP
    #[error("bad response: {0}")]
    Parse(String),

    /// Response head exceeded the sanity cap
    #[error("response headers too large")]
    HeadersTooLarge,
}
