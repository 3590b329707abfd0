//! Buffered connection: an async read loop plus a recording buffer
//! over a raw socket.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default cap on the recording buffer (1 MiB). A limit of 0 or below means
/// unlimited recording.
pub const DEFAULT_RECORD_LIMIT: i64 = 1024 * 1024;

const READ_BUF_SIZE: usize = 4096;

/// Byte stream a connection can run over (plain TCP or TLS).
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Boxed transport handed to [`BufferedConn::new`].
pub type BoxedTransport = Box<dyn Transport>;

/// Terminal condition of a connection's read side.
#[derive(Error, Debug, Clone)]
pub enum ConnError {
    /// Peer closed the connection
    #[error("connection closed by peer")]
    Eof,

    /// The configured read deadline passed
    #[error("read timeout")]
    Timeout,

    /// Any other socket failure
    #[error("{0}")]
    Io(String),
}

impl ConnError {
    /// EOF is an expected way for idle connections to die; it is
    /// logged quieter than real failures.
    pub fn is_eof(&self) -> bool {
        matches!(self, ConnError::Eof)
    }
}

struct Shared {
    error: Mutex<Option<ConnError>>,
    recording: Mutex<BytesMut>,
    read_len: AtomicU64,
    record_limit: AtomicI64,
    first_read: Mutex<Option<Instant>>,
}

impl Shared {
    fn set_error(&self, err: ConnError) {
        let mut cell = self.error.lock().unwrap();
        if cell.is_none() {
            *cell = Some(err);
        }
    }
}

/// One pooled connection: a writer half plus a reader task that
/// mirrors incoming bytes into a capped recording buffer and streams
/// them to the consumer as chunks.
///
/// Once the error cell is set no further chunks are produced; chunks
/// already received stay readable. `close` is idempotent; `reset`
/// clears the recording state but never the error cell.
pub struct BufferedConn {
    writer: WriteHalf<BoxedTransport>,
    chunks: mpsc::Receiver<Bytes>,
    leftover: Bytes,
    shared: Arc<Shared>,
    deadline: Option<Instant>,
    reader: JoinHandle<()>,
    closed: bool,
    cancelled: bool,
}

impl BufferedConn {
    /// Take ownership of a transport and spawn its reader task.
    pub fn new(stream: BoxedTransport) -> Self {
        let (read_half, writer) = tokio::io::split(stream);
        let shared = Arc::new(Shared {
            error: Mutex::new(None),
            recording: Mutex::new(BytesMut::new()),
            read_len: AtomicU64::new(0),
            record_limit: AtomicI64::new(DEFAULT_RECORD_LIMIT),
            first_read: Mutex::new(None),
        });
        let (tx, chunks) = mpsc::channel(1);
        let reader = tokio::spawn(read_loop(read_half, tx, Arc::clone(&shared)));

        Self {
            writer,
            chunks,
            leftover: Bytes::new(),
            shared,
            deadline: None,
            reader,
            closed: false,
            cancelled: false,
        }
    }

    /// Copy the next chunk of response bytes into `dst`, honoring the
    /// configured deadline. Returns the terminal error once the
    /// stream is exhausted.
    pub async fn read(&mut self, dst: &mut [u8]) -> Result<usize, ConnError> {
        if self.leftover.is_empty() {
            let chunk = match self.deadline {
                Some(d) => tokio::time::timeout_at(d.into(), self.chunks.recv())
                    .await
                    .map_err(|_| ConnError::Timeout)?,
                None => self.chunks.recv().await,
            };
            match chunk {
                Some(bytes) => self.leftover = bytes,
                None => return Err(self.error().unwrap_or(ConnError::Eof)),
            }
        }

        let n = dst.len().min(self.leftover.len());
        dst[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.advance(n);
        Ok(n)
    }

    /// Write the whole buffer, honoring the configured deadline.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), ConnError> {
        let write = self.writer.write_all(buf);
        let res = match self.deadline {
            Some(d) => tokio::time::timeout_at(d.into(), write)
                .await
                .map_err(|_| ConnError::Timeout)?,
            None => write.await,
        };
        res.map_err(|e| ConnError::Io(e.to_string()))
    }

    /// Set the overall deadline for subsequent reads and writes.
    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// Cap the recording buffer; 0 or below records everything.
    pub fn set_record_limit(&self, limit: i64) {
        self.shared.record_limit.store(limit, Ordering::Relaxed);
    }

    /// Instant of the first successful read since the last reset.
    pub fn first_read(&self) -> Option<Instant> {
        *self.shared.first_read.lock().unwrap()
    }

    /// Bytes read from the wire since the last reset.
    pub fn read_len(&self) -> u64 {
        self.shared.read_len.load(Ordering::Relaxed)
    }

    /// Snapshot of the recording buffer.
    pub fn recorded(&self) -> Vec<u8> {
        self.shared.recording.lock().unwrap().to_vec()
    }

    /// Terminal error, if the read loop has hit one.
    pub fn error(&self) -> Option<ConnError> {
        self.shared.error.lock().unwrap().clone()
    }

    /// Prepare a pooled connection for its next exchange: clears the
    /// read length, the recording buffer, the first-read stamp and
    /// restores the default record limit. The error cell survives.
    pub fn reset(&mut self) {
        self.shared.read_len.store(0, Ordering::Relaxed);
        self.shared.recording.lock().unwrap().clear();
        *self.shared.first_read.lock().unwrap() = None;
        self.shared
            .record_limit
            .store(DEFAULT_RECORD_LIMIT, Ordering::Relaxed);
        self.leftover = Bytes::new();
        self.deadline = None;
    }

    /// Shut the connection down. Safe to call repeatedly; a closed
    /// connection is never returned to the pool.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cancelled = true;
        let _ = self.writer.shutdown().await;
        self.reader.abort();
    }

    /// True when the connection must not be pooled again.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

impl Drop for BufferedConn {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    mut read_half: ReadHalf<BoxedTransport>,
    tx: mpsc::Sender<Bytes>,
    shared: Arc<Shared>,
) {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                shared.set_error(ConnError::Eof);
                break;
            }
            Ok(n) => {
                {
                    let mut first = shared.first_read.lock().unwrap();
                    if first.is_none() {
                        *first = Some(Instant::now());
                    }
                }

                let total = shared.read_len.fetch_add(n as u64, Ordering::Relaxed) + n as u64;
                let limit = shared.record_limit.load(Ordering::Relaxed);
                if limit <= 0 || total <= limit as u64 {
                    shared.recording.lock().unwrap().extend_from_slice(&buf[..n]);
                }

                if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break; // consumer is gone
                }
            }
            Err(e) => {
                shared.set_error(ConnError::Io(e.to_string()));
                break;
            }
        }
    }
    // dropping the sender closes the chunks channel
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (BufferedConn, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (BufferedConn::new(Box::new(client)), server)
    }

    #[tokio::test]
    async fn test_read_records_and_counts() {
        let (mut conn, mut server) = pair().await;
        server.write_all(b"hello world").await.unwrap();

        let mut dst = [0u8; 5];
        let n = conn.read(&mut dst).await.unwrap();
        assert_eq!(&dst[..n], &b"hello world"[..n]);

        // drain whatever is left of the first chunk
        let mut rest = [0u8; 64];
        let mut got = n;
        while got < 11 {
            got += conn.read(&mut rest).await.unwrap();
        }

        assert_eq!(conn.read_len(), 11);
        assert!(conn.first_read().is_some());
        assert_eq!(conn.recorded(), b"hello world");
        assert!(conn.error().is_none());
    }

    #[tokio::test]
    async fn test_eof_sets_error_cell_after_data() {
        let (mut conn, mut server) = pair().await;
        server.write_all(b"tail").await.unwrap();
        drop(server);

        // already-received bytes are not lost
        let mut dst = [0u8; 16];
        let n = conn.read(&mut dst).await.unwrap();
        assert_eq!(&dst[..n], b"tail");

        let err = conn.read(&mut dst).await.unwrap_err();
        assert!(err.is_eof());
        assert!(conn.error().unwrap().is_eof());
    }

    #[tokio::test]
    async fn test_deadline_times_out_read() {
        let (mut conn, _server) = pair().await;
        conn.set_deadline(Instant::now() + Duration::from_millis(50));

        let mut dst = [0u8; 4];
        let err = conn.read(&mut dst).await.unwrap_err();
        assert!(matches!(err, ConnError::Timeout));
    }

    #[tokio::test]
    async fn test_reset_clears_state_but_not_error() {
        let (mut conn, mut server) = pair().await;
        server.write_all(b"data").await.unwrap();
        drop(server);

        let mut dst = [0u8; 16];
        conn.read(&mut dst).await.unwrap();
        while conn.read(&mut dst).await.is_ok() {}
        assert!(conn.error().is_some());

        conn.set_record_limit(0);
        conn.reset();
        assert_eq!(conn.read_len(), 0);
        assert!(conn.recorded().is_empty());
        assert!(conn.first_read().is_none());
        assert!(conn.error().is_some(), "reset must keep the error cell");
    }

    #[tokio::test]
    async fn test_record_limit_caps_recording() {
        let (mut conn, mut server) = pair().await;
        conn.set_record_limit(4);
        server.write_all(b"0123").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.write_all(b"4567").await.unwrap();

        let mut dst = [0u8; 16];
        let mut got = 0;
        while got < 8 {
            got += conn.read(&mut dst).await.unwrap();
        }
        assert_eq!(conn.read_len(), 8);
        assert_eq!(conn.recorded(), b"0123");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_cancels() {
        let (mut conn, _server) = pair().await;
        conn.close().await;
        conn.close().await;
        assert!(conn.is_cancelled());
    }

    #[tokio::test]
    async fn test_write_reaches_peer() {
        let (mut conn, mut server) = pair().await;
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
