//! Minimal HTTP/1.1 response parsing over a buffered connection.
//!
//! Only what the driver needs: the status code, the headers steering
//! connection reuse, and enough framing knowledge to drain the body.

use crate::conn::{BufferedConn, ConnError};
use crate::error::HttpError;

/// Sanity cap on the response head.
const MAX_HEAD: usize = 64 * 1024;

const SCRATCH: usize = 4096;

/// What the driver learns from one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseInfo {
    /// Parsed status code
    pub status: u16,
    /// Server signalled `Connection: close`
    pub close: bool,
}

#[derive(Debug, Default)]
struct Head {
    status: u16,
    close: bool,
    content_length: Option<u64>,
    chunked: bool,
}

/// Read and drain one full response, returning its head facts. The
/// wire bytes stay available through the connection's recording
/// buffer; this function only consumes them.
pub async fn read_response(conn: &mut BufferedConn) -> Result<ResponseInfo, HttpError> {
    let mut buf: Vec<u8> = Vec::with_capacity(SCRATCH);

    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD {
            return Err(HttpError::HeadersTooLarge);
        }
        fill(conn, &mut buf).await?;
    };

    let head = parse_head(&buf[..head_end])?;

    let no_body = head.status / 100 == 1 || head.status == 204 || head.status == 304;
    if !no_body {
        let tail = buf.split_off(head_end);
        drain_body(conn, &head, tail).await?;
    }

    Ok(ResponseInfo {
        status: head.status,
        close: head.close,
    })
}

async fn drain_body(
    conn: &mut BufferedConn,
    head: &Head,
    tail: Vec<u8>,
) -> Result<(), HttpError> {
    if head.chunked {
        return drain_chunked(conn, tail).await;
    }

    if let Some(length) = head.content_length {
        let mut remaining = length.saturating_sub(tail.len() as u64);
        let mut scratch = [0u8; SCRATCH];
        while remaining > 0 {
            let n = conn.read(&mut scratch).await?;
            remaining = remaining.saturating_sub(n as u64);
        }
        return Ok(());
    }

    // no framing: the body runs until the peer closes
    let mut scratch = [0u8; SCRATCH];
    loop {
        match conn.read(&mut scratch).await {
            Ok(_) => continue,
            Err(e) if e.is_eof() => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Consume a chunked body starting from `pending` already-read bytes.
async fn drain_chunked(conn: &mut BufferedConn, mut pending: Vec<u8>) -> Result<(), HttpError> {
    loop {
        // one chunk-size line
        let line_end = loop {
            if let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                break pos;
            }
            if pending.len() > MAX_HEAD {
                return Err(HttpError::Parse("runaway chunk size line".into()));
            }
            fill(conn, &mut pending).await?;
        };

        let line = String::from_utf8_lossy(&pending[..line_end]);
        let size_text = line.trim().split(';').next().unwrap_or("").trim();
        let size = u64::from_str_radix(size_text, 16)
            .map_err(|_| HttpError::Parse(format!("bad chunk size {size_text:?}")))?;
        pending.drain(..line_end + 1);

        if size == 0 {
            // trailers: consume up to the final blank line
            loop {
                if let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = pending.drain(..pos + 1).collect();
                    if line == b"\r\n" || line == b"\n" {
                        return Ok(());
                    }
                    continue;
                }
                fill(conn, &mut pending).await?;
            }
        }

        // chunk data plus its trailing CRLF
        let mut need = size + 2;
        while (pending.len() as u64) < need {
            need -= pending.len() as u64;
            pending.clear();
            let mut scratch = [0u8; SCRATCH];
            let n = conn.read(&mut scratch).await?;
            pending.extend_from_slice(&scratch[..n]);
        }
        pending.drain(..need as usize);
    }
}

async fn fill(conn: &mut BufferedConn, buf: &mut Vec<u8>) -> Result<(), ConnError> {
    let mut scratch = [0u8; SCRATCH];
    let n = conn.read(&mut scratch).await?;
    buf.extend_from_slice(&scratch[..n]);
    Ok(())
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_head(head: &[u8]) -> Result<Head, HttpError> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| HttpError::Parse("empty response".into()))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/") {
        return Err(HttpError::Parse(format!("bad status line {status_line:?}")));
    }
    let status: u16 = parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| HttpError::Parse(format!("bad status code in {status_line:?}")))?;

    let mut parsed = Head {
        status,
        ..Default::default()
    };

    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            parsed.content_length = value.parse().ok();
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            parsed.chunked = value.to_ascii_lowercase().contains("chunked");
        } else if name.eq_ignore_ascii_case("connection") {
            parsed.close = value.eq_ignore_ascii_case("close");
        }
    }

    Ok(parsed)
}
