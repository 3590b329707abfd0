//! The HTTP nib: one request/response exchange over a pooled
//! connection, with phase timings and wire recording.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::conn::DEFAULT_RECORD_LIMIT;
use crate::parse;
use crate::pool::ConnPool;
use volley_core::{Nib, OutputItem, PayloadItem};

/// Placeholder substituted with the request body length before send.
pub const CONTENT_LENGTH_SENTINEL: &[u8] = b"${:content-length:}";

/// Facts scraped from the raw request bytes.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PayloadMeta {
    /// `Host` header value, the pooling/SNI hint
    pub host: String,
    /// The request declares `Connection: close`
    pub conn_close: bool,
    /// Length of everything after the header block
    pub body_len: usize,
}

/// Scan the request head for the `Host` and `Connection` headers,
/// yielding the body length as a byproduct. Header names match
/// case-insensitively; the scan stops at the blank line.
pub fn scan_payload(payload: &[u8]) -> PayloadMeta {
    let mut meta = PayloadMeta::default();
    let mut rest = payload;

    // swallow the request line
    match split_line(rest) {
        Some((_, tail)) => rest = tail,
        None => return meta,
    }

    while let Some((line, tail)) = split_line(rest) {
        rest = tail;
        if line.is_empty() {
            meta.body_len = rest.len();
            return meta;
        }
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let name = &line[..colon];
        let value = String::from_utf8_lossy(&line[colon + 1..]).trim().to_string();
        if name.eq_ignore_ascii_case(b"host") {
            meta.host = value;
        } else if name.eq_ignore_ascii_case(b"connection") {
            meta.conn_close = value.eq_ignore_ascii_case("close");
        }
    }
    meta
}

/// One line up to LF, with CR trimmed; returns the remainder after LF.
fn split_line(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let lf = data.iter().position(|&b| b == b'\n')?;
    let mut line = &data[..lf];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    Some((line, &data[lf + 1..]))
}

/// Replace every `${:content-length:}` occurrence with the decimal
/// body length.
pub fn replace_sentinel(payload: &mut Vec<u8>, body_len: usize) {
    let needle = CONTENT_LENGTH_SENTINEL;
    let decimal = body_len.to_string().into_bytes();
    let mut out = Vec::with_capacity(payload.len());
    let mut pos = 0;
    while let Some(found) = payload[pos..]
        .windows(needle.len())
        .position(|w| w == needle)
    {
        out.extend_from_slice(&payload[pos..pos + found]);
        out.extend_from_slice(&decimal);
        pos += found + needle.len();
    }
    if pos == 0 {
        return;
    }
    out.extend_from_slice(&payload[pos..]);
    *payload = out;
}

/// HTTP protocol driver bound to a shared connection pool.
pub struct HttpNib {
    pool: Arc<ConnPool>,
}

impl HttpNib {
    /// Create a driver instance over the shared pool.
    pub fn new(pool: Arc<ConnPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Nib for HttpNib {
    async fn punch(&mut self, item: &mut PayloadItem) -> OutputItem {
        let mut out = OutputItem::started();

        let meta = scan_payload(&item.payload);
        if !item.replaces.is_empty() {
            replace_sentinel(&mut item.payload, meta.body_len);
        }

        let before = Instant::now();
        let mut conn = match self.pool.get(&item.address, &meta.host).await {
            Ok(conn) => conn,
            Err(e) => {
                out.end_with_error(e);
                return out;
            }
        };
        let connected = Instant::now();
        out.connect_time = connected.duration_since(before);

        conn.set_record_limit(if item.extractors.is_empty() {
            DEFAULT_RECORD_LIMIT
        } else {
            0
        });
        conn.set_deadline(Instant::now() + self.pool.timeout);

        tracing::debug!("Writing {} bytes into connection", item.payload.len());
        if let Err(e) = conn.write_all(&item.payload).await {
            out.sent_time = connected.elapsed();
            out.end_with_error(e);
            return out;
        }
        out.sent_bytes = item.payload.len() as u64;
        out.sent_time = connected.elapsed();

        let begin = Instant::now();
        let info = match parse::read_response(&mut conn).await {
            Ok(info) => info,
            Err(e) => {
                out.read_time = begin.elapsed();
                out.end_with_error(e);
                return out;
            }
        };
        out.status = info.status;

        let finish = Instant::now();
        match conn.first_read() {
            Some(first) => {
                out.first_byte_time = first.saturating_duration_since(begin);
                out.read_time = finish.saturating_duration_since(first);
            }
            None => out.read_time = finish.saturating_duration_since(begin),
        }
        out.elapsed = finish.saturating_duration_since(out.start);
        out.recv_bytes = conn.read_len();
        out.resp_bytes = conn.recorded();

        if info.close || meta.conn_close {
            tokio::spawn(async move { conn.close().await });
        } else {
            self.pool.put_back(&item.address, conn).await;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use volley_core::{ExtractRegex, TlsConf, TRANSPORT_ERROR_STATUS};

    #[test]
    fn test_scan_finds_host_and_close() {
        let meta = scan_payload(
            b"GET /path HTTP/1.1\r\nHost: example.com:8443\r\nConnection: close\r\n\r\nbody!",
        );
        assert_eq!(
            meta,
            PayloadMeta {
                host: "example.com:8443".into(),
                conn_close: true,
                body_len: 5,
            }
        );
    }

    #[test]
    fn test_scan_is_case_insensitive() {
        let meta = scan_payload(b"GET / HTTP/1.1\r\nhOsT: x\r\ncONNECTION: keep-alive\r\n\r\n");
        assert_eq!(meta.host, "x");
        assert!(!meta.conn_close);
        assert_eq!(meta.body_len, 0);
    }

    #[test]
    fn test_scan_without_blank_line() {
        let meta = scan_payload(b"GET / HTTP/1.1\r\nHost: y\r\n");
        assert_eq!(meta.host, "y");
        assert_eq!(meta.body_len, 0);
    }

    #[test]
    fn test_sentinel_replacement() {
        let mut payload = b"POST /?${:content-length:} HTTP/1.1\r\n\r\nbody".to_vec();
        let body_len = scan_payload(&payload).body_len;
        assert_eq!(body_len, 4);
        replace_sentinel(&mut payload, body_len);
        assert_eq!(payload, b"POST /?4 HTTP/1.1\r\n\r\nbody");
    }

    #[test]
    fn test_sentinel_absent_is_untouched() {
        let mut payload = b"GET / HTTP/1.1\r\n\r\n".to_vec();
        let before = payload.clone();
        replace_sentinel(&mut payload, 0);
        assert_eq!(payload, before);
    }

    /// Serves canned HTTP responses, counting accepted connections.
    async fn serve(
        response: &'static [u8],
        dials: Arc<AtomicUsize>,
    ) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { break };
                dials.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        let Ok(n) = sock.read(&mut buf).await else { return };
                        if n == 0 {
                            return;
                        }
                        if sock.write_all(response).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    fn nib_for(timeout_secs: u64) -> HttpNib {
        let pool = ConnPool::new(4, Duration::from_secs(timeout_secs), TlsConf::default());
        HttpNib::new(Arc::new(pool))
    }

    fn get_item(addr: std::net::SocketAddr, extra_header: &str) -> PayloadItem {
        PayloadItem {
            address: addr.to_string(),
            payload: format!("GET / HTTP/1.1\r\nHost: localhost\r\n{extra_header}\r\n")
                .into_bytes(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_punch_happy_path_reuses_connection() {
        let dials = Arc::new(AtomicUsize::new(0));
        let addr = serve(
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
            Arc::clone(&dials),
        )
        .await;
        let mut nib = nib_for(2);

        for _ in 0..3 {
            let mut item = get_item(addr, "");
            let out = nib.punch(&mut item).await;
            assert_eq!(out.status, 200);
            assert!(out.error.is_none());
            assert!(out.sent_bytes > 0);
            assert!(out.recv_bytes > 0);
            assert!(out.elapsed >= out.first_byte_time);
            assert!(String::from_utf8_lossy(&out.resp_bytes).contains("200 OK"));
        }

        // keep-alive exchanges share one dial
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dials.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_punch_connection_close_dials_each_time() {
        let dials = Arc::new(AtomicUsize::new(0));
        let addr = serve(
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
            Arc::clone(&dials),
        )
        .await;
        let mut nib = nib_for(2);

        for _ in 0..3 {
            let mut item = get_item(addr, "Connection: close\r\n");
            let out = nib.punch(&mut item).await;
            assert_eq!(out.status, 200);
            assert!(out.error.is_none());
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dials.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_punch_records_response_for_extraction() {
        let dials = Arc::new(AtomicUsize::new(0));
        let addr = serve(
            b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\nsid=zz42",
            Arc::clone(&dials),
        )
        .await;
        let mut nib = nib_for(2);

        let mut item = get_item(addr, "");
        item.extractors.insert(
            "sid".into(),
            ExtractRegex {
                re: regex::bytes::Regex::new(r"sid=(\w+)").unwrap(),
                group: 1,
                match_no: 0,
            },
        );
        let out = nib.punch(&mut item).await;
        assert_eq!(out.status, 200);
        assert!(String::from_utf8_lossy(&out.resp_bytes).contains("sid=zz42"));
    }

    #[tokio::test]
    async fn test_punch_refused_is_transport_error() {
        let mut nib = nib_for(1);
        // bind-then-drop gives a port that refuses connections
        let victim = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = victim.local_addr().unwrap();
        drop(victim);

        let mut item = get_item(addr, "");
        let out = nib.punch(&mut item).await;
        assert_eq!(out.status, TRANSPORT_ERROR_STATUS);
        assert!(out.error.is_some());
    }

    #[tokio::test]
    async fn test_punch_timeout_is_transport_error() {
        // a listener that accepts and never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let Ok((_sock, _)) = listener.accept().await else { return };
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mut nib = nib_for(1);
        let mut item = get_item(addr, "");
        let out = nib.punch(&mut item).await;
        assert_eq!(out.status, TRANSPORT_ERROR_STATUS);
        assert!(out.error.unwrap().contains("timeout"));
    }
}
