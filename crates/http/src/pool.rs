//! Per-target connection pool with round-robin DNS.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use url::Url;

use crate::conn::BufferedConn;
use crate::error::HttpError;
use crate::tls;
use volley_core::TlsConf;

/// Round-robin DNS cache: each lookup returns the first cached
/// address for the host and rotates it to the back.
#[derive(Default)]
pub struct RRResolver {
    cache: Mutex<HashMap<String, Vec<IpAddr>>>,
}

impl RRResolver {
    /// Resolve `host` to one address, cycling through the cached set.
    pub async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr, HttpError> {
        if let Some(addr) = self.rotate(host, port) {
            return Ok(addr);
        }

        tracing::debug!("Looking up IP for: {}", host);
        let ips: Vec<IpAddr> = tokio::net::lookup_host((host, port))
            .await?
            .map(|sa| sa.ip())
            .collect();
        if ips.is_empty() {
            return Err(HttpError::Dns(host.to_string()));
        }

        let mut cache = self.cache.lock().unwrap();
        cache.entry(host.to_string()).or_insert(ips);
        drop(cache);

        self.rotate(host, port).ok_or_else(|| HttpError::Dns(host.to_string()))
    }

    fn rotate(&self, host: &str, port: u16) -> Option<SocketAddr> {
        let mut cache = self.cache.lock().unwrap();
        let ips = cache.get_mut(host)?;
        let ip = ips.remove(0);
        ips.push(ip);
        Some(SocketAddr::new(ip, port))
    }

    #[cfg(test)]
    fn seed(&self, host: &str, ips: Vec<IpAddr>) {
        self.cache.lock().unwrap().insert(host.to_string(), ips);
    }
}

#[derive(Clone)]
struct IdleQueue {
    tx: mpsc::Sender<BufferedConn>,
    rx: Arc<Mutex<mpsc::Receiver<BufferedConn>>>,
}

/// Pool of idle buffered connections keyed by target address, plus
/// lazily built per-host TLS connectors and the DNS cache.
pub struct ConnPool {
    /// Overall per-exchange deadline, also the dial timeout.
    pub timeout: Duration,
    max_connections: usize,
    tls_conf: TlsConf,
    pools: Mutex<HashMap<String, IdleQueue>>,
    connectors: Mutex<HashMap<String, Arc<TlsConnector>>>,
    resolver: RRResolver,
}

impl ConnPool {
    /// Create a pool for the configured connection cap and timeout.
    pub fn new(max_connections: usize, timeout: Duration, tls_conf: TlsConf) -> Self {
        Self {
            timeout,
            max_connections: max_connections.max(1),
            tls_conf,
            pools: Mutex::new(HashMap::new()),
            connectors: Mutex::new(HashMap::new()),
            resolver: RRResolver::default(),
        }
    }

    fn queue(&self, address: &str) -> IdleQueue {
        let mut pools = self.pools.lock().unwrap();
        pools
            .entry(address.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.max_connections);
                IdleQueue {
                    tx,
                    rx: Arc::new(Mutex::new(rx)),
                }
            })
            .clone()
    }

    /// Return a ready connection for `address`: an idle one when
    /// available and healthy, a fresh dial otherwise. `host_hint` is
    /// the request's `Host` value, used for SNI.
    pub async fn get(&self, address: &str, host_hint: &str) -> Result<BufferedConn, HttpError> {
        let queue = self.queue(address);
        loop {
            let idle = queue.rx.lock().unwrap().try_recv().ok();
            let Some(mut conn) = idle else { break };

            if let Some(err) = conn.error() {
                if err.is_eof() {
                    tracing::debug!("Discarding idle connection to {}: {}", address, err);
                } else {
                    tracing::warn!("Cannot reuse idle connection to {}: {}", address, err);
                }
                continue;
            }

            tracing::debug!("Reusing idle connection to {}", address);
            conn.reset();
            return Ok(conn);
        }

        self.dial(address, host_hint).await
    }

    /// Return a connection to its idle queue. Cancelled or errored
    /// connections are dropped; a full queue makes the return wait.
    pub async fn put_back(&self, address: &str, conn: BufferedConn) {
        if conn.is_cancelled() || conn.error().is_some() {
            return;
        }
        let queue = self.queue(address);
        let _ = queue.tx.send(conn).await;
    }

    async fn dial(&self, address: &str, host_hint: &str) -> Result<BufferedConn, HttpError> {
        tracing::debug!("Opening new connection to {}", address);

        let with_scheme = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };
        let parsed = Url::parse(&with_scheme)
            .map_err(|e| HttpError::Address(address.to_string(), e.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| HttpError::Address(address.to_string(), "no host".into()))?
            .to_string();
        let secure = parsed.scheme() == "https";
        let port = parsed.port().unwrap_or(if secure { 443 } else { 80 });

        let target = self.resolver.resolve(&host, port).await?;
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(target))
            .await
            .map_err(|_| HttpError::DialTimeout)??;
        stream.set_nodelay(true)?;

        if !secure {
            return Ok(BufferedConn::new(Box::new(stream)));
        }

        let connector = self.connector_for(&host)?;
        let sni = if host_hint.is_empty() {
            host.clone()
        } else {
            // a Host header may carry a port; SNI must not
            host_hint
                .rsplit_once(':')
                .map(|(h, _)| h.to_string())
                .unwrap_or_else(|| host_hint.to_string())
        };
        let name = rustls::pki_types::ServerName::try_from(sni)
            .map_err(|e| HttpError::Tls(e.to_string()))?;

        let tls_stream = tokio::time::timeout(self.timeout, connector.connect(name, stream))
            .await
            .map_err(|_| HttpError::DialTimeout)?
            .map_err(|e| HttpError::Tls(e.to_string()))?;
        Ok(BufferedConn::new(Box::new(tls_stream)))
    }

    fn connector_for(&self, host: &str) -> Result<Arc<TlsConnector>, HttpError> {
        let mut connectors = self.connectors.lock().unwrap();
        if let Some(c) = connectors.get(host) {
            return Ok(Arc::clone(c));
        }
        let connector = Arc::new(tls::build_connector(&self.tls_conf)?);
        connectors.insert(host.to_string(), Arc::clone(&connector));
        Ok(connector)
    }
}
