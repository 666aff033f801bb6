//! Raw TCP adapter.
//!
//! Connections are pooled per `(host, port)`. Connect resolves the host and
//! waits for readiness under a 5 s ceiling; receive waits up to 1 s and
//! treats "no data" as a normal outcome (status 204), while a peer close
//! surfaces as status 410 and disconnects the entry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::clock::Stopwatch;
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::request::{Protocol, MAX_BODY_LEN};
use crate::response::{Response, Trailer};

pub const DEFAULT_PORT: u16 = 80;
pub const MAX_CONNECTIONS: usize = 100;

const CONNECT_DEADLINE: Duration = Duration::from_secs(5);
const RECEIVE_DEADLINE: Duration = Duration::from_secs(1);

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TcpKey {
    pub host: String,
    pub port: u16,
}

#[derive(Default)]
pub struct TcpConn {
    stream: Option<TcpStream>,
    socket_id: u64,
    connected: bool,
    connect_time_us: u64,
    last_error: String,
}

pub struct TcpAdapter {
    registry: Registry<TcpKey, TcpConn>,
}

impl TcpAdapter {
    pub fn new() -> Self {
        Self { registry: Registry::new("tcp", MAX_CONNECTIONS) }
    }

    pub async fn connect(&self, host: &str, port: u16) -> Result<Response> {
        if host.is_empty() || port == 0 {
            return Err(Error::InvalidArgument("TCP host and port are mandatory".into()));
        }
        let key = TcpKey { host: host.into(), port };
        let entry = self.registry.find_or_create(&key, TcpConn::default)?;
        let mut conn = entry.lock().await;

        let sw = Stopwatch::start();
        let mut resp = Response::new(Protocol::Tcp);

        if conn.connected {
            resp.status_code = 200;
            resp.success = true;
            resp.body = format!("TCP connection already established to {host}:{port}");
            resp.response_time_us = sw.elapsed_us();
            resp.trailer = conn.trailer(0, 0);
            return Ok(resp);
        }

        match self.open(host, port).await {
            Ok(stream) => {
                conn.stream = Some(stream);
                conn.connected = true;
                conn.socket_id = NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed);
                conn.connect_time_us = sw.elapsed_us();
                conn.last_error.clear();
                resp.status_code = 200;
                resp.success = true;
                resp.body = format!("TCP connection established to {host}:{port}");
                resp.trailer = conn.trailer(0, 0);
            }
            Err(err) => {
                tracing::debug!(host, port, %err, "tcp connect failed");
                conn.last_error = err.to_string();
                resp = Response::from_error(Protocol::Tcp, &err, sw.elapsed_us());
            }
        }
        resp.response_time_us = sw.elapsed_us();
        Ok(resp)
    }

    async fn open(&self, host: &str, port: u16) -> Result<TcpStream> {
        let mut addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| Error::TransportFailed(format!("failed to resolve {host}: {e}")))?;
        let addr = addrs
            .next()
            .ok_or_else(|| Error::TransportFailed(format!("failed to resolve {host}: no address")))?;
        timeout(CONNECT_DEADLINE, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout(CONNECT_DEADLINE))?
            .map_err(|e| Error::TransportFailed(format!("connect to {host}:{port}: {e}")))
    }

    pub async fn send(&self, host: &str, port: u16, data: &str) -> Result<Response> {
        let key = TcpKey { host: host.into(), port };
        let sw = Stopwatch::start();

        let Some(entry) = self.registry.find(&key) else {
            return Ok(not_connected(sw.elapsed_us()));
        };
        let mut conn = entry.lock().await;
        if !conn.connected {
            return Ok(not_connected(sw.elapsed_us()));
        }

        let mut resp = Response::new(Protocol::Tcp);
        let stream = conn.stream.as_mut().expect("connected entry owns its stream");
        let written = stream.write_all(data.as_bytes()).await;
        match written {
            Ok(()) => {
                resp.status_code = 200;
                resp.success = true;
                resp.body = format!("sent {} bytes to {host}:{port}", data.len());
                resp.trailer = conn.trailer(data.len() as u64, 0);
            }
            Err(e) => {
                let err = Error::TransportFailed(format!("send: {e}"));
                conn.last_error = err.to_string();
                resp = Response::from_error(Protocol::Tcp, &err, sw.elapsed_us());
            }
        }
        resp.response_time_us = sw.elapsed_us();
        Ok(resp)
    }

    /// Read whatever the peer has queued. No data within the deadline is a
    /// normal outcome (204, empty body); a clean peer close yields 410 and
    /// disconnects the entry.
    pub async fn receive(&self, host: &str, port: u16) -> Result<Response> {
        let key = TcpKey { host: host.into(), port };
        let sw = Stopwatch::start();

        let Some(entry) = self.registry.find(&key) else {
            return Ok(not_connected(sw.elapsed_us()));
        };
        let mut conn = entry.lock().await;
        if !conn.connected {
            return Ok(not_connected(sw.elapsed_us()));
        }

        let mut resp = Response::new(Protocol::Tcp);
        let mut buf = vec![0u8; MAX_BODY_LEN];
        let stream = conn.stream.as_mut().expect("connected entry owns its stream");
        let received = timeout(RECEIVE_DEADLINE, stream.read(&mut buf)).await;
        match received {
            Err(_) => {
                resp.status_code = 204;
                resp.success = true;
                resp.trailer = conn.trailer(0, 0);
            }
            Ok(Ok(0)) => {
                conn.connected = false;
                conn.stream = None;
                let err = Error::PeerClosed;
                conn.last_error = err.to_string();
                resp = Response::from_error(Protocol::Tcp, &err, sw.elapsed_us());
            }
            Ok(Ok(n)) => {
                resp.status_code = 200;
                resp.success = true;
                resp.set_body(&String::from_utf8_lossy(&buf[..n]));
                resp.trailer = conn.trailer(0, n as u64);
            }
            Ok(Err(e)) => {
                let err = Error::TransportFailed(format!("receive: {e}"));
                conn.last_error = err.to_string();
                resp = Response::from_error(Protocol::Tcp, &err, sw.elapsed_us());
            }
        }
        resp.response_time_us = sw.elapsed_us();
        Ok(resp)
    }

    /// Close the connection. Idempotent: closing an absent or already-closed
    /// entry succeeds.
    pub async fn disconnect(&self, host: &str, port: u16) -> Result<Response> {
        let key = TcpKey { host: host.into(), port };
        let sw = Stopwatch::start();

        let mut resp = Response::new(Protocol::Tcp);
        resp.status_code = 200;
        resp.success = true;

        if let Some(entry) = self.registry.find(&key) {
            let mut conn = entry.lock().await;
            if conn.connected {
                conn.stream = None;
                conn.connected = false;
                resp.body = format!("TCP connection to {host}:{port} closed");
            } else {
                resp.body = format!("TCP connection to {host}:{port} already closed");
            }
        } else {
            resp.body = format!("no TCP connection for {host}:{port}");
        }
        resp.response_time_us = sw.elapsed_us();
        Ok(resp)
    }

    pub fn teardown(&self) {
        self.registry.clear();
    }
}

impl Default for TcpAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpConn {
    fn trailer(&self, bytes_sent: u64, bytes_received: u64) -> Trailer {
        Trailer::Tcp {
            socket_id: self.socket_id,
            bytes_sent,
            bytes_received,
            connect_time_us: self.connect_time_us,
        }
    }
}

fn not_connected(elapsed_us: u64) -> Response {
    Response::from_error(
        Protocol::Tcp,
        &Error::NotConnected("no active TCP connection".into()),
        elapsed_us,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_send_receive_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            sock.write_all(&buf[..n]).await.unwrap();
        });

        let adapter = TcpAdapter::new();
        let resp = adapter.connect("127.0.0.1", port).await.unwrap();
        assert!(resp.success, "{}", resp.error);
        assert!(matches!(resp.trailer, Trailer::Tcp { connect_time_us, .. } if connect_time_us > 0));

        let resp = adapter.send("127.0.0.1", port, "ping").await.unwrap();
        assert!(resp.success);
        assert!(matches!(resp.trailer, Trailer::Tcp { bytes_sent: 4, .. }));

        let resp = adapter.receive("127.0.0.1", port).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.body, "ping");
    }

    #[tokio::test]
    async fn test_receive_idle_returns_204() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let adapter = TcpAdapter::new();
        adapter.connect("127.0.0.1", port).await.unwrap();
        let resp = adapter.receive("127.0.0.1", port).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.status_code, 204);
        assert_eq!(resp.body, "");
    }

    #[tokio::test]
    async fn test_receive_after_peer_close_returns_410() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            drop(sock);
        });

        let adapter = TcpAdapter::new();
        adapter.connect("127.0.0.1", port).await.unwrap();
        // Give the peer a moment to close.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let resp = adapter.receive("127.0.0.1", port).await.unwrap();
        assert!(!resp.success);
        assert_eq!(resp.status_code, 410);

        // The entry is now disconnected.
        let resp = adapter.send("127.0.0.1", port, "x").await.unwrap();
        assert_eq!(resp.status_code, 400);
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let adapter = TcpAdapter::new();
        let resp = adapter.send("127.0.0.1", 9, "x").await.unwrap();
        assert!(!resp.success);
        assert_eq!(resp.status_code, 400);
    }

    #[tokio::test]
    async fn test_disconnect_idempotent() {
        let adapter = TcpAdapter::new();
        let resp = adapter.disconnect("127.0.0.1", 9).await.unwrap();
        assert!(resp.success);
        let resp = adapter.disconnect("127.0.0.1", 9).await.unwrap();
        assert!(resp.success);
    }
}
