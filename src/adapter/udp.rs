//! Raw UDP adapter.
//!
//! Endpoints are pooled per remote `(host, port)`. Sockets are created with
//! `SO_REUSEADDR` and left unbound for sends (the OS assigns a source port on
//! the first datagram). Receiving binds the port best-effort: a bind failure
//! is tolerated because the socket may already be in use for sending.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::clock::Stopwatch;
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::request::{Protocol, MAX_BODY_LEN};
use crate::response::{Response, Trailer};

pub const DEFAULT_PORT: u16 = 53;
pub const MAX_ENDPOINTS: usize = 100;

const RECEIVE_DEADLINE: Duration = Duration::from_secs(1);

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UdpKey {
    pub host: String,
    pub port: u16,
}

pub struct UdpEndpoint {
    socket: Option<UdpSocket>,
    socket_id: u64,
    bound: bool,
}

pub struct UdpAdapter {
    registry: Registry<UdpKey, UdpEndpoint>,
}

impl UdpAdapter {
    pub fn new() -> Self {
        Self { registry: Registry::new("udp", MAX_ENDPOINTS) }
    }

    fn new_socket() -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProtocol::UDP))
            .map_err(|e| Error::TransportFailed(format!("create UDP socket: {e}")))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| Error::TransportFailed(format!("set SO_REUSEADDR: {e}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::TransportFailed(format!("set nonblocking: {e}")))?;
        UdpSocket::from_std(socket.into())
            .map_err(|e| Error::TransportFailed(format!("register UDP socket: {e}")))
    }

    pub async fn create_endpoint(&self, host: &str, port: u16) -> Result<Response> {
        if host.is_empty() || port == 0 {
            return Err(Error::InvalidArgument("UDP host and port are mandatory".into()));
        }
        let key = UdpKey { host: host.into(), port };
        let sw = Stopwatch::start();
        let mut resp = Response::new(Protocol::Udp);

        let entry = self.registry.find_or_create(&key, || UdpEndpoint {
            socket: None,
            socket_id: 0,
            bound: false,
        })?;
        let mut ep = entry.lock().await;

        if ep.socket.is_some() {
            resp.status_code = 200;
            resp.success = true;
            resp.body = format!("UDP endpoint already created for {host}:{port}");
            resp.response_time_us = sw.elapsed_us();
            return Ok(resp);
        }

        match Self::new_socket() {
            Ok(socket) => {
                ep.socket = Some(socket);
                ep.socket_id = NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed);
                resp.status_code = 200;
                resp.success = true;
                resp.body = format!("UDP endpoint created for {host}:{port}");
                resp.trailer = Trailer::Udp {
                    socket_id: ep.socket_id,
                    bytes_sent: 0,
                    bytes_received: 0,
                    remote_host: host.into(),
                    remote_port: port,
                };
            }
            Err(err) => {
                resp = Response::from_error(Protocol::Udp, &err, sw.elapsed_us());
            }
        }
        resp.response_time_us = sw.elapsed_us();
        Ok(resp)
    }

    /// Resolve the destination and send one datagram, creating the endpoint
    /// on the fly when absent.
    pub async fn send(&self, host: &str, port: u16, data: &str) -> Result<Response> {
        if host.is_empty() || port == 0 {
            return Err(Error::InvalidArgument("UDP host and port are mandatory".into()));
        }
        let key = UdpKey { host: host.into(), port };
        let sw = Stopwatch::start();

        let entry = self.registry.find_or_create(&key, || UdpEndpoint {
            socket: None,
            socket_id: 0,
            bound: false,
        })?;
        let mut ep = entry.lock().await;
        if ep.socket.is_none() {
            match Self::new_socket() {
                Ok(socket) => {
                    ep.socket = Some(socket);
                    ep.socket_id = NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    return Ok(Response::from_error(Protocol::Udp, &err, sw.elapsed_us()));
                }
            }
        }

        let mut resp = Response::new(Protocol::Udp);
        let addr = match resolve(host, port).await {
            Ok(addr) => addr,
            Err(err) => {
                return Ok(Response::from_error(Protocol::Udp, &err, sw.elapsed_us()));
            }
        };

        let socket = ep.socket.as_ref().expect("endpoint owns its socket");
        match socket.send_to(data.as_bytes(), addr).await {
            Ok(n) => {
                resp.status_code = 200;
                resp.success = true;
                resp.body = format!("sent {n} bytes to {host}:{port}");
                resp.trailer = Trailer::Udp {
                    socket_id: ep.socket_id,
                    bytes_sent: n as u64,
                    bytes_received: 0,
                    remote_host: host.into(),
                    remote_port: port,
                };
            }
            Err(e) => {
                let err = Error::TransportFailed(format!("send: {e}"));
                resp = Response::from_error(Protocol::Udp, &err, sw.elapsed_us());
            }
        }
        resp.response_time_us = sw.elapsed_us();
        Ok(resp)
    }

    /// Wait up to 1 s for a datagram on the endpoint's port. A timeout is a
    /// normal outcome (status 204).
    pub async fn receive(&self, host: &str, port: u16) -> Result<Response> {
        let key = UdpKey { host: host.into(), port };
        let sw = Stopwatch::start();

        let Some(entry) = self.registry.find(&key) else {
            return Ok(no_endpoint(sw.elapsed_us()));
        };
        let mut ep = entry.lock().await;
        if ep.socket.is_none() {
            return Ok(no_endpoint(sw.elapsed_us()));
        }

        if !ep.bound {
            // Best effort: the socket may already be implicitly bound from a
            // send, in which case this fails and receiving still works.
            let bind_addr: SocketAddr = ([0, 0, 0, 0], port).into();
            let bound = {
                let socket = ep.socket.as_ref().expect("endpoint owns its socket");
                socket2::SockRef::from(socket).bind(&bind_addr.into())
            };
            match bound {
                Ok(()) => ep.bound = true,
                Err(e) => tracing::debug!(port, %e, "udp bind skipped"),
            }
        }

        let mut resp = Response::new(Protocol::Udp);
        let mut buf = vec![0u8; MAX_BODY_LEN];
        let socket = ep.socket.as_ref().expect("endpoint owns its socket");
        match timeout(RECEIVE_DEADLINE, socket.recv_from(&mut buf)).await {
            Err(_) => {
                resp.status_code = 204;
                resp.success = true;
            }
            Ok(Ok((n, sender))) => {
                resp.status_code = 200;
                resp.success = true;
                resp.set_body(&String::from_utf8_lossy(&buf[..n]));
                resp.trailer = Trailer::Udp {
                    socket_id: ep.socket_id,
                    bytes_sent: 0,
                    bytes_received: n as u64,
                    remote_host: sender.ip().to_string(),
                    remote_port: sender.port(),
                };
            }
            Ok(Err(e)) => {
                let err = Error::TransportFailed(format!("receive: {e}"));
                resp = Response::from_error(Protocol::Udp, &err, sw.elapsed_us());
            }
        }
        resp.response_time_us = sw.elapsed_us();
        Ok(resp)
    }

    /// Close the endpoint. Idempotent.
    pub async fn close(&self, host: &str, port: u16) -> Result<Response> {
        let key = UdpKey { host: host.into(), port };
        let sw = Stopwatch::start();

        let mut resp = Response::new(Protocol::Udp);
        resp.status_code = 200;
        resp.success = true;

        if let Some(entry) = self.registry.find(&key) {
            let mut ep = entry.lock().await;
            if ep.socket.take().is_some() {
                ep.bound = false;
                resp.body = format!("UDP endpoint for {host}:{port} closed");
            } else {
                resp.body = format!("UDP endpoint for {host}:{port} already closed");
            }
        } else {
            resp.body = format!("no UDP endpoint for {host}:{port}");
        }
        resp.response_time_us = sw.elapsed_us();
        Ok(resp)
    }

    pub fn teardown(&self) {
        self.registry.clear();
    }
}

impl Default for UdpAdapter {
    fn default() -> Self {
        Self::new()
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::TransportFailed(format!("failed to resolve {host}: {e}")))?;
    addrs
        .next()
        .ok_or_else(|| Error::TransportFailed(format!("failed to resolve {host}: no address")))
}

fn no_endpoint(elapsed_us: u64) -> Response {
    Response::from_error(
        Protocol::Udp,
        &Error::NotConnected("no UDP endpoint available".into()),
        elapsed_us,
    )
}
