//! WebSocket adapter.
//!
//! Performs a real RFC 6455 Upgrade handshake and text framing via
//! tokio-tungstenite. One connection context is kept per URL; `send` and
//! `close` require that context to exist.

use std::time::Duration;

use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::clock::Stopwatch;
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::request::Protocol;
use crate::response::{Response, Trailer};

pub const MAX_CONNECTIONS: usize = 1_000;

const CONNECT_DEADLINE: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Default)]
pub struct WsContext {
    stream: Option<WsStream>,
    subprotocol: String,
    messages_sent: u64,
    messages_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
}

impl WsContext {
    fn connected(&self) -> bool {
        self.stream.is_some()
    }

    fn trailer(&self) -> Trailer {
        Trailer::WebSocket {
            subprotocol: self.subprotocol.clone(),
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
        }
    }
}

pub struct WsAdapter {
    registry: Registry<String, WsContext>,
}

impl WsAdapter {
    pub fn new() -> Self {
        Self { registry: Registry::new("websocket", MAX_CONNECTIONS) }
    }

    /// Perform the Upgrade handshake. Idempotent on an already-connected URL.
    /// Status 101 on success.
    pub async fn connect(&self, url: &str, subprotocol: &str) -> Result<Response> {
        if !matches!(Protocol::detect(url), Protocol::WebSocket) {
            return Err(Error::InvalidArgument(format!("not a WebSocket URL: {url:?}")));
        }
        let entry = self.registry.find_or_create(&url.to_string(), WsContext::default)?;
        let mut ctx = entry.lock().await;

        let sw = Stopwatch::start();
        let mut resp = Response::new(Protocol::WebSocket);

        if ctx.connected() {
            resp.status_code = 101;
            resp.success = true;
            resp.body = format!("WebSocket connection already established to {url}");
            resp.response_time_us = sw.elapsed_us();
            resp.trailer = ctx.trailer();
            return Ok(resp);
        }

        match self.handshake(url, subprotocol).await {
            Ok((stream, handshake)) => {
                ctx.stream = Some(stream);
                ctx.subprotocol = handshake
                    .headers()
                    .get("sec-websocket-protocol")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or(subprotocol)
                    .to_owned();
                resp.status_code = handshake.status().as_u16();
                resp.success = true;
                resp.body = format!("WebSocket connection established to {url}");
                let blob = handshake
                    .headers()
                    .iter()
                    .map(|(k, v)| format!("{k}: {}", v.to_str().unwrap_or_default()))
                    .collect::<Vec<_>>()
                    .join("\n");
                resp.set_headers(&blob);
            }
            Err(err) => {
                tracing::debug!(url, %err, "websocket connect failed");
                resp = Response::from_error(Protocol::WebSocket, &err, sw.elapsed_us());
            }
        }
        resp.response_time_us = sw.elapsed_us();
        resp.trailer = ctx.trailer();
        Ok(resp)
    }

    async fn handshake(
        &self,
        url: &str,
        subprotocol: &str,
    ) -> Result<(WsStream, tokio_tungstenite::tungstenite::handshake::client::Response)> {
        let mut request = url
            .into_client_request()
            .map_err(|e| Error::InvalidArgument(format!("invalid WebSocket URL {url:?}: {e}")))?;
        if !subprotocol.is_empty() {
            let value = subprotocol
                .parse()
                .map_err(|_| Error::InvalidArgument(format!("invalid subprotocol {subprotocol:?}")))?;
            request.headers_mut().insert("Sec-WebSocket-Protocol", value);
        }
        timeout(CONNECT_DEADLINE, connect_async(request))
            .await
            .map_err(|_| Error::Timeout(CONNECT_DEADLINE))?
            .map_err(|e| Error::TransportFailed(format!("handshake with {url}: {e}")))
    }

    /// Send one text frame on an established connection. Status 200.
    pub async fn send(&self, url: &str, message: &str) -> Result<Response> {
        let sw = Stopwatch::start();
        let Some(entry) = self.registry.find(&url.to_string()) else {
            return Ok(not_connected(sw.elapsed_us()));
        };
        let mut ctx = entry.lock().await;
        if !ctx.connected() {
            return Ok(not_connected(sw.elapsed_us()));
        }

        let mut resp = Response::new(Protocol::WebSocket);
        let stream = ctx.stream.as_mut().expect("connected context owns its stream");
        let sent = stream.send(Message::Text(message.to_owned())).await;
        match sent {
            Ok(()) => {
                ctx.messages_sent += 1;
                ctx.bytes_sent += message.len() as u64;
                resp.status_code = 200;
                resp.success = true;
                resp.body = format!("sent {} bytes", message.len());
            }
            Err(e) => {
                ctx.stream = None;
                let err = Error::TransportFailed(format!("send frame: {e}"));
                resp = Response::from_error(Protocol::WebSocket, &err, sw.elapsed_us());
            }
        }
        resp.response_time_us = sw.elapsed_us();
        resp.trailer = ctx.trailer();
        Ok(resp)
    }

    /// Close the connection and drop its context. Status 200; closing an
    /// unknown URL fails with the not-connected contract.
    pub async fn close(&self, url: &str) -> Result<Response> {
        let sw = Stopwatch::start();
        let Some(entry) = self.registry.find(&url.to_string()) else {
            return Ok(not_connected(sw.elapsed_us()));
        };
        let mut ctx = entry.lock().await;
        if !ctx.connected() {
            return Ok(not_connected(sw.elapsed_us()));
        }

        if let Some(mut stream) = ctx.stream.take() {
            let _ = stream.close(None).await;
        }
        let trailer = ctx.trailer();
        drop(ctx);
        self.registry.remove(&url.to_string());

        let mut resp = Response::new(Protocol::WebSocket);
        resp.status_code = 200;
        resp.success = true;
        resp.body = format!("WebSocket connection to {url} closed");
        resp.response_time_us = sw.elapsed_us();
        resp.trailer = trailer;
        Ok(resp)
    }

    pub fn teardown(&self) {
        self.registry.clear();
    }
}

impl Default for WsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn not_connected(elapsed_us: u64) -> Response {
    Response::from_error(
        Protocol::WebSocket,
        &Error::NotConnected("WebSocket not connected".into()),
        elapsed_us,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn spawn_ws_echo() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    use futures_util::StreamExt;
                    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    while let Some(Ok(msg)) = ws.next().await {
                        if msg.is_text() && ws.send(msg).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_connect_send_close() {
        let port = spawn_ws_echo().await;
        let url = format!("ws://127.0.0.1:{port}/");

        let adapter = WsAdapter::new();
        let resp = adapter.connect(&url, "").await.unwrap();
        assert!(resp.success, "{}", resp.error);
        assert_eq!(resp.status_code, 101);

        // idempotent reconnect
        let resp = adapter.connect(&url, "").await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.status_code, 101);

        let resp = adapter.send(&url, "hello").await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.status_code, 200);
        assert!(matches!(
            resp.trailer,
            Trailer::WebSocket { messages_sent: 1, bytes_sent: 5, .. }
        ));

        let resp = adapter.close(&url).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.status_code, 200);
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let adapter = WsAdapter::new();
        let resp = adapter.send("ws://127.0.0.1:1/", "x").await.unwrap();
        assert!(!resp.success);
        assert_eq!(resp.status_code, 400);

        let resp = adapter.close("ws://127.0.0.1:1/").await.unwrap();
        assert!(!resp.success);
    }

    #[tokio::test]
    async fn test_connect_rejects_http_url() {
        let adapter = WsAdapter::new();
        assert!(matches!(
            adapter.connect("http://127.0.0.1/", "").await,
            Err(Error::InvalidArgument(_))
        ));
    }
}
