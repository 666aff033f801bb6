//! Request descriptors and protocol detection.
//!
//! A [`Request`] is a value type: it owns every field and carries no
//! references into the scenario that produced it. Field sizes are bounded by
//! the `MAX_*` constants; [`Request::validate`] enforces them before any
//! adapter is touched.

use std::time::Duration;

use crate::error::{Error, Result};

/// Maximum URL length accepted in a descriptor.
pub const MAX_URL_LEN: usize = 2 * 1024;
/// Maximum size of the newline-separated header blob.
pub const MAX_HEADER_LEN: usize = 8 * 1024;
/// Maximum request/response body size. Larger response bodies are truncated.
pub const MAX_BODY_LEN: usize = 64 * 1024;
/// Maximum size of the protocol-specific payload blob.
pub const MAX_PROTOCOL_LEN: usize = 32 * 1024;

/// Wire protocol a request or response belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    WebSocket,
    Database,
    Grpc,
    Tcp,
    Udp,
    Mqtt,
}

impl Protocol {
    /// Detect the protocol from a URL scheme prefix, case-insensitively.
    ///
    /// Unrecognised schemes (and scheme-less strings) fall back to HTTP.
    /// MQTT is never detected from a URL: it is dispatched by explicit
    /// engine methods only.
    pub fn detect(url: &str) -> Protocol {
        let lower = url.get(..url.len().min(16)).unwrap_or_default().to_ascii_lowercase();
        let starts = |p: &str| lower.starts_with(p);
        if starts("ws://") || starts("wss://") {
            Protocol::WebSocket
        } else if starts("mysql://")
            || starts("postgresql://")
            || starts("postgres://")
            || starts("mongodb://")
            || starts("mongo://")
        {
            Protocol::Database
        } else if starts("grpc://") || starts("grpcs://") {
            Protocol::Grpc
        } else if starts("tcp://") {
            Protocol::Tcp
        } else if starts("udp://") {
            Protocol::Udp
        } else {
            Protocol::Http
        }
    }
}

/// MQTT quality-of-service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Default)]
pub enum MqttQos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl MqttQos {
    pub fn as_u8(self) -> u8 {
        match self {
            MqttQos::AtMostOnce => 0,
            MqttQos::AtLeastOnce => 1,
            MqttQos::ExactlyOnce => 2,
        }
    }
}

/// Protocol-specific request options.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    None,
    WebSocket(WsOptions),
    Database(DbOptions),
    Mqtt(MqttOptions),
}

#[derive(Debug, Clone, Default)]
pub struct WsOptions {
    pub subprotocol: String,
    pub ping_interval: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct DbOptions {
    pub connection_string: String,
    pub query: String,
    pub driver: String,
}

#[derive(Debug, Clone)]
pub struct MqttOptions {
    pub client_id: String,
    pub topic: String,
    pub payload: String,
    pub qos: MqttQos,
    pub retain: bool,
    pub keep_alive: Duration,
}

impl Default for MqttOptions {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            topic: String::new(),
            payload: String::new(),
            qos: MqttQos::AtMostOnce,
            retain: false,
            keep_alive: Duration::from_secs(60),
        }
    }
}

/// A single request descriptor.
///
/// `headers` is a newline-separated `Name: value` blob, the stable ingress
/// form used across the engine.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub url: String,
    pub headers: String,
    pub body: String,
    pub timeout: Duration,
    pub payload: Payload,
}

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

impl Request {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            url: url.into(),
            headers: String::new(),
            body: String::new(),
            timeout: DEFAULT_TIMEOUT,
            payload: Payload::None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new("POST", url).with_body(body)
    }

    pub fn put(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new("PUT", url).with_body(body)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new("DELETE", url)
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Append one `Name: value` line to the header blob.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if !self.headers.is_empty() {
            self.headers.push('\n');
        }
        self.headers.push_str(name);
        self.headers.push_str(": ");
        self.headers.push_str(value);
        self
    }

    pub fn with_headers(mut self, headers: impl Into<String>) -> Self {
        self.headers = headers.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn protocol(&self) -> Protocol {
        Protocol::detect(&self.url)
    }

    /// Enforce the descriptor size bounds and mandatory fields.
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(Error::InvalidArgument("request URL is empty".into()));
        }
        if self.url.len() > MAX_URL_LEN {
            return Err(Error::InvalidArgument(format!(
                "URL length {} exceeds {MAX_URL_LEN}",
                self.url.len()
            )));
        }
        if self.headers.len() > MAX_HEADER_LEN {
            return Err(Error::InvalidArgument(format!(
                "header blob length {} exceeds {MAX_HEADER_LEN}",
                self.headers.len()
            )));
        }
        if self.body.len() > MAX_BODY_LEN {
            return Err(Error::InvalidArgument(format!(
                "body length {} exceeds {MAX_BODY_LEN}",
                self.body.len()
            )));
        }
        let payload_len = match &self.payload {
            Payload::None => 0,
            Payload::WebSocket(ws) => ws.subprotocol.len(),
            Payload::Database(db) => db.connection_string.len() + db.query.len(),
            Payload::Mqtt(m) => m.client_id.len() + m.topic.len() + m.payload.len(),
        };
        if payload_len > MAX_PROTOCOL_LEN {
            return Err(Error::InvalidArgument(format!(
                "protocol payload length {payload_len} exceeds {MAX_PROTOCOL_LEN}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_dispatch_table() {
        for (url, proto) in [
            ("http://x/", Protocol::Http),
            ("https://x/", Protocol::Http),
            ("HTTPS://x/", Protocol::Http),
            ("ws://x/", Protocol::WebSocket),
            ("wss://x/chat", Protocol::WebSocket),
            ("tcp://x:9", Protocol::Tcp),
            ("udp://x:53", Protocol::Udp),
            ("mysql://u@h/db", Protocol::Database),
            ("postgresql://h/db", Protocol::Database),
            ("postgres://h/db", Protocol::Database),
            ("mongodb://h", Protocol::Database),
            ("mongo://h", Protocol::Database),
            ("grpc://h", Protocol::Grpc),
            ("grpcs://h", Protocol::Grpc),
            ("ftp://h", Protocol::Http),
            ("no-scheme-at-all", Protocol::Http),
        ] {
            assert_eq!(Protocol::detect(url), proto, "url: {url}");
        }
    }

    #[test]
    fn test_validate_bounds() {
        assert!(Request::get("http://example.test/").validate().is_ok());
        assert!(Request::get("").validate().is_err());

        let long_url = format!("http://example.test/{}", "a".repeat(MAX_URL_LEN));
        assert!(Request::get(long_url).validate().is_err());

        let big_body = "b".repeat(MAX_BODY_LEN + 1);
        assert!(Request::post("http://example.test/", big_body).validate().is_err());
    }

    #[test]
    fn test_header_builder() {
        let req = Request::get("http://example.test/")
            .with_header("Accept", "application/json")
            .with_header("X-Trace", "1");
        assert_eq!(req.headers, "Accept: application/json\nX-Trace: 1");
    }
}
