//! Response records and per-protocol trailers.

use crate::request::{MqttQos, Protocol, MAX_BODY_LEN, MAX_HEADER_LEN};

/// Protocol-specific response data.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Trailer {
    #[default]
    None,
    WebSocket {
        subprotocol: String,
        messages_sent: u64,
        messages_received: u64,
        bytes_sent: u64,
        bytes_received: u64,
    },
    Database {
        rows_affected: u64,
        rows_returned: u64,
        result_set: String,
    },
    Tcp {
        socket_id: u64,
        bytes_sent: u64,
        bytes_received: u64,
        connect_time_us: u64,
    },
    Udp {
        socket_id: u64,
        bytes_sent: u64,
        bytes_received: u64,
        remote_host: String,
        remote_port: u16,
    },
    Mqtt {
        message_published: bool,
        message_received: bool,
        published_count: u64,
        received_count: u64,
        topic: String,
        last_message: String,
        qos: MqttQos,
        retained: bool,
        publish_time_us: u64,
    },
}

/// The outcome of one executed request.
///
/// `headers` and `body` are captured into bounded buffers: an adapter
/// truncates past [`MAX_HEADER_LEN`] / [`MAX_BODY_LEN`] while `success`
/// keeps reflecting transport and status only. `response_time_us` is
/// populated even on failure so failed operations still contribute to
/// latency observations.
#[derive(Debug, Clone)]
pub struct Response {
    pub protocol: Protocol,
    pub status_code: u16,
    pub headers: String,
    pub body: String,
    pub response_time_us: u64,
    pub success: bool,
    pub error: String,
    pub trailer: Trailer,
}

impl Response {
    pub(crate) fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            status_code: 0,
            headers: String::new(),
            body: String::new(),
            response_time_us: 0,
            success: false,
            error: String::new(),
            trailer: Trailer::None,
        }
    }

    /// Build a failed response from an error, keeping the original's
    /// status-code conventions (404 resolve, 408 timeout, 410 peer close,
    /// 400 not connected, 500 otherwise).
    pub(crate) fn from_error(protocol: Protocol, err: &crate::Error, elapsed_us: u64) -> Self {
        let mut resp = Self::new(protocol);
        resp.status_code = err.status_code();
        resp.error = err.to_string();
        resp.response_time_us = elapsed_us;
        resp
    }

    pub(crate) fn set_body(&mut self, body: &str) {
        self.body = truncate_utf8(body, MAX_BODY_LEN).to_owned();
    }

    pub(crate) fn set_headers(&mut self, headers: &str) {
        self.headers = truncate_utf8(headers, MAX_HEADER_LEN).to_owned();
    }

    /// Case-insensitive lookup of a header in the newline-delimited blob.
    /// Returns the first match.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_lookup(&self.headers, name)
    }

    /// All values of a header, for repeated headers such as `Set-Cookie`.
    pub fn header_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers.lines().filter_map(move |line| {
            let (key, value) = line.split_once(':')?;
            key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }

    pub fn response_time_ms(&self) -> f64 {
        self.response_time_us as f64 / 1000.0
    }
}

pub(crate) fn header_lookup<'a>(blob: &'a str, name: &str) -> Option<&'a str> {
    blob.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

/// Truncate to at most `max` bytes without splitting a UTF-8 sequence.
pub(crate) fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_case_insensitive() {
        let mut resp = Response::new(Protocol::Http);
        resp.headers = "Content-Type: text/html\nSet-Cookie: sid=abc\nset-cookie: t=1".into();
        assert_eq!(resp.header("content-type"), Some("text/html"));
        assert_eq!(resp.header("SET-COOKIE"), Some("sid=abc"));
        let all: Vec<_> = resp.header_all("Set-Cookie").collect();
        assert_eq!(all, vec!["sid=abc", "t=1"]);
        assert_eq!(resp.header("X-Missing"), None);
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let s = "aé"; // 'é' is two bytes starting at index 1
        assert_eq!(truncate_utf8(s, 2), "a");
        assert_eq!(truncate_utf8(s, 3), "aé");

        let big = "x".repeat(MAX_BODY_LEN + 100);
        let mut resp = Response::new(Protocol::Http);
        resp.set_body(&big);
        assert_eq!(resp.body.len(), MAX_BODY_LEN);
    }
}
