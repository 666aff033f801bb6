//! MQTT 3.1.1 adapter.
//!
//! Frames CONNECT / PUBLISH / SUBSCRIBE / UNSUBSCRIBE / DISCONNECT packets by
//! hand over a plain TCP stream. Connections are pooled per
//! `(host, port, client id)`, each carrying its own monotonically increasing
//! packet-id counter for QoS > 0.
//!
//! Acknowledgement handling is minimal by design: CONNECT treats any bytes
//! from the broker as a CONNACK; PUBLISH at QoS > 0 is optimistic and does
//! not wait for PUBACK; SUBSCRIBE and UNSUBSCRIBE are best-effort: the
//! packets are framed and written but SUBACK/UNSUBACK are not parsed.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::clock::Stopwatch;
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::request::{MqttQos, Protocol};
use crate::response::{Response, Trailer};

pub const DEFAULT_PORT: u16 = 1883;
pub const MAX_CONNECTIONS: usize = 50;

const CONNECT_DEADLINE: Duration = Duration::from_secs(5);
const CONNACK_DEADLINE: Duration = Duration::from_secs(5);

/// Largest value representable by the 4-byte remaining-length field.
pub const MAX_REMAINING_LENGTH: u32 = 268_435_455;

const PACKET_CONNECT: u8 = 0x10;
const PACKET_PUBLISH: u8 = 0x30;
const PACKET_SUBSCRIBE: u8 = 0x82;
const PACKET_UNSUBSCRIBE: u8 = 0xA2;
const PACKET_DISCONNECT: u8 = 0xE0;

/// Base-128 remaining-length encoding: 7 value bits per byte, high bit set
/// while more bytes follow. Uses 1-4 bytes.
pub fn encode_remaining_length(mut n: u32, buf: &mut Vec<u8>) -> Result<()> {
    if n > MAX_REMAINING_LENGTH {
        return Err(Error::ProtocolError(format!("remaining length {n} out of range")));
    }
    loop {
        let mut byte = (n % 128) as u8;
        n /= 128;
        if n > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if n == 0 {
            return Ok(());
        }
    }
}

/// Decode a remaining-length field, returning the value and the number of
/// bytes consumed.
pub fn decode_remaining_length(bytes: &[u8]) -> Result<(u32, usize)> {
    let mut value: u32 = 0;
    let mut multiplier: u32 = 1;
    for (i, &byte) in bytes.iter().enumerate() {
        value += (byte & 0x7F) as u32 * multiplier;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        if i == 3 {
            return Err(Error::ProtocolError("remaining length exceeds 4 bytes".into()));
        }
        multiplier *= 128;
    }
    Err(Error::ProtocolError("truncated remaining length".into()))
}

fn push_utf8(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

pub(crate) fn build_connect(
    client_id: &str,
    username: Option<&str>,
    password: Option<&str>,
    keep_alive_s: u16,
) -> Result<Vec<u8>> {
    let username = username.filter(|u| !u.is_empty());
    let password = password.filter(|p| !p.is_empty());

    // Variable header: protocol name + level + flags + keep-alive.
    let mut body = Vec::with_capacity(32 + client_id.len());
    push_utf8(&mut body, "MQTT");
    body.push(0x04);

    let mut flags = 0x02; // clean session, always
    if username.is_some() {
        flags |= 0x80;
    }
    if password.is_some() {
        flags |= 0x40;
    }
    body.push(flags);
    body.extend_from_slice(&keep_alive_s.to_be_bytes());

    push_utf8(&mut body, client_id);
    if let Some(u) = username {
        push_utf8(&mut body, u);
    }
    if let Some(p) = password {
        push_utf8(&mut body, p);
    }

    let mut packet = vec![PACKET_CONNECT];
    encode_remaining_length(body.len() as u32, &mut packet)?;
    packet.extend_from_slice(&body);
    Ok(packet)
}

pub(crate) fn build_publish(
    topic: &str,
    payload: &[u8],
    qos: MqttQos,
    retain: bool,
    packet_id: u16,
) -> Result<Vec<u8>> {
    let mut first = PACKET_PUBLISH | (qos.as_u8() << 1);
    if retain {
        first |= 0x01;
    }

    let mut body = Vec::with_capacity(4 + topic.len() + payload.len());
    push_utf8(&mut body, topic);
    if qos.as_u8() > 0 {
        body.extend_from_slice(&packet_id.to_be_bytes());
    }
    body.extend_from_slice(payload);

    let mut packet = vec![first];
    encode_remaining_length(body.len() as u32, &mut packet)?;
    packet.extend_from_slice(&body);
    Ok(packet)
}

pub(crate) fn build_subscribe(packet_id: u16, topic: &str, qos: MqttQos) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(5 + topic.len());
    body.extend_from_slice(&packet_id.to_be_bytes());
    push_utf8(&mut body, topic);
    body.push(qos.as_u8());

    let mut packet = vec![PACKET_SUBSCRIBE];
    encode_remaining_length(body.len() as u32, &mut packet)?;
    packet.extend_from_slice(&body);
    Ok(packet)
}

pub(crate) fn build_unsubscribe(packet_id: u16, topic: &str) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(4 + topic.len());
    body.extend_from_slice(&packet_id.to_be_bytes());
    push_utf8(&mut body, topic);

    let mut packet = vec![PACKET_UNSUBSCRIBE];
    encode_remaining_length(body.len() as u32, &mut packet)?;
    packet.extend_from_slice(&body);
    Ok(packet)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MqttKey {
    pub host: String,
    pub port: u16,
    pub client_id: String,
}

#[derive(Default)]
pub struct MqttConn {
    stream: Option<TcpStream>,
    state: State,
    /// Monotonic per-connection counter, consumed for QoS > 0 publishes.
    packet_id: u16,
    published_count: u64,
    last_error: String,
}

impl MqttConn {
    fn next_packet_id(&mut self) -> u16 {
        self.packet_id = self.packet_id.wrapping_add(1).max(1);
        self.packet_id
    }

    fn fail(&mut self, err: &Error) {
        self.state = State::Disconnected;
        self.stream = None;
        self.last_error = err.to_string();
    }
}

pub struct MqttAdapter {
    registry: Registry<MqttKey, MqttConn>,
}

impl MqttAdapter {
    pub fn new() -> Self {
        Self { registry: Registry::new("mqtt", MAX_CONNECTIONS) }
    }

    /// Open (or reuse) a broker connection and perform the CONNECT exchange.
    /// Any bytes received back are treated as the CONNACK.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        username: Option<&str>,
        password: Option<&str>,
        keep_alive: Duration,
    ) -> Result<Response> {
        if host.is_empty() || client_id.is_empty() {
            return Err(Error::InvalidArgument("MQTT host and client id are mandatory".into()));
        }
        let key = MqttKey { host: host.into(), port, client_id: client_id.into() };
        let entry = self.registry.find_or_create(&key, MqttConn::default)?;
        let mut conn = entry.lock().await;

        let sw = Stopwatch::start();
        let mut resp = Response::new(Protocol::Mqtt);

        if conn.state == State::Connected {
            resp.status_code = 200;
            resp.success = true;
            resp.body = format!("MQTT connection already established to {host}:{port} ({client_id})");
            resp.response_time_us = sw.elapsed_us();
            return Ok(resp);
        }

        conn.state = State::Connecting;
        match self.handshake(host, port, client_id, username, password, keep_alive).await {
            Ok(stream) => {
                conn.stream = Some(stream);
                conn.state = State::Connected;
                conn.last_error.clear();
                resp.status_code = 200;
                resp.success = true;
                resp.body = format!("MQTT connection established to {host}:{port} ({client_id})");
            }
            Err(err) => {
                tracing::debug!(host, port, client_id, %err, "mqtt connect failed");
                conn.fail(&err);
                resp = Response::from_error(Protocol::Mqtt, &err, sw.elapsed_us());
            }
        }
        resp.response_time_us = sw.elapsed_us();
        resp.trailer = Trailer::Mqtt {
            message_published: false,
            message_received: false,
            published_count: conn.published_count,
            received_count: 0,
            topic: String::new(),
            last_message: String::new(),
            qos: MqttQos::AtMostOnce,
            retained: false,
            publish_time_us: 0,
        };
        Ok(resp)
    }

    async fn handshake(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        username: Option<&str>,
        password: Option<&str>,
        keep_alive: Duration,
    ) -> Result<TcpStream> {
        let mut stream = timeout(CONNECT_DEADLINE, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::Timeout(CONNECT_DEADLINE))?
            .map_err(|e| Error::TransportFailed(format!("connect to {host}:{port}: {e}")))?;

        let keep_alive_s = keep_alive.as_secs().min(u16::MAX as u64) as u16;
        let packet = build_connect(client_id, username, password, keep_alive_s)?;
        stream
            .write_all(&packet)
            .await
            .map_err(|e| Error::TransportFailed(format!("send CONNECT: {e}")))?;

        let mut connack = [0u8; 4];
        let n = timeout(CONNACK_DEADLINE, stream.read(&mut connack))
            .await
            .map_err(|_| Error::Timeout(CONNACK_DEADLINE))?
            .map_err(|e| Error::TransportFailed(format!("receive CONNACK: {e}")))?;
        if n == 0 {
            return Err(Error::PeerClosed);
        }
        Ok(stream)
    }

    /// Publish one message. At QoS > 0 a packet id is stamped from the
    /// connection's counter but success is reported without waiting for the
    /// PUBACK.
    pub async fn publish(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        topic: &str,
        payload: &str,
        qos: MqttQos,
        retain: bool,
    ) -> Result<Response> {
        if topic.is_empty() {
            return Err(Error::InvalidArgument("MQTT topic is mandatory".into()));
        }
        let key = MqttKey { host: host.into(), port, client_id: client_id.into() };
        let sw = Stopwatch::start();

        let Some(entry) = self.registry.find(&key) else {
            return Ok(not_connected(sw.elapsed_us()));
        };
        let mut conn = entry.lock().await;
        if conn.state != State::Connected {
            return Ok(not_connected(sw.elapsed_us()));
        }

        let packet_id = if qos.as_u8() > 0 { conn.next_packet_id() } else { 0 };
        let packet = build_publish(topic, payload.as_bytes(), qos, retain, packet_id)?;

        let mut resp = Response::new(Protocol::Mqtt);
        let stream = conn.stream.as_mut().expect("connected entry owns its stream");
        let written = stream.write_all(&packet).await;
        match written {
            Ok(()) => {
                conn.published_count += 1;
                resp.status_code = 200;
                resp.success = true;
                resp.body = format!(
                    "published {} bytes to '{topic}' (qos {}, retain {retain})",
                    payload.len(),
                    qos.as_u8()
                );
            }
            Err(e) => {
                let err = Error::TransportFailed(format!("send PUBLISH: {e}"));
                conn.fail(&err);
                resp = Response::from_error(Protocol::Mqtt, &err, sw.elapsed_us());
            }
        }
        resp.response_time_us = sw.elapsed_us();
        resp.trailer = Trailer::Mqtt {
            message_published: resp.success,
            message_received: false,
            published_count: conn.published_count,
            received_count: 0,
            topic: topic.into(),
            last_message: payload.into(),
            qos,
            retained: retain,
            publish_time_us: resp.response_time_us,
        };
        Ok(resp)
    }

    /// Best-effort subscription: the SUBSCRIBE packet is written but the
    /// SUBACK is not awaited.
    pub async fn subscribe(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        topic: &str,
        qos: MqttQos,
    ) -> Result<Response> {
        self.subscription_op(host, port, client_id, topic, Some(qos)).await
    }

    /// Best-effort unsubscription, mirroring [`subscribe`](Self::subscribe).
    pub async fn unsubscribe(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        topic: &str,
    ) -> Result<Response> {
        self.subscription_op(host, port, client_id, topic, None).await
    }

    async fn subscription_op(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        topic: &str,
        qos: Option<MqttQos>,
    ) -> Result<Response> {
        if topic.is_empty() {
            return Err(Error::InvalidArgument("MQTT topic is mandatory".into()));
        }
        let key = MqttKey { host: host.into(), port, client_id: client_id.into() };
        let sw = Stopwatch::start();

        let Some(entry) = self.registry.find(&key) else {
            return Ok(not_connected(sw.elapsed_us()));
        };
        let mut conn = entry.lock().await;
        if conn.state != State::Connected {
            return Ok(not_connected(sw.elapsed_us()));
        }

        let packet_id = conn.next_packet_id();
        let (packet, verb) = match qos {
            Some(qos) => (build_subscribe(packet_id, topic, qos)?, "subscribed to"),
            None => (build_unsubscribe(packet_id, topic)?, "unsubscribed from"),
        };

        let mut resp = Response::new(Protocol::Mqtt);
        let stream = conn.stream.as_mut().expect("connected entry owns its stream");
        let written = stream.write_all(&packet).await;
        match written {
            Ok(()) => {
                resp.status_code = 200;
                resp.success = true;
                resp.body = format!("{verb} '{topic}'");
                resp.trailer = Trailer::Mqtt {
                    message_published: false,
                    message_received: false,
                    published_count: conn.published_count,
                    received_count: 0,
                    topic: topic.into(),
                    last_message: String::new(),
                    qos: qos.unwrap_or_default(),
                    retained: false,
                    publish_time_us: 0,
                };
            }
            Err(e) => {
                let err = Error::TransportFailed(format!("send packet: {e}"));
                conn.fail(&err);
                resp = Response::from_error(Protocol::Mqtt, &err, sw.elapsed_us());
            }
        }
        resp.response_time_us = sw.elapsed_us();
        Ok(resp)
    }

    /// Send DISCONNECT (`0xE0 0x00`) and release the socket. The entry stays
    /// registered so the same key can reconnect.
    pub async fn disconnect(&self, host: &str, port: u16, client_id: &str) -> Result<Response> {
        let key = MqttKey { host: host.into(), port, client_id: client_id.into() };
        let sw = Stopwatch::start();

        let Some(entry) = self.registry.find(&key) else {
            return Ok(not_connected(sw.elapsed_us()));
        };
        let mut conn = entry.lock().await;
        if conn.state != State::Connected {
            return Ok(not_connected(sw.elapsed_us()));
        }

        conn.state = State::Disconnecting;
        if let Some(mut stream) = conn.stream.take() {
            // Losing the DISCONNECT on a dead socket is fine; dropping the
            // stream is what releases the handle.
            let _ = stream.write_all(&[PACKET_DISCONNECT, 0x00]).await;
        }
        conn.state = State::Disconnected;

        let mut resp = Response::new(Protocol::Mqtt);
        resp.status_code = 200;
        resp.success = true;
        resp.body = format!("MQTT connection to {host}:{port} closed");
        resp.response_time_us = sw.elapsed_us();
        Ok(resp)
    }

    pub fn teardown(&self) {
        self.registry.clear();
    }
}

impl Default for MqttAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn not_connected(elapsed_us: u64) -> Response {
    Response::from_error(
        Protocol::Mqtt,
        &Error::NotConnected("no active MQTT connection".into()),
        elapsed_us,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(n: u32) -> (u32, usize) {
        let mut buf = Vec::new();
        encode_remaining_length(n, &mut buf).unwrap();
        let (decoded, used) = decode_remaining_length(&buf).unwrap();
        assert_eq!(used, buf.len());
        (decoded, used)
    }

    #[test]
    fn test_remaining_length_roundtrip_boundaries() {
        for (n, expected_len) in [
            (0u32, 1usize),
            (1, 1),
            (127, 1),
            (128, 2),
            (16_383, 2),
            (16_384, 3),
            (2_097_151, 3),
            (2_097_152, 4),
            (MAX_REMAINING_LENGTH, 4),
        ] {
            let (decoded, used) = roundtrip(n);
            assert_eq!(decoded, n);
            assert_eq!(used, expected_len, "length of encoding for {n}");
        }
    }

    #[test]
    fn test_remaining_length_continuation_bits() {
        let mut buf = Vec::new();
        encode_remaining_length(321, &mut buf).unwrap();
        // 321 = 2*128 + 65 -> [0x41 | 0x80, 0x02]
        assert_eq!(buf, vec![0xC1, 0x02]);
    }

    #[test]
    fn test_remaining_length_rejects_out_of_range() {
        let mut buf = Vec::new();
        assert!(encode_remaining_length(MAX_REMAINING_LENGTH + 1, &mut buf).is_err());
        assert!(decode_remaining_length(&[0x80, 0x80, 0x80, 0x80, 0x01]).is_err());
        assert!(decode_remaining_length(&[0x80]).is_err());
    }

    #[test]
    fn test_connect_packet_layout() {
        let packet = build_connect("t1", None, None, 60).unwrap();
        assert_eq!(packet[0], 0x10);
        // remaining length: 10 (variable header) + 2 + len("t1")
        assert_eq!(packet[1], 14);
        // protocol name "MQTT"
        assert_eq!(&packet[2..8], &[0x00, 0x04, b'M', b'Q', b'T', b'T']);
        // level 4, clean-session flags, keep-alive 60
        assert_eq!(&packet[8..12], &[0x04, 0x02, 0x00, 0x3C]);
        // client id
        assert_eq!(&packet[12..], &[0x00, 0x02, b't', b'1']);
    }

    #[test]
    fn test_connect_packet_credential_flags() {
        let packet = build_connect("c", Some("user"), Some("pw"), 30).unwrap();
        assert_eq!(packet[9], 0x02 | 0x80 | 0x40);
        let no_pass = build_connect("c", Some("user"), None, 30).unwrap();
        assert_eq!(no_pass[9], 0x02 | 0x80);
    }

    #[test]
    fn test_publish_packet_qos1_exact_bytes() {
        let packet = build_publish("x/y", b"hi", MqttQos::AtLeastOnce, false, 1).unwrap();
        assert_eq!(
            packet,
            vec![0x32, 9, 0x00, 0x03, b'x', b'/', b'y', 0x00, 0x01, 0x68, 0x69]
        );
    }

    #[test]
    fn test_publish_packet_qos0_retain() {
        let packet = build_publish("t", b"m", MqttQos::AtMostOnce, true, 99).unwrap();
        // retain bit set, no packet id at qos 0
        assert_eq!(packet, vec![0x31, 4, 0x00, 0x01, b't', b'm']);
    }

    #[test]
    fn test_packet_id_counter_skips_zero() {
        let mut conn = MqttConn { packet_id: u16::MAX, ..Default::default() };
        assert_eq!(conn.next_packet_id(), 1);
        assert_eq!(conn.next_packet_id(), 2);
    }

    #[tokio::test]
    async fn test_publish_without_connection() {
        let adapter = MqttAdapter::new();
        let resp = adapter
            .publish("broker.test", 1883, "c1", "t", "m", MqttQos::AtMostOnce, false)
            .await
            .unwrap();
        assert!(!resp.success);
        assert_eq!(resp.status_code, 400);
        assert!(resp.error.contains("not connected"));
    }
}
