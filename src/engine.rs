//! The load-execution engine.
//!
//! [`Engine`] owns the protocol adapters, their connection registries, the
//! metrics aggregator, the session manager and the authentication registry.
//! Registries are engine-scoped, not process-wide: tests and embedders get
//! fresh state per instance.
//!
//! Every attempted operation, whether dispatched through [`Engine::execute`]
//! or one of the explicit per-protocol methods, credits the metrics
//! aggregator exactly once. Operations that cannot be attempted at all
//! (invalid input, registry capacity) return `Err` and are not credited.

use std::sync::Arc;

use crate::adapter::{DbAdapter, DbDriver, HttpAdapter, MqttAdapter, TcpAdapter, UdpAdapter, WsAdapter};
use crate::auth::AuthManager;
use crate::error::{Error, Result};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::request::{MqttQos, Payload, Protocol, Request};
use crate::response::Response;
use crate::scenario::{Scenario, ScenarioReport, StepReport};
use crate::session::SessionManager;
use crate::{adapter, assertion};

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Sizes the HTTP connection pool and the worker-pool request queue
    /// (`2 × max_connections`). Per-protocol registry caps still apply.
    pub max_connections: usize,
    /// Number of workers in the open-loop pool; also the divisor for the
    /// per-worker throughput accounting in [`MetricsSnapshot`].
    pub worker_count: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_connections: 1_000, worker_count: 10 }
    }
}

pub struct Engine {
    config: EngineConfig,
    metrics: Metrics,
    sessions: SessionManager,
    auth: AuthManager,
    http: HttpAdapter,
    ws: WsAdapter,
    tcp: TcpAdapter,
    udp: UdpAdapter,
    mqtt: MqttAdapter,
    db: DbAdapter,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        Ok(Self {
            config,
            metrics: Metrics::new(),
            sessions: SessionManager::new(),
            auth: AuthManager::new(),
            http: HttpAdapter::new(config.max_connections)?,
            ws: WsAdapter::new(),
            tcp: TcpAdapter::new(),
            udp: UdpAdapter::new(),
            mqtt: MqttAdapter::new(),
            db: DbAdapter::new(),
        })
    }

    /// Swap the database back-end for a real driver behind the same contract.
    pub fn with_db_driver(mut self, driver: Arc<dyn DbDriver>) -> Self {
        self.db = DbAdapter::with_driver(driver);
        self
    }

    pub fn config(&self) -> EngineConfig {
        self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.config.worker_count)
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    fn credit(&self, response: &Response) {
        self.metrics.record(response.response_time_us, response.success);
    }

    /// Execute one request, routing by URL scheme.
    ///
    /// Non-HTTP protocols key the operation off `Request::method`:
    /// `CONNECT`, `RECEIVE` and `CLOSE` select the corresponding adapter
    /// operation, anything else sends the request body. MQTT never routes
    /// through here; use the explicit `mqtt_*` methods.
    pub async fn execute(&self, request: &Request) -> Result<Response> {
        request.validate()?;
        let response = match Protocol::detect(&request.url) {
            Protocol::Http => self.http.execute(request).await?,
            Protocol::WebSocket => self.execute_ws(request).await?,
            Protocol::Tcp => self.execute_tcp(request).await?,
            Protocol::Udp => self.execute_udp(request).await?,
            Protocol::Database => self.execute_db(request).await?,
            Protocol::Grpc => {
                return Err(Error::InvalidArgument("gRPC dispatch is reserved".into()));
            }
            Protocol::Mqtt => {
                return Err(Error::InvalidArgument(
                    "MQTT is dispatched by explicit method, not URL scheme".into(),
                ));
            }
        };
        self.credit(&response);
        Ok(response)
    }

    async fn execute_ws(&self, request: &Request) -> Result<Response> {
        let subprotocol = match &request.payload {
            Payload::WebSocket(ws) => ws.subprotocol.clone(),
            _ => String::new(),
        };
        match request.method.as_str() {
            "CONNECT" => self.ws.connect(&request.url, &subprotocol).await,
            "CLOSE" => self.ws.close(&request.url).await,
            _ => self.ws.send(&request.url, &request.body).await,
        }
    }

    async fn execute_tcp(&self, request: &Request) -> Result<Response> {
        let (host, port) = endpoint_from_url(&request.url, adapter::tcp::DEFAULT_PORT)?;
        match request.method.as_str() {
            "CONNECT" => self.tcp.connect(&host, port).await,
            "RECEIVE" => self.tcp.receive(&host, port).await,
            "CLOSE" => self.tcp.disconnect(&host, port).await,
            _ => self.tcp.send(&host, port, &request.body).await,
        }
    }

    async fn execute_udp(&self, request: &Request) -> Result<Response> {
        let (host, port) = endpoint_from_url(&request.url, adapter::udp::DEFAULT_PORT)?;
        match request.method.as_str() {
            "CONNECT" => self.udp.create_endpoint(&host, port).await,
            "RECEIVE" => self.udp.receive(&host, port).await,
            "CLOSE" => self.udp.close(&host, port).await,
            _ => self.udp.send(&host, port, &request.body).await,
        }
    }

    async fn execute_db(&self, request: &Request) -> Result<Response> {
        let (connection_string, query) = match &request.payload {
            Payload::Database(db) => {
                let cs = if db.connection_string.is_empty() {
                    request.url.clone()
                } else {
                    db.connection_string.clone()
                };
                let q = if db.query.is_empty() { request.body.clone() } else { db.query.clone() };
                (cs, q)
            }
            _ => (request.url.clone(), request.body.clone()),
        };
        match request.method.as_str() {
            "CONNECT" => self.db.connect(&connection_string).await,
            "CLOSE" => self.db.disconnect(&connection_string).await,
            _ => self.db.query(&connection_string, &query).await,
        }
    }

    // ---- WebSocket ----

    pub async fn ws_connect(&self, url: &str, subprotocol: &str) -> Result<Response> {
        let response = self.ws.connect(url, subprotocol).await?;
        self.credit(&response);
        Ok(response)
    }

    pub async fn ws_send(&self, url: &str, message: &str) -> Result<Response> {
        let response = self.ws.send(url, message).await?;
        self.credit(&response);
        Ok(response)
    }

    pub async fn ws_close(&self, url: &str) -> Result<Response> {
        let response = self.ws.close(url).await?;
        self.credit(&response);
        Ok(response)
    }

    // ---- TCP ----

    pub async fn tcp_connect(&self, host: &str, port: u16) -> Result<Response> {
        let response = self.tcp.connect(host, port).await?;
        self.credit(&response);
        Ok(response)
    }

    pub async fn tcp_send(&self, host: &str, port: u16, data: &str) -> Result<Response> {
        let response = self.tcp.send(host, port, data).await?;
        self.credit(&response);
        Ok(response)
    }

    pub async fn tcp_receive(&self, host: &str, port: u16) -> Result<Response> {
        let response = self.tcp.receive(host, port).await?;
        self.credit(&response);
        Ok(response)
    }

    pub async fn tcp_disconnect(&self, host: &str, port: u16) -> Result<Response> {
        let response = self.tcp.disconnect(host, port).await?;
        self.credit(&response);
        Ok(response)
    }

    // ---- UDP ----

    pub async fn udp_create_endpoint(&self, host: &str, port: u16) -> Result<Response> {
        let response = self.udp.create_endpoint(host, port).await?;
        self.credit(&response);
        Ok(response)
    }

    pub async fn udp_send(&self, host: &str, port: u16, data: &str) -> Result<Response> {
        let response = self.udp.send(host, port, data).await?;
        self.credit(&response);
        Ok(response)
    }

    pub async fn udp_receive(&self, host: &str, port: u16) -> Result<Response> {
        let response = self.udp.receive(host, port).await?;
        self.credit(&response);
        Ok(response)
    }

    pub async fn udp_close(&self, host: &str, port: u16) -> Result<Response> {
        let response = self.udp.close(host, port).await?;
        self.credit(&response);
        Ok(response)
    }

    // ---- MQTT ----

    #[allow(clippy::too_many_arguments)]
    pub async fn mqtt_connect(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        username: Option<&str>,
        password: Option<&str>,
        keep_alive: std::time::Duration,
    ) -> Result<Response> {
        let response =
            self.mqtt.connect(host, port, client_id, username, password, keep_alive).await?;
        self.credit(&response);
        Ok(response)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn mqtt_publish(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        topic: &str,
        payload: &str,
        qos: MqttQos,
        retain: bool,
    ) -> Result<Response> {
        let response =
            self.mqtt.publish(host, port, client_id, topic, payload, qos, retain).await?;
        self.credit(&response);
        Ok(response)
    }

    pub async fn mqtt_subscribe(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        topic: &str,
        qos: MqttQos,
    ) -> Result<Response> {
        let response = self.mqtt.subscribe(host, port, client_id, topic, qos).await?;
        self.credit(&response);
        Ok(response)
    }

    pub async fn mqtt_unsubscribe(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        topic: &str,
    ) -> Result<Response> {
        let response = self.mqtt.unsubscribe(host, port, client_id, topic).await?;
        self.credit(&response);
        Ok(response)
    }

    pub async fn mqtt_disconnect(&self, host: &str, port: u16, client_id: &str) -> Result<Response> {
        let response = self.mqtt.disconnect(host, port, client_id).await?;
        self.credit(&response);
        Ok(response)
    }

    // ---- Database ----

    pub async fn db_connect(&self, connection_string: &str) -> Result<Response> {
        let response = self.db.connect(connection_string).await?;
        self.credit(&response);
        Ok(response)
    }

    pub async fn db_query(&self, connection_string: &str, query: &str) -> Result<Response> {
        let response = self.db.query(connection_string, query).await?;
        self.credit(&response);
        Ok(response)
    }

    pub async fn db_disconnect(&self, connection_string: &str) -> Result<Response> {
        let response = self.db.disconnect(connection_string).await?;
        self.credit(&response);
        Ok(response)
    }

    // ---- Closed-loop scenario execution ----

    /// Walk a scenario synchronously for one virtual user: substitute session
    /// variables into each step, execute it, fold cookies and extracted
    /// values back into the session, and run the step's validators.
    ///
    /// Validator failures are collected in the report, never fatal; a step
    /// whose operation cannot be attempted at all aborts the run with `Err`.
    pub async fn run_scenario(&self, user_id: &str, scenario: &Scenario) -> Result<ScenarioReport> {
        let mut report = ScenarioReport { name: scenario.name.clone(), ..Default::default() };
        let session = self.sessions.session(user_id);

        for step in &scenario.steps {
            let mut request = step.request.clone();
            request.url = session.substitute(&request.url);
            request.body = session.substitute(&request.body);
            request.headers = session.substitute(&request.headers);
            request.headers = session.prepare_request_headers(&request.headers);

            let response = self.execute(&request).await?;
            self.sessions.auto_handle_cookies(user_id, &response);
            self.sessions.process_response(user_id, &response, &step.extract_rules);

            let (passed, failures) = assertion::run_assertions(&response, &step.assertions, false);
            if !passed {
                tracing::debug!(
                    scenario = %scenario.name,
                    user_id,
                    failures = failures.len(),
                    "step validators failed"
                );
            }
            report.steps.push(StepReport { response, passed, failures });
        }
        Ok(report)
    }

    /// Drop every pooled connection and session. Entries own their transport
    /// handles, so clearing the registries releases them.
    pub fn teardown(&self) {
        self.ws.teardown();
        self.tcp.teardown();
        self.udp.teardown();
        self.mqtt.teardown();
        self.db.teardown();
        self.sessions.clear_all();
    }
}

/// Split `scheme://host[:port]` into host and port.
fn endpoint_from_url(url: &str, default_port: u16) -> Result<(String, u16)> {
    let rest = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .ok_or_else(|| Error::InvalidArgument(format!("missing scheme in {url:?}")))?;
    let rest = rest.split(['/', '?']).next().unwrap_or(rest);
    if rest.is_empty() {
        return Err(Error::InvalidArgument(format!("missing host in {url:?}")));
    }
    match rest.split_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| Error::InvalidArgument(format!("invalid port in {url:?}")))?;
            Ok((host.to_owned(), port))
        }
        None => Ok((rest.to_owned(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_from_url() {
        assert_eq!(endpoint_from_url("tcp://h:9000", 80).unwrap(), ("h".into(), 9000));
        assert_eq!(endpoint_from_url("tcp://h", 80).unwrap(), ("h".into(), 80));
        assert_eq!(endpoint_from_url("udp://h:53/x", 53).unwrap(), ("h".into(), 53));
        assert!(endpoint_from_url("h:9000", 80).is_err());
        assert!(endpoint_from_url("tcp://h:notaport", 80).is_err());
        assert!(endpoint_from_url("tcp://", 80).is_err());
    }

    #[tokio::test]
    async fn test_grpc_dispatch_reserved() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let err = engine.execute(&Request::get("grpc://svc:50051/")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(engine.metrics().total_requests, 0);
    }

    #[tokio::test]
    async fn test_execute_credits_metrics_once() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let req = Request::get("http://127.0.0.1:1/")
            .with_timeout(std::time::Duration::from_millis(300));
        let resp = engine.execute(&req).await.unwrap();
        assert!(!resp.success);

        let snap = engine.metrics();
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.failed_requests, 1);
        assert_eq!(snap.successful_requests, 0);
    }

    #[tokio::test]
    async fn test_invalid_request_not_credited() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        assert!(engine.execute(&Request::get("")).await.is_err());
        assert_eq!(engine.metrics().total_requests, 0);
    }
}
