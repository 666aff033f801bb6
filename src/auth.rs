//! Authentication flows.
//!
//! Flows configure a virtual user's session with the credential material
//! later emitted by
//! [`prepare_request_headers`](crate::session::SessionStore::prepare_request_headers).
//! They are registered by name on the [`AuthManager`] and share one contract:
//! `authenticate(engine, user_id, params)` returns an [`AuthOutcome`] whose
//! `success` reflects the flow result; transport-level login failures are
//! outcomes, not errors.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::request::Request;

/// Free-form per-call parameters (`username`, `password`, `scope`,
/// `authorization_code`, ...).
pub type AuthParams = HashMap<String, String>;

#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub success: bool,
    pub auth_type: &'static str,
    pub message: String,
    pub token: Option<String>,
}

impl AuthOutcome {
    fn ok(auth_type: &'static str, message: impl Into<String>) -> Self {
        Self { success: true, auth_type, message: message.into(), token: None }
    }

    fn failed(auth_type: &'static str, message: impl Into<String>) -> Self {
        Self { success: false, auth_type, message: message.into(), token: None }
    }
}

#[async_trait]
pub trait AuthFlow: Send + Sync {
    async fn authenticate(
        &self,
        engine: &Engine,
        user_id: &str,
        params: &AuthParams,
    ) -> Result<AuthOutcome>;
}

fn mark_authenticated(engine: &Engine, user_id: &str, auth_type: &str) {
    let session = engine.sessions().session(user_id);
    session.set("authenticated", true);
    session.set("auth_type", auth_type);
}

fn form_encode<'a>(fields: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut ser = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in fields {
        ser.append_pair(k, v);
    }
    ser.finish()
}

fn form_request(url: &str, body: String) -> Request {
    Request::post(url, body).with_header("Content-Type", "application/x-www-form-urlencoded")
}

/// Parse `access_token` (+ optional `expires_in`, `refresh_token`) from a
/// token-endpoint reply.
fn parse_token_response(body: &str) -> Result<(String, Option<i64>, Option<String>)> {
    let json: Value = serde_json::from_str(body)
        .map_err(|e| Error::ProtocolError(format!("token endpoint returned invalid JSON: {e}")))?;
    let access_token = json
        .get("access_token")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::ProtocolError("no access_token in token response".into()))?
        .to_owned();
    let expires_at = json
        .get("expires_in")
        .and_then(Value::as_i64)
        .map(|s| chrono::Utc::now().timestamp() + s);
    let refresh_token = json.get("refresh_token").and_then(Value::as_str).map(str::to_owned);
    Ok((access_token, expires_at, refresh_token))
}

/// HTTP Basic: precomputes the `Authorization: Basic ...` value into the
/// session's `basic` token slot.
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }
}

#[async_trait]
impl AuthFlow for BasicAuth {
    async fn authenticate(&self, engine: &Engine, user_id: &str, _: &AuthParams) -> Result<AuthOutcome> {
        let encoded = BASE64.encode(format!("{}:{}", self.username, self.password));
        let value = format!("Basic {encoded}");
        let session = engine.sessions().session(user_id);
        session.set_token("basic", &value, None);
        session.set("username", self.username.clone());
        mark_authenticated(engine, user_id, "basic");
        Ok(AuthOutcome {
            token: Some(value),
            ..AuthOutcome::ok("basic", "basic authentication configured")
        })
    }
}

/// Bearer token: either a fixed token, or client credentials exchanged at a
/// token endpoint.
#[derive(Default)]
pub struct BearerAuth {
    pub token: String,
    pub token_endpoint: String,
    pub client_id: String,
    pub client_secret: String,
}

impl BearerAuth {
    pub fn direct(token: impl Into<String>) -> Self {
        Self { token: token.into(), ..Default::default() }
    }

    pub fn endpoint(
        token_endpoint: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            token: String::new(),
            token_endpoint: token_endpoint.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    fn store(
        &self,
        engine: &Engine,
        user_id: &str,
        token: &str,
        expires_at: Option<i64>,
    ) -> AuthOutcome {
        engine.sessions().session(user_id).set_token("bearer", token, expires_at);
        mark_authenticated(engine, user_id, "bearer");
        AuthOutcome {
            token: Some(token.to_owned()),
            ..AuthOutcome::ok("bearer", "bearer token configured")
        }
    }

    /// Exchange a refresh token for a fresh access token.
    pub async fn refresh(
        &self,
        engine: &Engine,
        user_id: &str,
        refresh_token: &str,
    ) -> Result<AuthOutcome> {
        if refresh_token.is_empty() {
            return Err(Error::InvalidArgument("no refresh token available".into()));
        }
        let body = form_encode([
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ]);
        let response = engine.execute(&form_request(&self.token_endpoint, body)).await?;
        if !response.success {
            return Ok(AuthOutcome::failed(
                "bearer",
                format!("token refresh failed: {}", response.error),
            ));
        }
        let (token, expires_at, _) = parse_token_response(&response.body)?;
        Ok(self.store(engine, user_id, &token, expires_at))
    }
}

#[async_trait]
impl AuthFlow for BearerAuth {
    async fn authenticate(
        &self,
        engine: &Engine,
        user_id: &str,
        params: &AuthParams,
    ) -> Result<AuthOutcome> {
        if !self.token.is_empty() {
            return Ok(self.store(engine, user_id, &self.token, None));
        }
        if self.token_endpoint.is_empty() {
            return Err(Error::InvalidArgument("no token or token endpoint provided".into()));
        }

        let grant_type = params.get("grant_type").map(String::as_str).unwrap_or("client_credentials");
        let mut fields = vec![
            ("grant_type", grant_type),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        for key in ["username", "password", "scope", "audience"] {
            if let Some(v) = params.get(key) {
                fields.push((key, v.as_str()));
            }
        }

        let response = engine.execute(&form_request(&self.token_endpoint, form_encode(fields))).await?;
        if !response.success {
            return Ok(AuthOutcome::failed(
                "bearer",
                format!("token request failed: {}", response.error),
            ));
        }
        let (token, expires_at, refresh) = parse_token_response(&response.body)?;
        if let Some(refresh) = refresh {
            engine.sessions().session(user_id).set_token("refresh", refresh, None);
        }
        Ok(self.store(engine, user_id, &token, expires_at))
    }
}

/// API key: emitted as a plain header under `header_name`, never as
/// `Authorization`.
pub struct ApiKeyAuth {
    pub api_key: String,
    pub header_name: String,
}

impl ApiKeyAuth {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self { api_key: api_key.into(), header_name: "X-API-Key".into() }
    }

    pub fn with_header(mut self, header_name: impl Into<String>) -> Self {
        self.header_name = header_name.into();
        self
    }
}

#[async_trait]
impl AuthFlow for ApiKeyAuth {
    async fn authenticate(&self, engine: &Engine, user_id: &str, _: &AuthParams) -> Result<AuthOutcome> {
        let session = engine.sessions().session(user_id);
        session.set_token("api_key", &self.api_key, None);
        session.set_api_key_header(&self.header_name);
        mark_authenticated(engine, user_id, "api_key");
        Ok(AuthOutcome::ok("api_key", format!("API key configured under {}", self.header_name)))
    }
}

/// Form login: POSTs credentials to `login_url` and checks the body for a
/// success indicator; session cookies from the reply are auto-handled.
pub struct FormAuth {
    pub login_url: String,
    pub username_field: String,
    pub password_field: String,
    /// Substring the login response body must contain. Empty means a 2xx/3xx
    /// status alone counts as success.
    pub success_indicator: String,
}

impl FormAuth {
    pub fn new(login_url: impl Into<String>) -> Self {
        Self {
            login_url: login_url.into(),
            username_field: "username".into(),
            password_field: "password".into(),
            success_indicator: String::new(),
        }
    }

    pub fn with_fields(mut self, username_field: impl Into<String>, password_field: impl Into<String>) -> Self {
        self.username_field = username_field.into();
        self.password_field = password_field.into();
        self
    }

    pub fn with_success_indicator(mut self, indicator: impl Into<String>) -> Self {
        self.success_indicator = indicator.into();
        self
    }
}

#[async_trait]
impl AuthFlow for FormAuth {
    async fn authenticate(
        &self,
        engine: &Engine,
        user_id: &str,
        params: &AuthParams,
    ) -> Result<AuthOutcome> {
        let username = params.get("username").cloned().unwrap_or_default();
        let password = params.get("password").cloned().unwrap_or_default();
        if username.is_empty() || password.is_empty() {
            return Err(Error::InvalidArgument(
                "username and password are required for form authentication".into(),
            ));
        }

        let mut fields = vec![
            (self.username_field.as_str(), username.as_str()),
            (self.password_field.as_str(), password.as_str()),
        ];
        for (k, v) in params {
            if k != "username" && k != "password" {
                fields.push((k.as_str(), v.as_str()));
            }
        }

        let mut request = form_request(&self.login_url, form_encode(fields));
        request.headers = engine.sessions().prepare_request_headers(user_id, &request.headers);
        let response = engine.execute(&request).await?;
        engine.sessions().auto_handle_cookies(user_id, &response);

        let success = if self.success_indicator.is_empty() {
            response.success
        } else {
            response.success && response.body.contains(&self.success_indicator)
        };
        if success {
            let session = engine.sessions().session(user_id);
            session.set("username", username);
            mark_authenticated(engine, user_id, "form");
            Ok(AuthOutcome::ok("form", "form authentication successful"))
        } else {
            Ok(AuthOutcome::failed(
                "form",
                format!("form authentication failed (status {})", response.status_code),
            ))
        }
    }
}

/// OAuth 2.0 authorization-code flow.
///
/// Advisory for automation: obtaining the code requires a browser step, so
/// the first call (without an `authorization_code` param) only builds the
/// authorization URL, returned in the outcome message and stored under the
/// session key `authorization_url`. The second call, with
/// `authorization_code` set, exchanges it at the token endpoint.
pub struct OAuth2CodeFlow {
    pub auth_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scope: String,
}

#[async_trait]
impl AuthFlow for OAuth2CodeFlow {
    async fn authenticate(
        &self,
        engine: &Engine,
        user_id: &str,
        params: &AuthParams,
    ) -> Result<AuthOutcome> {
        let Some(code) = params.get("authorization_code") else {
            let state: String =
                rand::thread_rng().sample_iter(&Alphanumeric).take(32).map(char::from).collect();
            let query = form_encode(
                [
                    ("response_type", "code"),
                    ("client_id", self.client_id.as_str()),
                    ("redirect_uri", self.redirect_uri.as_str()),
                    ("scope", self.scope.as_str()),
                    ("state", state.as_str()),
                ]
                .into_iter()
                .filter(|(_, v)| !v.is_empty()),
            );
            let authorization_url = format!("{}?{query}", self.auth_url);
            let session = engine.sessions().session(user_id);
            session.set("oauth2_state", state);
            session.set("authorization_url", authorization_url.clone());
            return Ok(AuthOutcome::failed(
                "oauth2",
                format!("authorization required, visit {authorization_url}"),
            ));
        };

        let body = form_encode(
            [
                ("grant_type", "authorization_code"),
                ("code", code.as_str()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
            ]
            .into_iter()
            .filter(|(_, v)| !v.is_empty()),
        );
        let response = engine.execute(&form_request(&self.token_url, body)).await?;
        if !response.success {
            return Ok(AuthOutcome::failed(
                "oauth2",
                format!("token exchange failed: {}", response.error),
            ));
        }

        let (token, expires_at, refresh) = parse_token_response(&response.body)?;
        let session = engine.sessions().session(user_id);
        session.set_token("bearer", &token, expires_at);
        if let Some(refresh) = refresh {
            session.set_token("refresh", refresh, None);
        }
        mark_authenticated(engine, user_id, "oauth2");
        Ok(AuthOutcome { token: Some(token), ..AuthOutcome::ok("oauth2", "OAuth2 authentication successful") })
    }
}

type CustomCallback =
    dyn Fn(&Engine, &str, &crate::session::SessionManager, &AuthParams) -> AuthOutcome + Send + Sync;

/// Wraps a user callback into the flow contract.
pub struct CustomAuth {
    callback: Arc<CustomCallback>,
}

impl CustomAuth {
    pub fn new(
        callback: impl Fn(&Engine, &str, &crate::session::SessionManager, &AuthParams) -> AuthOutcome
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self { callback: Arc::new(callback) }
    }
}

#[async_trait]
impl AuthFlow for CustomAuth {
    async fn authenticate(
        &self,
        engine: &Engine,
        user_id: &str,
        params: &AuthParams,
    ) -> Result<AuthOutcome> {
        let outcome = (self.callback)(engine, user_id, engine.sessions(), params);
        if outcome.success {
            mark_authenticated(engine, user_id, "custom");
        }
        Ok(outcome)
    }
}

/// Registry of named flows plus the `is_authenticated` / `logout` surface.
#[derive(Default)]
pub struct AuthManager {
    flows: Mutex<HashMap<String, Arc<dyn AuthFlow>>>,
}

impl AuthManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, flow: Arc<dyn AuthFlow>) {
        self.flows.lock().insert(name.into(), flow);
    }

    pub fn flow_names(&self) -> Vec<String> {
        self.flows.lock().keys().cloned().collect()
    }

    pub async fn authenticate(
        &self,
        engine: &Engine,
        flow_name: &str,
        user_id: &str,
        params: &AuthParams,
    ) -> Result<AuthOutcome> {
        let flow = self
            .flows
            .lock()
            .get(flow_name)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown auth flow {flow_name:?}")))?;
        flow.authenticate(engine, user_id, params).await
    }

    /// A user counts as authenticated when the flag is set and any stored
    /// token is still valid (a flow that works purely via cookies, like form
    /// login, stores no token and the flag alone decides).
    pub fn is_authenticated(&self, engine: &Engine, user_id: &str, flow_name: Option<&str>) -> bool {
        if let Some(name) = flow_name {
            if !self.flows.lock().contains_key(name) {
                return false;
            }
        }
        let session = engine.sessions().session(user_id);
        let flagged = session.get("authenticated").and_then(|v| v.as_bool()).unwrap_or(false);
        let auth_type = session
            .get("auth_type")
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default();
        // Form and custom flows may authenticate via cookies alone.
        flagged && (session.has_valid_token() || matches!(auth_type.as_str(), "form" | "custom"))
    }

    /// Clear the user's credential state. Tokens are shared session state, so
    /// logging out of one flow logs out of all of them.
    pub fn logout(&self, engine: &Engine, user_id: &str, _flow_name: Option<&str>) {
        let session = engine.sessions().session(user_id);
        session.clear_tokens();
        session.set("authenticated", false);
    }
}
