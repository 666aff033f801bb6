//! Per-virtual-user session state.
//!
//! Every virtual user owns a [`SessionStore`]: arbitrary values, cookies and
//! authentication tokens, isolated from every other user and guarded by its
//! own mutex. The [`SessionManager`] hands out stores by user id and applies
//! response correlation: cookie auto-handling, extraction rules, and header
//! preparation for follow-up requests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::response::Response;

/// A stored cookie. Attributes other than name and value are kept only for
/// bookkeeping; matching ignores domain and path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub value: String,
    pub domain: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    /// Unix timestamp (seconds). `None` means the token never expires.
    pub expires_at: Option<i64>,
}

impl Token {
    pub fn expired(&self) -> bool {
        match self.expires_at {
            Some(at) => chrono::Utc::now().timestamp() > at,
            None => false,
        }
    }
}

/// Where an extraction rule reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractSource {
    /// Dot-and-index path into a JSON body, e.g. `user.id` or `items[0].id`.
    JsonPath,
    /// A response header by name.
    Header,
    /// A cookie name looked up in `Set-Cookie` headers.
    Cookie,
    /// First capture group of a regex applied to the body.
    Regex,
}

/// Pulls one value out of a response and binds it into the session.
#[derive(Debug, Clone)]
pub struct ExtractRule {
    pub source: ExtractSource,
    /// Path, header name, cookie name or pattern, depending on `source`.
    pub key: String,
    /// Session variable the extracted value is bound to.
    pub variable: String,
}

impl ExtractRule {
    pub fn json_path(path: impl Into<String>, variable: impl Into<String>) -> Self {
        Self { source: ExtractSource::JsonPath, key: path.into(), variable: variable.into() }
    }

    pub fn header(name: impl Into<String>, variable: impl Into<String>) -> Self {
        Self { source: ExtractSource::Header, key: name.into(), variable: variable.into() }
    }

    pub fn cookie(name: impl Into<String>, variable: impl Into<String>) -> Self {
        Self { source: ExtractSource::Cookie, key: name.into(), variable: variable.into() }
    }

    pub fn regex(pattern: impl Into<String>, variable: impl Into<String>) -> Self {
        Self { source: ExtractSource::Regex, key: pattern.into(), variable: variable.into() }
    }

    fn apply(&self, response: &Response) -> Option<Value> {
        match self.source {
            ExtractSource::JsonPath => {
                let body: Value = serde_json::from_str(&response.body).ok()?;
                json_path(&body, &self.key).cloned()
            }
            ExtractSource::Header => response.header(&self.key).map(|v| Value::String(v.into())),
            ExtractSource::Cookie => {
                cookie_from_headers(&response.headers, &self.key).map(Value::String)
            }
            ExtractSource::Regex => {
                let re = regex::Regex::new(&self.key).ok()?;
                let caps = re.captures(&response.body)?;
                caps.get(1).or_else(|| caps.get(0)).map(|m| Value::String(m.as_str().into()))
            }
        }
    }
}

/// Walk a JSON value by dot notation with `[index]` segments.
pub fn json_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for part in path.split('.') {
        if let Some((key, rest)) = part.split_once('[') {
            if !key.is_empty() {
                current = current.get(key)?;
            }
            for idx in rest.trim_end_matches(']').split("][") {
                current = current.get(idx.parse::<usize>().ok()?)?;
            }
        } else {
            current = current.get(part)?;
        }
    }
    Some(current)
}

/// Pull a cookie value out of the `Set-Cookie` lines of a header blob,
/// ignoring every attribute after the first `;`.
pub fn cookie_from_headers(blob: &str, name: &str) -> Option<String> {
    blob.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim().eq_ignore_ascii_case("set-cookie").then_some(value)
        })
        .find_map(|header| {
            let pair = header.split(';').next()?;
            let (k, v) = pair.split_once('=')?;
            (k.trim() == name).then(|| v.trim().to_owned())
        })
}

#[derive(Default)]
struct SessionData {
    values: HashMap<String, Value>,
    cookies: HashMap<String, Cookie>,
    tokens: HashMap<String, Token>,
    /// Header name used when an `api_key` token is emitted.
    api_key_header: Option<String>,
}

/// Thread-safe state for one virtual user.
#[derive(Default)]
pub struct SessionStore {
    inner: Mutex<SessionData>,
}

impl SessionStore {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().values.get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner.lock().values.insert(key.into(), value.into());
    }

    pub fn delete(&self, key: &str) {
        self.inner.lock().values.remove(key);
    }

    pub fn set_cookie(&self, name: impl Into<String>, value: impl Into<String>, domain: &str, path: &str) {
        self.inner.lock().cookies.insert(
            name.into(),
            Cookie {
                value: value.into(),
                domain: domain.to_owned(),
                path: if path.is_empty() { "/".to_owned() } else { path.to_owned() },
            },
        );
    }

    pub fn get_cookie(&self, name: &str) -> Option<String> {
        self.inner.lock().cookies.get(name).map(|c| c.value.clone())
    }

    pub fn cookies(&self) -> HashMap<String, String> {
        self.inner.lock().cookies.iter().map(|(k, v)| (k.clone(), v.value.clone())).collect()
    }

    pub fn clear_cookies(&self) {
        self.inner.lock().cookies.clear();
    }

    pub fn set_token(&self, token_type: impl Into<String>, value: impl Into<String>, expires_at: Option<i64>) {
        self.inner
            .lock()
            .tokens
            .insert(token_type.into(), Token { value: value.into(), expires_at });
    }

    /// Expired tokens read back as absent.
    pub fn get_token(&self, token_type: &str) -> Option<String> {
        let data = self.inner.lock();
        let token = data.tokens.get(token_type)?;
        (!token.expired()).then(|| token.value.clone())
    }

    pub fn has_valid_token(&self) -> bool {
        self.inner.lock().tokens.values().any(|t| !t.expired())
    }

    pub fn remove_token(&self, token_type: &str) {
        self.inner.lock().tokens.remove(token_type);
    }

    pub fn clear_tokens(&self) {
        self.inner.lock().tokens.clear();
    }

    pub fn set_api_key_header(&self, header_name: impl Into<String>) {
        self.inner.lock().api_key_header = Some(header_name.into());
    }

    pub fn clear(&self) {
        let mut data = self.inner.lock();
        data.values.clear();
        data.cookies.clear();
        data.tokens.clear();
        data.api_key_header = None;
    }

    /// Substitute `${var}` references with session values. Unknown variables
    /// are left untouched.
    pub fn substitute(&self, text: &str) -> String {
        if !text.contains("${") {
            return text.to_owned();
        }
        let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static pattern");
        re.replace_all(text, |caps: &regex::Captures<'_>| {
            match self.get(&caps[1]) {
                Some(Value::String(s)) => s,
                Some(v) => v.to_string(),
                None => caps[0].to_owned(),
            }
        })
        .into_owned()
    }

    /// Augment a header blob with the session's cookies and preferred
    /// credential. Bearer wins over API key, API key over Basic; the API key
    /// goes out under its configured header name rather than Authorization.
    pub fn prepare_request_headers(&self, base_headers: &str) -> String {
        let data = self.inner.lock();
        let mut lines: Vec<String> =
            base_headers.lines().filter(|l| !l.trim().is_empty()).map(str::to_owned).collect();

        if !data.cookies.is_empty() {
            let mut pairs: Vec<_> =
                data.cookies.iter().map(|(k, v)| format!("{k}={}", v.value)).collect();
            pairs.sort();
            let cookie_line = pairs.join("; ");
            match lines.iter_mut().find(|l| l.to_ascii_lowercase().starts_with("cookie:")) {
                Some(existing) => {
                    existing.push_str("; ");
                    existing.push_str(&cookie_line);
                }
                None => lines.push(format!("Cookie: {cookie_line}")),
            }
        }

        let valid = |t: Option<&Token>| t.filter(|t| !t.expired()).map(|t| t.value.clone());
        if let Some(bearer) = valid(data.tokens.get("bearer")) {
            lines.push(format!("Authorization: Bearer {bearer}"));
        } else if let Some(api_key) = valid(data.tokens.get("api_key")) {
            let header = data.api_key_header.as_deref().unwrap_or("X-API-Key");
            lines.push(format!("{header}: {api_key}"));
        } else if let Some(basic) = valid(data.tokens.get("basic")) {
            lines.push(format!("Authorization: {basic}"));
        }

        lines.join("\n")
    }
}

/// Hands out per-user session stores. Stores are disjoint across user ids and
/// live until torn down explicitly.
#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<SessionStore>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self, user_id: &str) -> Arc<SessionStore> {
        let mut sessions = self.sessions.lock();
        Arc::clone(sessions.entry(user_id.to_owned()).or_default())
    }

    pub fn clear_session(&self, user_id: &str) {
        if let Some(store) = self.sessions.lock().remove(user_id) {
            store.clear();
        }
    }

    pub fn clear_all(&self) {
        let mut sessions = self.sessions.lock();
        for store in sessions.values() {
            store.clear();
        }
        sessions.clear();
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Store every `Set-Cookie` from the response into the user's jar,
    /// keeping only the `name=value` pair of each cookie line.
    pub fn auto_handle_cookies(&self, user_id: &str, response: &Response) {
        let store = self.session(user_id);
        for value in response.header_all("set-cookie") {
            let Some(pair) = value.split(';').next() else { continue };
            if let Some((name, val)) = pair.split_once('=') {
                store.set_cookie(name.trim(), val.trim(), "", "/");
            }
        }
    }

    /// Apply extraction rules against a response, binding each hit into the
    /// user's session. A rule that matches nothing is skipped with a warning;
    /// extraction never fails a run.
    pub fn process_response(&self, user_id: &str, response: &Response, rules: &[ExtractRule]) {
        if rules.is_empty() {
            return;
        }
        let store = self.session(user_id);
        for rule in rules {
            match rule.apply(response) {
                Some(value) => store.set(rule.variable.clone(), value),
                None => {
                    tracing::warn!(variable = %rule.variable, key = %rule.key, "extraction rule matched nothing")
                }
            }
        }
    }

    pub fn prepare_request_headers(&self, user_id: &str, base_headers: &str) -> String {
        self.session(user_id).prepare_request_headers(base_headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Protocol;

    fn response_with(headers: &str, body: &str) -> Response {
        let mut resp = Response::new(Protocol::Http);
        resp.status_code = 200;
        resp.success = true;
        resp.headers = headers.to_owned();
        resp.body = body.to_owned();
        resp
    }

    #[test]
    fn test_session_isolation() {
        let mgr = SessionManager::new();
        mgr.session("a").set("k", "va");
        mgr.session("b").set("k", "vb");
        assert_eq!(mgr.session("a").get("k"), Some(Value::String("va".into())));
        assert_eq!(mgr.session("b").get("k"), Some(Value::String("vb".into())));
        mgr.clear_session("a");
        assert_eq!(mgr.session("a").get("k"), None);
        assert_eq!(mgr.session("b").get("k"), Some(Value::String("vb".into())));
    }

    #[test]
    fn test_json_path_traversal() {
        let v: Value =
            serde_json::from_str(r#"{"user":{"id":42,"tags":["a","b"]},"items":[{"id":7}]}"#)
                .unwrap();
        assert_eq!(json_path(&v, "user.id"), Some(&Value::from(42)));
        assert_eq!(json_path(&v, "user.tags[1]"), Some(&Value::from("b")));
        assert_eq!(json_path(&v, "items[0].id"), Some(&Value::from(7)));
        assert_eq!(json_path(&v, "user.missing"), None);
        assert_eq!(json_path(&v, "items[9].id"), None);
    }

    #[test]
    fn test_cookie_auto_handling_roundtrip() {
        let mgr = SessionManager::new();
        let resp = response_with("Set-Cookie: sid=abc; Path=/; HttpOnly\nSet-Cookie: t=9", "");
        mgr.auto_handle_cookies("u1", &resp);

        assert_eq!(mgr.session("u1").get_cookie("sid"), Some("abc".into()));
        let headers = mgr.prepare_request_headers("u1", "Accept: */*");
        assert!(headers.contains("Accept: */*"));
        assert!(headers.contains("Cookie: sid=abc; t=9"));
    }

    #[test]
    fn test_token_preference_and_expiry() {
        let store = SessionStore::default();
        store.set_token("basic", "Basic dXNlcjpwdw==", None);
        assert!(store.prepare_request_headers("").contains("Authorization: Basic"));

        store.set_token("api_key", "k-123", None);
        let headers = store.prepare_request_headers("");
        assert!(headers.contains("X-API-Key: k-123"));
        assert!(!headers.contains("Authorization"));

        store.set_token("bearer", "tok", None);
        assert!(store.prepare_request_headers("").contains("Authorization: Bearer tok"));

        // expired bearer falls back to the api key
        let past = chrono::Utc::now().timestamp() - 10;
        store.set_token("bearer", "tok", Some(past));
        assert_eq!(store.get_token("bearer"), None);
        assert!(store.prepare_request_headers("").contains("X-API-Key"));
    }

    #[test]
    fn test_extract_rules() {
        let mgr = SessionManager::new();
        let resp = response_with(
            "Content-Type: application/json\nSet-Cookie: sid=abc",
            r#"{"access_token":"T","user":{"id":42}}"#,
        );
        let rules = vec![
            ExtractRule::json_path("access_token", "tok"),
            ExtractRule::json_path("user.id", "uid"),
            ExtractRule::cookie("sid", "s"),
            ExtractRule::header("Content-Type", "ctype"),
            ExtractRule::regex(r#""access_token":"([A-Z]+)""#, "retok"),
        ];
        mgr.process_response("u1", &resp, &rules);

        let store = mgr.session("u1");
        assert_eq!(store.get("tok"), Some(Value::String("T".into())));
        assert_eq!(store.get("uid"), Some(Value::from(42)));
        assert_eq!(store.get("s"), Some(Value::String("abc".into())));
        assert_eq!(store.get("ctype"), Some(Value::String("application/json".into())));
        assert_eq!(store.get("retok"), Some(Value::String("T".into())));
    }

    #[test]
    fn test_substitution() {
        let store = SessionStore::default();
        store.set("uid", 42);
        store.set("name", "alice");
        assert_eq!(
            store.substitute("/users/${uid}?by=${name}&keep=${missing}"),
            "/users/42?by=alice&keep=${missing}"
        );
    }

    #[test]
    fn test_cookie_merges_into_existing_header() {
        let store = SessionStore::default();
        store.set_cookie("a", "1", "", "/");
        let headers = store.prepare_request_headers("Cookie: pre=0");
        assert!(headers.contains("Cookie: pre=0; a=1"));
    }
}
