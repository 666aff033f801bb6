//! HTTP adapter backed by a shared reqwest client.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;

use crate::clock::Stopwatch;
use crate::error::{Error, Result};
use crate::request::{Protocol, Request, MAX_BODY_LEN, MAX_HEADER_LEN};
use crate::response::Response;

const MAX_REDIRECTS: usize = 5;
pub const MAX_CONNECTIONS: usize = 10_000;

pub struct HttpAdapter {
    client: reqwest::Client,
}

impl HttpAdapter {
    pub fn new(max_connections: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(Policy::limited(MAX_REDIRECTS))
            .pool_max_idle_per_host(max_connections.min(MAX_CONNECTIONS))
            .build()
            .map_err(|e| Error::TransportFailed(format!("build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Execute one HTTP request under the descriptor's total deadline.
    ///
    /// Headers and body are captured into bounded buffers; past the body
    /// bound the remainder of the stream is drained so the pooled connection
    /// stays reusable. `success` reflects transport and status class only.
    /// Transport failure leaves `status_code` at 0.
    pub async fn execute(&self, req: &Request) -> Result<Response> {
        req.validate()?;
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|_| Error::InvalidArgument(format!("invalid HTTP method {:?}", req.method)))?;
        let url = reqwest::Url::parse(&req.url)
            .map_err(|e| Error::InvalidArgument(format!("invalid URL {:?}: {e}", req.url)))?;

        let mut builder = self
            .client
            .request(method, url)
            .timeout(req.timeout)
            .headers(parse_header_blob(&req.headers));
        if !req.body.is_empty() {
            builder = builder.body(req.body.clone());
        }

        let sw = Stopwatch::start();
        let mut resp = Response::new(Protocol::Http);

        match builder.send().await {
            Ok(reply) => {
                resp.status_code = reply.status().as_u16();
                resp.success = (200..400).contains(&resp.status_code);
                resp.set_headers(&render_header_blob(reply.headers()));
                resp.body = capture_body(reply).await;
            }
            Err(e) => {
                resp.status_code = 0;
                resp.success = false;
                resp.error = e.to_string();
            }
        }
        resp.response_time_us = sw.elapsed_us();
        Ok(resp)
    }
}

/// Parse the newline-separated `Name: value` blob. Malformed lines are
/// skipped rather than failing the request, matching the lossy contract of
/// the header-blob format.
fn parse_header_blob(blob: &str) -> HeaderMap {
    let mut map = HeaderMap::new();
    for line in blob.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        match (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(value.trim()),
        ) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => tracing::warn!(line, "skipping malformed header line"),
        }
    }
    map
}

fn render_header_blob(headers: &HeaderMap) -> String {
    let mut blob = String::new();
    for (name, value) in headers {
        if blob.len() >= MAX_HEADER_LEN {
            break;
        }
        if !blob.is_empty() {
            blob.push('\n');
        }
        blob.push_str(name.as_str());
        blob.push_str(": ");
        blob.push_str(value.to_str().unwrap_or_default());
    }
    blob
}

/// Stream the body into a bounded buffer, draining anything past the bound.
async fn capture_body(mut reply: reqwest::Response) -> String {
    let mut captured: Vec<u8> = Vec::new();
    loop {
        match reply.chunk().await {
            Ok(Some(chunk)) => {
                if captured.len() < MAX_BODY_LEN {
                    let room = MAX_BODY_LEN - captured.len();
                    captured.extend_from_slice(&chunk[..chunk.len().min(room)]);
                }
                // keep reading: the connection must be drained for reuse
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(%e, "body stream ended early");
                break;
            }
        }
    }
    let mut text = String::from_utf8_lossy(&captured).into_owned();
    text.truncate(crate::response::truncate_utf8(&text, MAX_BODY_LEN).len());
    text
}
