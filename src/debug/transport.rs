//! Request-scoped HTTP capture.
//!
//! A [`DebugSpan`] shadows one outbound HTTP exchange: it records the
//! redacted request (plus a reproducible curl command) before send, the
//! response status/headers on arrival, and tees the response body so the
//! buffered copy can be sanitized and attached exactly once — whether the
//! consumer reads the body to completion, drops it early, or both.

use std::sync::Mutex;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::scrubber::{redact_headers, sanitize_body_for_debug};
use super::DebugConfig;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRequestDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub headers: Map<String, Value>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub curl_command: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponseDetails {
    pub status: u16,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub headers: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorDetails {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_details: Option<ApiRequestDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_details: Option<ApiResponseDetails>,
}

#[derive(Default)]
struct SpanInner {
    request_details: Option<ApiRequestDetails>,
    response_details: Option<ApiResponseDetails>,
    error_details: Option<ApiErrorDetails>,
    body_buf: Vec<u8>,
    body_finalized: bool,
}

/// Capture state for a single HTTP exchange.
pub struct DebugSpan {
    cfg: DebugConfig,
    inner: Mutex<SpanInner>,
}

impl DebugSpan {
    pub(crate) fn new(cfg: DebugConfig) -> DebugSpan {
        DebugSpan {
            cfg,
            inner: Mutex::new(SpanInner::default()),
        }
    }

    /// Records the outgoing request: redacted headers, collapsed query
    /// params, sanitized body, and the equivalent curl command.
    pub fn capture_request(&self, req: &reqwest::Request) {
        if !self.cfg.enabled {
            return;
        }

        let mut headers = Map::new();
        for key in req.headers().keys() {
            let joined = req
                .headers()
                .get_all(key)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect::<Vec<_>>()
                .join(", ");
            headers.insert(key.as_str().to_string(), Value::String(joined));
        }
        let headers = redact_headers(headers);

        let mut params = Map::new();
        for (k, v) in req.url().query_pairs() {
            match params.get_mut(k.as_ref()) {
                None => {
                    params.insert(k.to_string(), Value::String(v.to_string()));
                }
                Some(Value::Array(arr)) => arr.push(Value::String(v.to_string())),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, Value::String(v.to_string())]);
                }
            }
        }

        let body_bytes = req.body().and_then(|b| b.as_bytes());
        let data = if self.cfg.capture_request_body {
            body_bytes.and_then(|b| sanitize_body_for_debug(b, self.cfg.strip_content))
        } else if body_bytes.is_some() {
            Some(Value::String(
                "[omitted: request body not captured by debug configuration]".to_string(),
            ))
        } else {
            None
        };

        let mut details = ApiRequestDetails {
            url: Some(req.url().to_string()),
            method: Some(req.method().to_string()),
            headers,
            params,
            data,
            curl_command: None,
        };
        details.curl_command = Some(generate_curl_command(&details));

        if self.cfg.log_details {
            debug!(details = %details_str(&details), "http_debug: request");
        }

        self.inner.lock().unwrap().request_details = Some(details);
    }

    /// Records response status and redacted headers.
    pub fn capture_response(&self, resp: &reqwest::Response) {
        if !self.cfg.enabled {
            return;
        }
        let mut headers = Map::new();
        for key in resp.headers().keys() {
            let joined = resp
                .headers()
                .get_all(key)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect::<Vec<_>>()
                .join(", ");
            headers.insert(key.as_str().to_string(), Value::String(joined));
        }
        let details = ApiResponseDetails {
            status: resp.status().as_u16(),
            headers: redact_headers(headers),
            data: None,
        };
        if self.cfg.log_details {
            debug!(details = %details_str(&details), "http_debug: response");
        }
        self.inner.lock().unwrap().response_details = Some(details);
    }

    /// Mirrors response body bytes into the capture buffer.
    pub fn append_response_body(&self, chunk: &[u8]) {
        if !self.cfg.enabled || !self.cfg.capture_response_body {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.body_finalized {
            return;
        }
        inner.body_buf.extend_from_slice(chunk);
    }

    /// Sanitizes and attaches the buffered body exactly once. Both the
    /// end-of-stream path and the teardown path call this; later calls are
    /// no-ops.
    pub fn finalize_response_body(&self) {
        if !self.cfg.enabled || !self.cfg.capture_response_body {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.body_finalized {
            return;
        }
        inner.body_finalized = true;

        if inner.response_details.is_none() || inner.body_buf.is_empty() {
            return;
        }
        let data = sanitize_body_for_debug(&inner.body_buf, self.cfg.strip_content);
        if let Some(details) = inner.response_details.as_mut() {
            details.data = data;
        }
    }

    /// Records a transport-layer failure together with whatever request and
    /// response context exists at that point.
    pub fn record_transport_error(&self, message: &str) {
        if !self.cfg.enabled {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let details = ApiErrorDetails {
            message: message.to_string(),
            request_details: inner.request_details.clone(),
            response_details: inner.response_details.clone(),
        };
        if self.cfg.log_details {
            debug!(details = %details_str(&details), "http_debug: error");
        }
        inner.error_details = Some(details);
    }

    pub(crate) fn snapshot(
        &self,
    ) -> (
        Option<ApiRequestDetails>,
        Option<ApiResponseDetails>,
        Option<ApiErrorDetails>,
    ) {
        let inner = self.inner.lock().unwrap();
        (
            inner.request_details.clone(),
            inner.response_details.clone(),
            inner.error_details.clone(),
        )
    }
}

/// Builds a copy-pasteable curl command from already-redacted details.
/// Headers are sorted for output stability.
fn generate_curl_command(details: &ApiRequestDetails) -> String {
    let (Some(url), Some(method)) = (&details.url, &details.method) else {
        return String::new();
    };

    let mut b = String::from("curl");
    let method = method.to_uppercase();
    if !method.is_empty() {
        b.push_str(" -X ");
        b.push_str(&method);
    }
    b.push(' ');
    b.push_str(&shell_quote(url));

    let mut keys: Vec<&String> = details.headers.keys().collect();
    keys.sort();
    for k in keys {
        let v = &details.headers[k.as_str()];
        let header = match v {
            Value::String(s) => format!("{k}: {s}"),
            other => format!("{k}: {other}"),
        };
        b.push_str(" \\\n  -H ");
        b.push_str(&shell_quote(&header));
    }

    if let Some(data) = &details.data {
        if let Ok(body) = serde_json::to_string_pretty(data) {
            b.push_str(" \\\n  --data-raw ");
            b.push_str(&shell_quote(&body));
        }
    }

    b
}

/// POSIX single-quote escaping: `'` becomes `'"'"'`.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

fn details_str<T: Serialize>(v: &T) -> String {
    serde_json::to_string_pretty(v).unwrap_or_else(|_| "<unserializable>".to_string())
}
