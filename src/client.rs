//! HTTP plumbing shared by the vendor adapters: endpoint resolution,
//! debug-instrumented send, body reading with tee, and request-body merging
//! of caller-supplied raw parameters.

use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tracing::debug;

use crate::debug::DebugSpan;
use crate::types::ProviderParam;

/// A configured vendor endpoint. Built by `init_llm`, cleared by
/// `deinit_llm`; cheap to clone so fetches can snapshot it under a read lock.
#[derive(Clone)]
pub(crate) struct EndpointClient {
    pub http: reqwest::Client,
    pub endpoint: String,
}

impl EndpointClient {
    /// Builds a client for `vendor_path` (e.g. `v1/messages`) under the
    /// provider origin. A caller-supplied path prefix that already ends with
    /// the vendor path is trimmed so the segment is not doubled. Default
    /// headers from the provider config are attached to every request.
    pub fn new(param: &ProviderParam, vendor_path: &str) -> Result<EndpointClient> {
        let endpoint = join_endpoint(&param.origin, &param.chat_completion_path_prefix, vendor_path);

        let mut headers = HeaderMap::new();
        for (k, v) in &param.default_headers {
            let name = HeaderName::from_bytes(k.trim().as_bytes())
                .with_context(|| format!("invalid default header name {k:?}"))?;
            let value = HeaderValue::from_str(v.trim())
                .with_context(|| format!("invalid default header value for {k:?}"))?;
            headers.insert(name, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("build http client")?;

        Ok(EndpointClient { http, endpoint })
    }
}

/// Joins origin + path prefix + vendor path, tolerating stray slashes and a
/// prefix that already names the vendor path.
pub(crate) fn join_endpoint(origin: &str, path_prefix: &str, vendor_path: &str) -> String {
    let base = origin.trim_end_matches('/');
    let mut prefix = path_prefix.trim().trim_end_matches('/');
    if let Some(stripped) = prefix.strip_suffix(vendor_path) {
        prefix = stripped.trim_end_matches('/');
    }
    let prefix = prefix.trim_start_matches('/');
    if prefix.is_empty() {
        format!("{base}/{vendor_path}")
    } else {
        format!("{base}/{prefix}/{vendor_path}")
    }
}

/// Executes a request with debug capture. Non-success statuses are turned
/// into errors after teeing the error body into the span.
pub(crate) async fn send_request(
    client: &reqwest::Client,
    request: reqwest::Request,
    span: Option<&Arc<DebugSpan>>,
) -> Result<reqwest::Response> {
    if let Some(span) = span {
        span.capture_request(&request);
    }

    let result = client.execute(request).await;
    let response = match result {
        Ok(resp) => resp,
        Err(e) => {
            if let Some(span) = span {
                span.record_transport_error(&e.to_string());
            }
            return Err(anyhow::anyhow!("http request failed: {e}"));
        }
    };

    if let Some(span) = span {
        span.capture_response(&response);
    }

    let status = response.status();
    if !status.is_success() {
        let body = read_body_with_debug(response, span).await.unwrap_or_default();
        let body_text = String::from_utf8_lossy(&body);
        let message = format!("api returned status {status}: {body_text}");
        if let Some(span) = span {
            span.record_transport_error(&message);
        }
        return Err(anyhow::anyhow!(message));
    }

    Ok(response)
}

/// Reads the full response body, mirroring every chunk into the debug span
/// and finalizing the captured copy once the stream ends.
pub(crate) async fn read_body_with_debug(
    mut response: reqwest::Response,
    span: Option<&Arc<DebugSpan>>,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                if let Some(span) = span {
                    span.append_response_body(&chunk);
                }
                out.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(e) => {
                if let Some(span) = span {
                    span.finalize_response_body();
                }
                return Err(anyhow::anyhow!("read response body: {e}"));
            }
        }
    }
    if let Some(span) = span {
        span.finalize_response_body();
    }
    Ok(out)
}

/// Recursively merges `custom` over `base`: objects merge key-wise, anything
/// else is replaced by `custom`.
pub(crate) fn merge_json(mut base: Value, custom: Value) -> Value {
    match (&mut base, custom) {
        (Value::Object(base_map), Value::Object(custom_map)) => {
            for (key, custom_value) in custom_map {
                match base_map.remove(&key) {
                    Some(existing) => {
                        base_map.insert(key, merge_json(existing, custom_value));
                    }
                    None => {
                        base_map.insert(key, custom_value);
                    }
                }
            }
            base
        }
        (_, custom) => custom,
    }
}

/// Merges `additional_parameters_raw_json` over a request body when it is a
/// JSON object; anything else is ignored with a debug log.
pub(crate) fn apply_additional_parameters(body: Value, raw: Option<&str>) -> Value {
    let Some(raw) = raw else {
        return body;
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return body;
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(custom @ Value::Object(_)) => merge_json(body, custom),
        Ok(_) => {
            debug!("additional parameters are not a JSON object; ignoring");
            body
        }
        Err(e) => {
            debug!(error = %e, "additional parameters are not valid JSON; ignoring");
            body
        }
    }
}
