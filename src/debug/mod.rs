//! HTTP-level debug capture for completion requests.
//!
//! The inference layer treats the produced blob as opaque; its stable shape
//! is `{ requestDetails, responseDetails, errorDetails }` with redacted
//! headers, scrubbed bodies, and a reproducible curl command. See
//! [`scrubber`] for the redaction rules and [`transport`] for the capture
//! lifecycle.

mod scrubber;
mod transport;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::error;

use crate::types::ProviderParam;

pub use scrubber::{
    contains_sensitive_key, looks_like_base64, sanitize_body_for_debug, scrub_value_for_debug,
};
pub use transport::{ApiErrorDetails, ApiRequestDetails, ApiResponseDetails, DebugSpan};

/// Controls how HTTP debug information is captured and redacted.
#[derive(Debug, Clone, Copy)]
pub struct DebugConfig {
    /// When false, spans capture nothing and the blob is `None`.
    pub enabled: bool,
    pub capture_request_body: bool,
    pub capture_response_body: bool,
    /// Removes conversation text and large/base64 payloads while keeping
    /// metadata (model name, tools, usage, ...).
    pub strip_content: bool,
    /// Also log captured details at debug level.
    pub log_details: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        DebugConfig {
            enabled: true,
            capture_request_body: true,
            capture_response_body: true,
            strip_content: true,
            log_details: false,
        }
    }
}

/// Constructs a debugger for a provider at registration time. Returning
/// `None` disables debugging for that provider.
pub type DebuggerBuilder = Arc<dyn Fn(&ProviderParam) -> Option<Arc<HttpDebugger>> + Send + Sync>;

/// Debugger backed by the HTTP capture in this module.
pub struct HttpDebugger {
    cfg: DebugConfig,
}

impl HttpDebugger {
    pub fn new(cfg: DebugConfig) -> HttpDebugger {
        HttpDebugger { cfg }
    }

    pub fn config(&self) -> DebugConfig {
        self.cfg
    }

    /// Opens the request-scoped capture state for one fetch.
    pub fn start_span(&self) -> Arc<DebugSpan> {
        Arc::new(DebugSpan::new(self.cfg))
    }

    /// Assembles the opaque debug blob after the vendor call completed.
    ///
    /// `full_response` is the serialized final vendor response when one
    /// exists; it is scrubbed and preferred over the HTTP body copy (in
    /// streaming there is no single response body to capture). Error
    /// fragments from the HTTP layer, the vendor call, and the nil-response
    /// check are joined with `"; "`. Never panics; a failure inside assembly
    /// degrades to whatever was built so far.
    pub fn build_debug_details(
        &self,
        span: Option<&DebugSpan>,
        full_response: Option<&Value>,
        call_error: Option<&str>,
        is_nil_resp: bool,
    ) -> Option<Value> {
        if !self.cfg.enabled {
            return None;
        }
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.build_debug_details_inner(span, full_response, call_error, is_nil_resp)
        }));
        match result {
            Ok(v) => Some(v),
            Err(_) => {
                error!("debug details assembly panic");
                Some(Value::Object(Map::new()))
            }
        }
    }

    fn build_debug_details_inner(
        &self,
        span: Option<&DebugSpan>,
        full_response: Option<&Value>,
        call_error: Option<&str>,
        is_nil_resp: bool,
    ) -> Value {
        let mut blob = Map::new();
        blob.insert("requestDetails".to_string(), Value::Object(Map::new()));
        blob.insert("responseDetails".to_string(), Value::Object(Map::new()));
        blob.insert("errorDetails".to_string(), Value::Object(Map::new()));

        let (req_details, resp_details, http_error) = match span {
            Some(s) => s.snapshot(),
            None => (None, None, None),
        };

        if let Some(rd) = &req_details {
            if let Ok(v) = serde_json::to_value(rd) {
                blob.insert("requestDetails".to_string(), v);
            }
        }
        if let Some(rd) = &resp_details {
            if let Ok(v) = serde_json::to_value(rd) {
                blob.insert("responseDetails".to_string(), v);
            }
        }

        // The structured final response wins over the teed HTTP body.
        if let Some(full) = full_response {
            let scrubbed = scrub_value_for_debug(full, true);
            match blob.get_mut("responseDetails") {
                Some(Value::Object(rd)) => {
                    rd.insert("data".to_string(), scrubbed);
                }
                _ => {
                    let mut rd = Map::new();
                    rd.insert("data".to_string(), scrubbed);
                    blob.insert("responseDetails".to_string(), Value::Object(rd));
                }
            }
        }

        let mut msg_parts: Vec<String> = Vec::new();
        if let Some(he) = &http_error {
            let m = he.message.trim();
            if !m.is_empty() {
                msg_parts.push(m.to_string());
            }
        }
        if let Some(e) = call_error {
            msg_parts.push(e.to_string());
        }
        if is_nil_resp {
            msg_parts.push("got nil response from LLM api".to_string());
        }

        if msg_parts.is_empty() {
            return Value::Object(blob);
        }

        let joined = msg_parts.join("; ");
        match http_error {
            Some(mut he) => {
                he.message = joined;
                if let Ok(v) = serde_json::to_value(&he) {
                    blob.insert("errorDetails".to_string(), v);
                }
            }
            None => {
                let mut ed = Map::new();
                ed.insert("message".to_string(), Value::String(joined));
                blob.insert("errorDetails".to_string(), Value::Object(ed));
            }
        }

        Value::Object(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn debugger() -> HttpDebugger {
        HttpDebugger::new(DebugConfig::default())
    }

    #[test]
    fn disabled_debugger_returns_none() {
        let d = HttpDebugger::new(DebugConfig {
            enabled: false,
            ..DebugConfig::default()
        });
        assert!(d.build_debug_details(None, None, None, false).is_none());
    }

    #[test]
    fn blob_has_stable_top_level_shape() {
        let d = debugger();
        let blob = d.build_debug_details(None, None, None, false).unwrap();
        assert!(blob.get("requestDetails").is_some());
        assert!(blob.get("responseDetails").is_some());
        assert!(blob.get("errorDetails").is_some());
    }

    #[test]
    fn full_response_overwrites_body_copy_and_is_scrubbed() {
        let d = debugger();
        let span = d.start_span();
        let full = json!({
            "output": [{"role": "assistant", "content": "private text"}],
            "usage": {"input_tokens": 3},
        });
        let blob = d
            .build_debug_details(Some(&span), Some(&full), None, false)
            .unwrap();
        assert_eq!(
            blob["responseDetails"]["data"]["output"][0]["content"],
            "[omitted: llm text content]"
        );
        assert_eq!(blob["responseDetails"]["data"]["usage"]["input_tokens"], 3);
    }

    #[test]
    fn error_fragments_joined() {
        let d = debugger();
        let span = d.start_span();
        span.record_transport_error("http layer failed");
        let blob = d
            .build_debug_details(Some(&span), None, Some("sdk call failed"), true)
            .unwrap();
        assert_eq!(
            blob["errorDetails"]["message"],
            "http layer failed; sdk call failed; got nil response from LLM api"
        );
    }

    #[test]
    fn nil_response_without_error_still_noted() {
        let d = debugger();
        let blob = d.build_debug_details(None, None, None, true).unwrap();
        assert_eq!(blob["errorDetails"]["message"], "got nil response from LLM api");
    }
}
