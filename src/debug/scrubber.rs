//! Structural scrubbing of request/response bodies for debug capture.
//!
//! Redacts secret-bearing keys at any depth, strips conversation text while
//! keeping surrounding metadata, and replaces large base64 payloads with a
//! size note. Traversal is bounded by a depth cap and a path re-entry guard.

use serde_json::{Map, Value};

pub(crate) const MAX_SCRUB_DEPTH: usize = 4096;
pub(crate) const MASK_TOKEN: &str = "***";
pub(crate) const CYCLE_TOKEN: &str = "<cycle>";
pub(crate) const DEPTH_TOKEN: &str = "<max-depth>";
pub(crate) const OMITTED_TEXT_CONTENT: &str = "[omitted: llm text content]";
pub(crate) const OMITTED_ENCRYPTED_CONTENT: &str = "[omitted: encrypted content]";

/// Exact-match secret-bearing keys filtered in headers and bodies.
const SENSITIVE_KEYS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "api-key",
    "apikey",
    "api_key",
    "x-api-key",
];

/// True for exact sensitive keys plus the `_key` / `-key` suffix heuristic.
pub fn contains_sensitive_key(key: &str) -> bool {
    let lk = key.to_lowercase();
    if SENSITIVE_KEYS.contains(&lk.as_str()) {
        return true;
    }
    lk.ends_with("_key") || lk.ends_with("-key")
}

/// Heuristically detects large base64 strings and data URLs.
pub fn looks_like_base64(s: &str) -> bool {
    if s.len() < 128 {
        return false;
    }
    if s.contains("base64,") {
        return true;
    }
    for r in s.chars() {
        match r {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '+' | '/' | '=' | '\n' | '\r' => {}
            _ => return false,
        }
    }
    s.len() % 4 == 0
}

fn base64_omission(s: &str) -> Value {
    Value::String(format!("[omitted: {} bytes base64 data]", s.len()))
}

/// Minimal redaction for a non-JSON body.
fn scrub_plain_text(s: &str) -> Value {
    if looks_like_base64(s) {
        return base64_omission(s);
    }
    Value::String(s.to_string())
}

/// Replaces values of sensitive header keys with the mask token.
pub fn redact_headers(headers: Map<String, Value>) -> Map<String, Value> {
    headers
        .into_iter()
        .map(|(k, v)| {
            if contains_sensitive_key(&k) {
                (k, Value::String(MASK_TOKEN.to_string()))
            } else {
                (k, v)
            }
        })
        .collect()
}

#[derive(Clone, Copy)]
struct ScrubContext<'a> {
    inside_message: bool,
    parent_key: &'a str,
}

impl ScrubContext<'static> {
    fn root() -> ScrubContext<'static> {
        ScrubContext {
            inside_message: false,
            parent_key: "",
        }
    }
}

struct Scrubber {
    strip_content: bool,
    // Addresses of maps/arrays on the current path. serde_json values cannot
    // alias, so re-entry never fires today; the sentinel is part of the
    // observable contract and stays.
    seen: Vec<usize>,
}

impl Scrubber {
    fn new(strip_content: bool) -> Scrubber {
        Scrubber {
            strip_content,
            seen: Vec::new(),
        }
    }

    fn scrub(&mut self, v: &Value, depth: usize, ctx: ScrubContext<'_>) -> Value {
        if depth > MAX_SCRUB_DEPTH {
            return Value::String(DEPTH_TOKEN.to_string());
        }
        match v {
            Value::Object(m) => self.scrub_map(m, depth, ctx),
            Value::Array(a) => self.scrub_array(a, depth, ctx),
            Value::String(s) => self.scrub_string(s, ctx),
            other => other.clone(),
        }
    }

    fn scrub_map(&mut self, m: &Map<String, Value>, depth: usize, ctx: ScrubContext<'_>) -> Value {
        let addr = m as *const _ as usize;
        if self.seen.contains(&addr) {
            return Value::String(CYCLE_TOKEN.to_string());
        }
        self.seen.push(addr);

        // Chat "message" objects are detected by their role.
        let mut inside_message = ctx.inside_message;
        if let Some(Value::String(role)) = m.get("role") {
            let role = role.trim().to_lowercase();
            if role == "user" || role == "assistant" {
                inside_message = true;
            }
        }

        let mut out = Map::with_capacity(m.len());
        for (k, val) in m {
            let lk = k.to_lowercase();

            if contains_sensitive_key(&lk) {
                out.insert(k.clone(), Value::String(MASK_TOKEN.to_string()));
                continue;
            }

            let child_ctx = ScrubContext {
                inside_message,
                parent_key: k,
            };

            // The content of a user/assistant message is stripped wholesale.
            if self.strip_content && inside_message && lk == "content" {
                out.insert(k.clone(), self.scrub_message_content(val, depth + 1, child_ctx));
                continue;
            }

            // Request-level prompt carriers are treated as message subtrees.
            if self.strip_content && (lk == "input" || lk == "prompt" || lk == "query") {
                let mut sub = child_ctx;
                sub.inside_message = true;
                out.insert(k.clone(), self.scrub(val, depth + 1, sub));
                continue;
            }

            out.insert(k.clone(), self.scrub(val, depth + 1, child_ctx));
        }

        self.seen.pop();
        Value::Object(out)
    }

    fn scrub_array(&mut self, a: &[Value], depth: usize, ctx: ScrubContext<'_>) -> Value {
        let addr = a.as_ptr() as usize;
        if !a.is_empty() && self.seen.contains(&addr) {
            return Value::String(CYCLE_TOKEN.to_string());
        }
        self.seen.push(addr);
        let out = a.iter().map(|e| self.scrub(e, depth + 1, ctx)).collect();
        self.seen.pop();
        Value::Array(out)
    }

    fn scrub_string(&mut self, s: &str, ctx: ScrubContext<'_>) -> Value {
        if self.strip_content && looks_like_base64(s) {
            return base64_omission(s);
        }
        if self.strip_content && ctx.inside_message {
            let lk = ctx.parent_key.to_lowercase();
            if lk == "text" || lk == "content" || lk == "delta" {
                return Value::String(OMITTED_TEXT_CONTENT.to_string());
            }
            if lk.contains("encrypted") {
                return Value::String(OMITTED_ENCRYPTED_CONTENT.to_string());
            }
        }
        Value::String(s.to_string())
    }

    fn scrub_message_content(&mut self, val: &Value, depth: usize, ctx: ScrubContext<'_>) -> Value {
        if !self.strip_content {
            return self.scrub(val, depth, ctx);
        }
        match val {
            Value::String(_) => Value::String(OMITTED_TEXT_CONTENT.to_string()),
            Value::Array(segments) => Value::Array(
                segments
                    .iter()
                    .map(|seg| match seg {
                        Value::Object(m) => self.scrub_content_segment(m, depth + 1),
                        other => self.scrub(other, depth + 1, ctx),
                    })
                    .collect(),
            ),
            // Unknown structure; replace conservatively.
            _ => Value::String(OMITTED_TEXT_CONTENT.to_string()),
        }
    }

    /// Textual segments have text/content dropped; other segment types keep
    /// their metadata (image_url, type, ...).
    fn scrub_content_segment(&mut self, seg: &Map<String, Value>, depth: usize) -> Value {
        let seg_type = seg
            .get("type")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_lowercase())
            .unwrap_or_default();
        let is_text_segment = matches!(
            seg_type.as_str(),
            "input_text" | "output_text" | "text" | "message"
        );

        let mut out = Map::with_capacity(seg.len());
        for (k, v) in seg {
            let lk = k.to_lowercase();

            if contains_sensitive_key(&lk) {
                out.insert(k.clone(), Value::String(MASK_TOKEN.to_string()));
                continue;
            }

            if self.strip_content && is_text_segment {
                if lk == "text" || lk == "content" {
                    out.insert(k.clone(), Value::String(OMITTED_TEXT_CONTENT.to_string()));
                    continue;
                }
                if lk.contains("encrypted") {
                    out.insert(
                        k.clone(),
                        Value::String(OMITTED_ENCRYPTED_CONTENT.to_string()),
                    );
                    continue;
                }
            }

            let ctx = ScrubContext {
                inside_message: true,
                parent_key: k,
            };
            out.insert(k.clone(), self.scrub(v, depth + 1, ctx));
        }
        Value::Object(out)
    }
}

/// Scrubs an in-memory JSON value (e.g. a serialized SDK response object).
pub fn scrub_value_for_debug(v: &Value, strip_content: bool) -> Value {
    Scrubber::new(strip_content).scrub(v, 0, ScrubContext::root())
}

/// Parses and scrubs a raw body. Non-JSON bodies only get the base64
/// heuristic. Empty bodies yield `None`.
pub fn sanitize_body_for_debug(raw: &[u8], strip_content: bool) -> Option<Value> {
    if raw.is_empty() {
        return None;
    }
    match serde_json::from_slice::<Value>(raw) {
        Ok(decoded) => Some(scrub_value_for_debug(&decoded, strip_content)),
        Err(_) => {
            let s = String::from_utf8_lossy(raw);
            if strip_content {
                Some(scrub_plain_text(&s))
            } else {
                Some(Value::String(s.into_owned()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sensitive_keys_masked_at_any_depth() {
        let v = json!({
            "apiKey": "secret",
            "nested": {"x-api-key": "also-secret", "other": "kept"},
            "service_key": "suffix-secret",
        });
        let out = scrub_value_for_debug(&v, true);
        assert_eq!(out["apiKey"], "***");
        assert_eq!(out["nested"]["x-api-key"], "***");
        assert_eq!(out["nested"]["other"], "kept");
        assert_eq!(out["service_key"], "***");
    }

    #[test]
    fn message_string_content_replaced() {
        let v = json!({
            "model": "gpt-5",
            "messages": [{"role": "user", "content": "hi"}],
        });
        let out = scrub_value_for_debug(&v, true);
        assert_eq!(out["model"], "gpt-5");
        assert_eq!(out["messages"][0]["content"], OMITTED_TEXT_CONTENT);
        assert_eq!(out["messages"][0]["role"], "user");
    }

    #[test]
    fn structured_segments_keep_metadata() {
        let v = json!({
            "role": "assistant",
            "content": [
                {"type": "output_text", "text": "the answer", "annotations": []},
                {"type": "image_url", "image_url": {"url": "https://example.com/x.png"}},
                {"type": "text", "text": "more", "encrypted_index": "abc"},
            ],
        });
        let out = scrub_value_for_debug(&v, true);
        assert_eq!(out["content"][0]["text"], OMITTED_TEXT_CONTENT);
        assert_eq!(out["content"][0]["type"], "output_text");
        assert_eq!(
            out["content"][1]["image_url"]["url"],
            "https://example.com/x.png"
        );
        assert_eq!(out["content"][2]["encrypted_index"], OMITTED_ENCRYPTED_CONTENT);
    }

    #[test]
    fn top_level_input_treated_as_message_subtree() {
        let v = json!({"input": [{"role": "user", "content": "question"}], "store": false});
        let out = scrub_value_for_debug(&v, true);
        assert_eq!(out["input"][0]["content"], OMITTED_TEXT_CONTENT);
        assert_eq!(out["store"], false);
    }

    #[test]
    fn base64_payloads_replaced_with_size_note() {
        let payload = "QUJD".repeat(64); // 256 chars of base64 alphabet
        let v = json!({"role": "user", "content": [{"type": "image", "source": {"data": payload}}]});
        let out = scrub_value_for_debug(&v, true);
        assert_eq!(
            out["content"][0]["source"]["data"],
            format!("[omitted: {} bytes base64 data]", 256)
        );
    }

    #[test]
    fn base64_heuristic_boundaries() {
        assert!(!looks_like_base64("QUJD")); // too short
        assert!(looks_like_base64(&"QUJD".repeat(32)));
        assert!(!looks_like_base64(&("QUJD".repeat(32) + "!")));
        // Length not a multiple of 4.
        assert!(!looks_like_base64(&("A".repeat(129))));
        // Data URLs qualify regardless of charset details.
        assert!(looks_like_base64(&format!(
            "data:image/png;base64,{}",
            "QUJD".repeat(32)
        )));
    }

    #[test]
    fn disabled_content_strip_keeps_text_but_masks_secrets() {
        let v = json!({
            "apiKey": "secret",
            "messages": [{"role": "user", "content": "keep me"}],
        });
        let out = scrub_value_for_debug(&v, false);
        assert_eq!(out["apiKey"], "***");
        assert_eq!(out["messages"][0]["content"], "keep me");
    }

    #[test]
    fn depth_cap_yields_sentinel() {
        // Start traversal just below the cap so the nested value crosses it.
        let v = json!({"a": {"b": "leaf"}});
        let out = Scrubber::new(true).scrub(&v, MAX_SCRUB_DEPTH, ScrubContext::root());
        assert_eq!(out["a"], DEPTH_TOKEN);

        let shallow = Scrubber::new(true).scrub(&v, 0, ScrubContext::root());
        assert_eq!(shallow["a"]["b"], "leaf");
    }

    #[test]
    fn plain_text_body_gets_base64_heuristic_only() {
        let body = "QUJD".repeat(40);
        let out = sanitize_body_for_debug(body.as_bytes(), true).unwrap();
        assert_eq!(out, format!("[omitted: {} bytes base64 data]", body.len()));

        let out = sanitize_body_for_debug(b"not json, not base64", true).unwrap();
        assert_eq!(out, "not json, not base64");
    }

    #[test]
    fn empty_body_is_none() {
        assert!(sanitize_body_for_debug(b"", true).is_none());
    }

    #[test]
    fn headers_redacted_by_exact_and_suffix_match() {
        let mut h = Map::new();
        h.insert("Authorization".into(), json!("Bearer XYZ"));
        h.insert("Content-Type".into(), json!("application/json"));
        h.insert("My-Service-Key".into(), json!("k"));
        let out = redact_headers(h);
        assert_eq!(out["Authorization"], "***");
        assert_eq!(out["Content-Type"], "application/json");
        assert_eq!(out["My-Service-Key"], "***");
    }
}
