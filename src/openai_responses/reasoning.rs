//! Reasoning-input sanitization for the Responses adapter.
//!
//! Only encrypted reasoning payloads are ever forwarded upstream. Signature
//! or plaintext reasoning (as produced by other providers) must not leak
//! into this API, so reasoning messages without encrypted content are
//! dropped wholesale.

use tracing::debug;

use crate::types::{InputKind, InputUnion};

/// If any reasoning message carries encrypted content, keep only those
/// messages and strip each down to its encrypted content. If none does, drop
/// all reasoning messages.
pub(super) fn sanitize_reasoning_inputs(inputs: Vec<InputUnion>) -> Vec<InputUnion> {
    if inputs.is_empty() {
        return inputs;
    }

    let has_encrypted = inputs.iter().any(|input| {
        input.kind == InputKind::ReasoningMessage
            && !input.is_empty()
            && input
                .reasoning_message
                .as_ref()
                .and_then(|r| r.first_non_empty_encrypted())
                .is_some()
    });

    let mut out = Vec::with_capacity(inputs.len());
    let mut dropped = 0usize;
    let mut kept = 0usize;

    for mut input in inputs {
        if input.kind != InputKind::ReasoningMessage {
            out.push(input);
            continue;
        }
        if input.is_empty() {
            dropped += 1;
            continue;
        }

        let enc = input
            .reasoning_message
            .as_ref()
            .and_then(|r| r.first_non_empty_encrypted())
            .map(str::to_string);

        let Some(enc) = enc.filter(|_| has_encrypted) else {
            dropped += 1;
            continue;
        };

        if let Some(r) = input.reasoning_message.as_mut() {
            r.signature.clear();
            r.summary.clear();
            r.thinking.clear();
            r.redacted_thinking.clear();
            r.encrypted_content = vec![enc];
        }
        out.push(input);
        kept += 1;
    }

    if dropped > 0 {
        debug!(has_encrypted, kept, dropped, "sanitized reasoning messages");
    }

    out
}
