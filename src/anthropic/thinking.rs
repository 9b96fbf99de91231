//! Thinking-policy analysis for the Anthropic Messages adapter.
//!
//! Anthropic rejects tool-result turns whose replayed history disagrees with
//! the thinking configuration: a tool result after a turn that started with a
//! signed thinking block requires thinking to be on, and a tool result with
//! no reasoning history requires it to be off. The analyzer below scans the
//! input sequence once and derives the effective configuration.

use tracing::{debug, warn};

use crate::types::{
    InputKind, InputUnion, ModelParam, ReasoningContent, ReasoningLevel, ReasoningType, Role,
};

pub(super) const DEFAULT_THINKING_BUDGET: i64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThinkingOverride {
    None,
    ForceEnabled,
    ForceDisabled,
}

impl ThinkingOverride {
    fn as_str(&self) -> &'static str {
        match self {
            ThinkingOverride::None => "none",
            ThinkingOverride::ForceEnabled => "forceEnabled",
            ThinkingOverride::ForceDisabled => "forceDisabled",
        }
    }
}

#[derive(Debug, Default)]
struct ThinkingAnalysis {
    override_rule: Option<ThinkingOverride>,
    total_reasoning: usize,
    signed_or_redacted: usize,
    unsigned: usize,
    last_user_is_tool_result: bool,
    prev_assistant_starts_thinking: bool,
}

impl ThinkingAnalysis {
    fn override_rule(&self) -> ThinkingOverride {
        self.override_rule.unwrap_or(ThinkingOverride::None)
    }
}

/// Effective thinking configuration for an outgoing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct ThinkingDecision {
    pub enabled: bool,
    pub budget: i64,
}

/// Derives the effective thinking configuration from the requested reasoning
/// parameters and the shape of the input history.
pub(super) fn resolve_thinking(mp: &ModelParam, inputs: &[InputUnion]) -> ThinkingDecision {
    let analysis = analyze_thinking_behavior(inputs);
    let (requested_enabled, requested_budget) = requested_thinking(mp);

    let mut enabled = requested_enabled;
    let mut budget = requested_budget;

    match analysis.override_rule() {
        ThinkingOverride::ForceDisabled => {
            enabled = false;
            budget = 0;
        }
        ThinkingOverride::ForceEnabled => {
            enabled = true;
            if budget <= 0 {
                budget = DEFAULT_THINKING_BUDGET;
            }
        }
        ThinkingOverride::None => {}
    }

    // Fail-safe: signed/redacted thinking blocks in the outgoing prompt
    // require thinking to be on, unless it was explicitly forced off.
    if analysis.override_rule() != ThinkingOverride::ForceDisabled
        && !enabled
        && analysis.signed_or_redacted > 0
    {
        warn!(
            model = %mp.name,
            "signed/redacted reasoning present in input but thinking is disabled; enabling thinking as a fail-safe"
        );
        enabled = true;
        budget = DEFAULT_THINKING_BUDGET;
    }

    if enabled && budget <= 0 {
        budget = DEFAULT_THINKING_BUDGET;
    }

    ThinkingDecision { enabled, budget }
}

/// Scans the inputs once:
///   - no reasoning messages + last user item is a tool result => force off;
///   - all reasoning signed/redacted + last user item is a tool result whose
///     preceding assistant turn started with signed thinking => force on;
///   - mixed signed/unsigned: no override (conversion drops unsigned blocks).
fn analyze_thinking_behavior(inputs: &[InputUnion]) -> ThinkingAnalysis {
    let mut a = ThinkingAnalysis::default();
    if inputs.is_empty() {
        return a;
    }

    for input in inputs {
        if input.kind != InputKind::ReasoningMessage || input.is_empty() {
            continue;
        }
        let Some(r) = &input.reasoning_message else {
            continue;
        };
        a.total_reasoning += 1;
        if is_signed_or_redacted_reasoning(r) {
            a.signed_or_redacted += 1;
        } else {
            a.unsigned += 1;
        }
    }

    let (last_user_idx, last_user_is_tool_result) = find_last_user_item(inputs);
    a.last_user_is_tool_result = last_user_is_tool_result;
    if last_user_is_tool_result {
        if let Some(idx) = last_user_idx {
            a.prev_assistant_starts_thinking = prev_assistant_turn_starts_with_thinking(inputs, idx);
        }
    }

    a.override_rule = if a.total_reasoning == 0 {
        a.last_user_is_tool_result.then_some(ThinkingOverride::ForceDisabled)
    } else if a.signed_or_redacted > 0 && a.unsigned == 0 {
        (a.last_user_is_tool_result && a.prev_assistant_starts_thinking)
            .then_some(ThinkingOverride::ForceEnabled)
    } else {
        None
    };

    if let Some(rule) = a.override_rule {
        debug!(
            override_rule = rule.as_str(),
            reasoning_total = a.total_reasoning,
            reasoning_signed = a.signed_or_redacted,
            reasoning_unsigned = a.unsigned,
            last_user_is_tool_result = a.last_user_is_tool_result,
            prev_assistant_starts_thinking = a.prev_assistant_starts_thinking,
            "thinking override applied"
        );
    }

    a
}

/// Redacted thinking is always replayable; signed thinking needs both a
/// signature and non-empty thinking text.
pub(super) fn is_signed_or_redacted_reasoning(r: &ReasoningContent) -> bool {
    if r.redacted_thinking.iter().any(|s| !s.trim().is_empty()) {
        return true;
    }
    if r.signature.trim().is_empty() {
        return false;
    }
    r.thinking.iter().any(|t| !t.trim().is_empty())
}

/// Index of the last user-authored item (user message or function/custom
/// tool output), plus whether it is a tool result.
fn find_last_user_item(inputs: &[InputUnion]) -> (Option<usize>, bool) {
    for (i, input) in inputs.iter().enumerate().rev() {
        if input.is_empty() {
            continue;
        }
        match input.kind {
            InputKind::InputMessage => {
                if input
                    .input_message
                    .as_ref()
                    .is_some_and(|m| m.role == Role::User)
                {
                    return (Some(i), false);
                }
            }
            InputKind::FunctionToolOutput | InputKind::CustomToolOutput => {
                return (Some(i), true);
            }
            _ => {}
        }
    }
    (None, false)
}

fn is_user_authored(input: &InputUnion) -> bool {
    if input.is_empty() {
        return false;
    }
    match input.kind {
        InputKind::InputMessage => input
            .input_message
            .as_ref()
            .is_some_and(|m| m.role == Role::User),
        InputKind::FunctionToolOutput | InputKind::CustomToolOutput => true,
        _ => false,
    }
}

fn is_assistant_authored(input: &InputUnion) -> bool {
    if input.is_empty() {
        return false;
    }
    match input.kind {
        InputKind::OutputMessage => input
            .output_message
            .as_ref()
            .is_some_and(|m| m.role == Role::Assistant),
        InputKind::ReasoningMessage => true,
        InputKind::FunctionToolCall | InputKind::CustomToolCall | InputKind::WebSearchToolCall => {
            true
        }
        // Web search results replay as assistant blocks on this API.
        InputKind::WebSearchToolOutput => true,
        _ => false,
    }
}

/// For the assistant turn immediately preceding the tool result at
/// `tool_result_idx`: is its first assistant-authored item a signed or
/// redacted reasoning message?
fn prev_assistant_turn_starts_with_thinking(inputs: &[InputUnion], tool_result_idx: usize) -> bool {
    if tool_result_idx == 0 || tool_result_idx > inputs.len() - 1 {
        return false;
    }

    let mut prev_user_idx: Option<usize> = None;
    for j in (0..tool_result_idx).rev() {
        if is_user_authored(&inputs[j]) {
            prev_user_idx = Some(j);
            break;
        }
    }

    let start = prev_user_idx.map(|j| j + 1).unwrap_or(0);
    for input in &inputs[start..tool_result_idx] {
        if !is_assistant_authored(input) {
            continue;
        }
        return input.kind == InputKind::ReasoningMessage
            && input
                .reasoning_message
                .as_ref()
                .is_some_and(is_signed_or_redacted_reasoning);
    }
    false
}

/// The thinking configuration the caller asked for, before any override.
fn requested_thinking(mp: &ModelParam) -> (bool, i64) {
    let Some(rp) = &mp.reasoning else {
        return (false, 0);
    };
    match rp.reasoning_type {
        ReasoningType::HybridWithTokens => {
            (true, rp.tokens.max(DEFAULT_THINKING_BUDGET))
        }
        ReasoningType::SingleWithLevels => match rp.level {
            Some(ReasoningLevel::None) | None => (false, 0),
            Some(ReasoningLevel::Minimal) | Some(ReasoningLevel::Low) => (true, 1024),
            Some(ReasoningLevel::Medium) => (true, 2048),
            Some(ReasoningLevel::High) => (true, 8192),
            Some(ReasoningLevel::XHigh) => (true, 16384),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentItemUnion, InputOutputContent, Status, ToolCall, ToolOutput, ToolType};

    fn model_with_level(level: ReasoningLevel) -> ModelParam {
        ModelParam {
            name: "claude-sonnet-4-5".into(),
            stream: false,
            max_prompt_length: 0,
            max_output_length: 1024,
            temperature: Some(0.7),
            reasoning: Some(ReasoningParamFixture::level(level)),
            system_prompt: String::new(),
            timeout: 0,
            additional_parameters_raw_json: None,
        }
    }

    struct ReasoningParamFixture;
    impl ReasoningParamFixture {
        fn level(level: ReasoningLevel) -> crate::types::ReasoningParam {
            crate::types::ReasoningParam {
                reasoning_type: ReasoningType::SingleWithLevels,
                level: Some(level),
                tokens: 0,
            }
        }

        fn tokens(tokens: i64) -> crate::types::ReasoningParam {
            crate::types::ReasoningParam {
                reasoning_type: ReasoningType::HybridWithTokens,
                level: None,
                tokens,
            }
        }
    }

    fn fn_call(id: &str) -> InputUnion {
        InputUnion::tool_call(ToolCall {
            choice_id: "choice".into(),
            tool_type: ToolType::Function,
            role: Role::Assistant,
            id: id.into(),
            call_id: id.into(),
            name: "t".into(),
            arguments: "{}".into(),
            status: Status::Completed,
            web_search_tool_call_items: vec![],
        })
    }

    fn fn_output(call_id: &str) -> InputUnion {
        InputUnion::tool_output(ToolOutput {
            choice_id: "choice".into(),
            tool_type: ToolType::Function,
            role: Role::User,
            id: String::new(),
            call_id: call_id.into(),
            name: "t".into(),
            status: Status::Completed,
            is_error: false,
            contents: vec![ContentItemUnion::text("ok")],
            web_search_tool_output_items: vec![],
        })
    }

    fn signed_reasoning() -> InputUnion {
        InputUnion::reasoning_message(ReasoningContent {
            id: "r1".into(),
            role: Role::Assistant,
            status: Status::Completed,
            signature: "sig".into(),
            thinking: vec!["chain".into()],
            ..ReasoningContent::default()
        })
    }

    fn assistant_text(text: &str) -> InputUnion {
        InputUnion::output_message(InputOutputContent {
            id: "a1".into(),
            role: Role::Assistant,
            status: Status::Completed,
            contents: vec![ContentItemUnion::text(text)],
        })
    }

    #[test]
    fn tool_result_with_no_reasoning_forces_off() {
        let inputs = vec![InputUnion::user_text("ping"), fn_call("t1"), fn_output("t1")];
        let d = resolve_thinking(&model_with_level(ReasoningLevel::High), &inputs);
        assert!(!d.enabled);
    }

    #[test]
    fn signed_history_before_tool_result_forces_on() {
        let inputs = vec![
            InputUnion::user_text("question"),
            signed_reasoning(),
            assistant_text("answer"),
            fn_call("t1"),
            fn_output("t1"),
        ];
        let mut mp = model_with_level(ReasoningLevel::None);
        let d = resolve_thinking(&mp, &inputs);
        assert!(d.enabled);
        assert!(d.budget >= DEFAULT_THINKING_BUDGET);

        // Also applies when no reasoning was requested at all.
        mp.reasoning = None;
        let d = resolve_thinking(&mp, &inputs);
        assert!(d.enabled);
        assert_eq!(d.budget, DEFAULT_THINKING_BUDGET);
    }

    #[test]
    fn signed_reasoning_without_tool_result_uses_fail_safe() {
        let inputs = vec![
            InputUnion::user_text("question"),
            signed_reasoning(),
            assistant_text("answer"),
            InputUnion::user_text("follow-up"),
        ];
        let mp = model_with_level(ReasoningLevel::None);
        let d = resolve_thinking(&mp, &inputs);
        assert!(d.enabled);
        assert_eq!(d.budget, DEFAULT_THINKING_BUDGET);
    }

    #[test]
    fn plain_chat_honors_requested_levels() {
        let inputs = vec![InputUnion::user_text("hello")];
        for (level, want) in [
            (ReasoningLevel::Minimal, 1024),
            (ReasoningLevel::Low, 1024),
            (ReasoningLevel::Medium, 2048),
            (ReasoningLevel::High, 8192),
            (ReasoningLevel::XHigh, 16384),
        ] {
            let d = resolve_thinking(&model_with_level(level), &inputs);
            assert!(d.enabled, "{level:?}");
            assert_eq!(d.budget, want, "{level:?}");
        }
        let d = resolve_thinking(&model_with_level(ReasoningLevel::None), &inputs);
        assert!(!d.enabled);
    }

    #[test]
    fn hybrid_budget_has_floor() {
        let mut mp = model_with_level(ReasoningLevel::None);
        mp.reasoning = Some(ReasoningParamFixture::tokens(100));
        let d = resolve_thinking(&mp, &[InputUnion::user_text("x")]);
        assert!(d.enabled);
        assert_eq!(d.budget, DEFAULT_THINKING_BUDGET);

        mp.reasoning = Some(ReasoningParamFixture::tokens(9000));
        let d = resolve_thinking(&mp, &[InputUnion::user_text("x")]);
        assert_eq!(d.budget, 9000);
    }

    #[test]
    fn unsigned_reasoning_gets_no_override() {
        let unsigned = InputUnion::reasoning_message(ReasoningContent {
            id: "r1".into(),
            role: Role::Assistant,
            status: Status::Completed,
            thinking: vec!["no signature".into()],
            ..ReasoningContent::default()
        });
        let inputs = vec![
            InputUnion::user_text("q"),
            unsigned,
            fn_call("t1"),
            fn_output("t1"),
        ];
        let d = resolve_thinking(&model_with_level(ReasoningLevel::Medium), &inputs);
        // Requested config stands; unsigned blocks are dropped in conversion.
        assert!(d.enabled);
        assert_eq!(d.budget, 2048);
    }

    #[test]
    fn signed_detection_rules() {
        let mut r = ReasoningContent::default();
        assert!(!is_signed_or_redacted_reasoning(&r));
        r.thinking = vec!["text".into()];
        assert!(!is_signed_or_redacted_reasoning(&r));
        r.signature = "sig".into();
        assert!(is_signed_or_redacted_reasoning(&r));
        r = ReasoningContent {
            redacted_thinking: vec!["opaque".into()],
            ..ReasoningContent::default()
        };
        assert!(is_signed_or_redacted_reasoning(&r));
    }
}
