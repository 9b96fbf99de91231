//! Heuristic token counting and budget-driven prompt filtering.
//!
//! The counter is deliberately approximate: it splits text into word-like
//! runs plus individual punctuation/symbol characters, which tracks modern
//! BPE tokenizers far better than whitespace splitting without pulling in a
//! real tokenizer. Images and opaque encrypted/redacted payloads count as
//! zero.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::types::{ContentItemKind, ContentItemUnion, InputKind, InputOutputContent, InputUnion,
    ReasoningContent, ToolCall, ToolOutput, WebSearchToolCallKind, WebSearchToolOutputKind};

/// Keeps the newest inputs that fit `max_token_count`, preserving
/// chronological order, then prunes tool outputs orphaned by the cut.
///
/// The newest item is always kept, even when it alone exceeds the budget.
pub fn filter_messages_by_token_count(
    messages: Vec<InputUnion>,
    max_token_count: i64,
) -> Vec<InputUnion> {
    if messages.is_empty() {
        return Vec::new();
    }
    let original_count = messages.len();

    let mut total_tokens: i64 = 0;
    let mut filtered: Vec<InputUnion> = Vec::new();

    // Newest-first accumulation.
    for msg in messages.into_iter().rev() {
        let tokens_in_msg = count_heuristic_tokens_in_input(&msg);

        if total_tokens + tokens_in_msg <= max_token_count || filtered.is_empty() {
            filtered.push(msg);
            total_tokens += tokens_in_msg;
            if total_tokens > max_token_count {
                break;
            }
        } else {
            break;
        }
    }

    // Back to chronological order.
    filtered.reverse();

    let filtered = prune_orphan_tool_outputs(filtered);

    if filtered.len() < original_count {
        debug!(
            original_count,
            filtered_count = filtered.len(),
            approx_tokens = total_tokens,
            "filtered messages are less than input"
        );
    }

    filtered
}

/// Drops tool outputs whose `call_id` has no matching tool call in the kept
/// sequence. Outputs with an empty `call_id` are left alone.
fn prune_orphan_tool_outputs(msgs: Vec<InputUnion>) -> Vec<InputUnion> {
    if msgs.is_empty() {
        return msgs;
    }

    let call_ids: HashSet<String> = msgs
        .iter()
        .filter_map(|m| m.as_tool_call())
        .map(|c| c.call_id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect();

    msgs.into_iter()
        .filter(|m| match m.as_tool_output() {
            Some(out) => {
                let call_id = out.call_id.trim();
                call_id.is_empty() || call_ids.contains(call_id)
            }
            None => true,
        })
        .collect()
}

fn count_heuristic_tokens_in_input(input: &InputUnion) -> i64 {
    if input.is_empty() {
        return 0;
    }
    match input.kind {
        InputKind::InputMessage => input
            .input_message
            .as_ref()
            .map(count_tokens_in_message)
            .unwrap_or(0),
        InputKind::OutputMessage => input
            .output_message
            .as_ref()
            .map(count_tokens_in_message)
            .unwrap_or(0),
        InputKind::ReasoningMessage => input
            .reasoning_message
            .as_ref()
            .map(count_tokens_in_reasoning)
            .unwrap_or(0),
        InputKind::FunctionToolCall | InputKind::CustomToolCall | InputKind::WebSearchToolCall => {
            input.as_tool_call().map(count_tokens_in_tool_call).unwrap_or(0)
        }
        InputKind::FunctionToolOutput
        | InputKind::CustomToolOutput
        | InputKind::WebSearchToolOutput => input
            .as_tool_output()
            .map(count_tokens_in_tool_output)
            .unwrap_or(0),
    }
}

fn count_tokens_in_message(msg: &InputOutputContent) -> i64 {
    msg.contents.iter().map(count_tokens_in_content_item).sum()
}

fn count_tokens_in_content_item(item: &ContentItemUnion) -> i64 {
    match item.kind {
        ContentItemKind::Text => item
            .text_item
            .as_ref()
            .map(|t| count_heuristic_tokens_in_str(&t.text))
            .unwrap_or(0),
        ContentItemKind::Refusal => item
            .refusal_item
            .as_ref()
            .map(|r| count_heuristic_tokens_in_str(&r.refusal))
            .unwrap_or(0),
        // Images contribute nothing to the text budget.
        ContentItemKind::Image => 0,
        // The additional context is the main textual part of a file item.
        ContentItemKind::File => item
            .file_item
            .as_ref()
            .map(|f| count_heuristic_tokens_in_str(&f.additional_context))
            .unwrap_or(0),
    }
}

fn count_tokens_in_reasoning(r: &ReasoningContent) -> i64 {
    let mut total = 0;
    for s in &r.summary {
        total += count_heuristic_tokens_in_str(s);
    }
    for t in &r.thinking {
        total += count_heuristic_tokens_in_str(t);
    }
    for t in &r.redacted_thinking {
        total += count_heuristic_tokens_in_str(t);
    }
    // Encrypted content is opaque; ignored.
    total
}

fn count_tokens_in_tool_call(call: &ToolCall) -> i64 {
    let mut total = count_heuristic_tokens_in_str(&call.name)
        + count_heuristic_tokens_in_str(&call.arguments);

    for item in &call.web_search_tool_call_items {
        match item.kind {
            WebSearchToolCallKind::Search => {
                if let Some(s) = &item.search_item {
                    total += count_heuristic_tokens_in_str(&s.query);
                }
            }
            WebSearchToolCallKind::Find => {
                if let Some(f) = &item.find_item {
                    total += count_heuristic_tokens_in_str(&f.pattern);
                }
            }
            // URLs are typically short; ignored.
            WebSearchToolCallKind::OpenPage => {}
        }
    }

    total
}

fn count_tokens_in_tool_output(out: &ToolOutput) -> i64 {
    let mut total = 0;

    for it in &out.contents {
        if it.kind == ContentItemKind::Text {
            if let Some(t) = &it.text_item {
                total += count_heuristic_tokens_in_str(&t.text);
            }
        }
    }

    // Titles and rendered content carry most of the text of search results.
    for it in &out.web_search_tool_output_items {
        if it.kind == WebSearchToolOutputKind::Search {
            if let Some(s) = &it.search_item {
                total += count_heuristic_tokens_in_str(&s.title);
                total += count_heuristic_tokens_in_str(&s.rendered_content);
            }
        }
    }

    total
}

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\w+|[^\s\w]").expect("token regex"))
}

/// Word-like runs plus each lone punctuation/symbol character.
pub fn count_heuristic_tokens_in_str(content: &str) -> i64 {
    let content = content.trim();
    if content.is_empty() {
        return 0;
    }
    token_regex().find_iter(content).count() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Role, Status, ToolType};

    fn call(call_id: &str) -> InputUnion {
        InputUnion::tool_call(ToolCall {
            choice_id: "choice".into(),
            tool_type: ToolType::Function,
            role: Role::Assistant,
            id: call_id.into(),
            call_id: call_id.into(),
            name: "lookup".into(),
            arguments: r#"{"q":"x"}"#.into(),
            status: Status::Completed,
            web_search_tool_call_items: vec![],
        })
    }

    fn output(call_id: &str, text: &str) -> InputUnion {
        InputUnion::tool_output(ToolOutput {
            choice_id: "choice".into(),
            tool_type: ToolType::Function,
            role: Role::User,
            id: String::new(),
            call_id: call_id.into(),
            name: "lookup".into(),
            status: Status::Completed,
            is_error: false,
            contents: vec![ContentItemUnion::text(text)],
            web_search_tool_output_items: vec![],
        })
    }

    #[test]
    fn heuristic_counts_words_and_punctuation() {
        assert_eq!(count_heuristic_tokens_in_str(""), 0);
        assert_eq!(count_heuristic_tokens_in_str("   "), 0);
        assert_eq!(count_heuristic_tokens_in_str("hello world"), 2);
        assert_eq!(count_heuristic_tokens_in_str("hello, world!"), 4);
        assert_eq!(count_heuristic_tokens_in_str("a.b.c"), 5);
    }

    #[test]
    fn keeps_newest_item_even_over_budget() {
        let inputs = vec![InputUnion::user_text(
            "this text is certainly longer than a two token budget",
        )];
        let kept = filter_messages_by_token_count(inputs.clone(), 2);
        assert_eq!(kept, inputs);
    }

    #[test]
    fn truncates_oldest_first_and_preserves_order() {
        let inputs = vec![
            InputUnion::user_text("first message with several words here"),
            InputUnion::user_text("second"),
            InputUnion::user_text("third"),
        ];
        let kept = filter_messages_by_token_count(inputs, 2);
        assert_eq!(kept.len(), 2);
        let texts: Vec<&str> = kept
            .iter()
            .map(|m| {
                m.input_message.as_ref().unwrap().contents[0]
                    .text_item
                    .as_ref()
                    .unwrap()
                    .text
                    .as_str()
            })
            .collect();
        assert_eq!(texts, vec!["second", "third"]);
    }

    #[test]
    fn orphan_output_dropped_when_call_is_cut() {
        let inputs = vec![
            call("c1"),
            InputUnion::user_text("some words to eat the remaining budget up fully"),
            output("c1", "orphaned output referencing a dropped call"),
            InputUnion::user_text("B"),
        ];
        // Budget keeps only the last two items; the surviving output has no
        // matching call and must be pruned.
        let kept = filter_messages_by_token_count(inputs, 8);
        assert!(kept.iter().all(|m| m.as_tool_output().is_none()));
        assert!(kept.iter().any(|m| m.input_message.is_some()));
    }

    #[test]
    fn output_with_empty_call_id_is_not_pruned() {
        let inputs = vec![output("", "free-standing output"), InputUnion::user_text("B")];
        let kept = filter_messages_by_token_count(inputs, 100);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn truncation_then_orphan_prune_keeps_consistent_tail() {
        // A long leading message falls out of budget; the trailing output
        // references a call that was never kept and is pruned, while the
        // surviving call/output pair stays intact.
        let inputs = vec![
            InputUnion::user_text("A A A A A A A A A A A A A A A A A A A A"),
            call("c1"),
            output("c1", "r"),
            InputUnion::user_text("B"),
            output("c2", "stale"),
        ];
        let kept = filter_messages_by_token_count(inputs, 18);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].as_tool_call().unwrap().call_id, "c1");
        assert_eq!(kept[1].as_tool_output().unwrap().call_id, "c1");
        assert_eq!(
            kept[2].input_message.as_ref().unwrap().contents[0]
                .text_item
                .as_ref()
                .unwrap()
                .text,
            "B"
        );
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(filter_messages_by_token_count(Vec::new(), 10).is_empty());
    }
}
