//! Per-request mapping between caller-supplied tool-choice ids and the
//! vendor-visible tool names.
//!
//! Vendor APIs deduplicate tools by name, so the mapping must too: within one
//! request the derived names form a 1:1 relation with tool choices, and
//! duplicates lose to the first occurrence.

use std::collections::HashMap;

use tracing::debug;

use crate::types::{ToolChoice, ToolType, DEFAULT_WEB_SEARCH_TOOL_NAME};

/// A tool choice paired with the vendor-visible name derived for it.
#[derive(Debug, Clone)]
pub struct NamedToolChoice {
    pub name: String,
    pub choice: ToolChoice,
}

/// Derives vendor-visible names for each tool choice and returns them in
/// request order along with a name-to-choice lookup used by decoders to map
/// vendor calls back to `choice_id`s.
pub fn build_tool_choice_name_mapping(
    tool_choices: &[ToolChoice],
) -> (Vec<NamedToolChoice>, HashMap<String, ToolChoice>) {
    let mut ordered = Vec::with_capacity(tool_choices.len());
    let mut name_map = HashMap::with_capacity(tool_choices.len());

    for tc in tool_choices {
        let name = vendor_visible_name(tc);
        if name.is_empty() {
            continue;
        }
        if name_map.contains_key(&name) {
            debug!(name, choice_id = %tc.id, "dropping tool choice with duplicate vendor name");
            continue;
        }
        name_map.insert(name.clone(), tc.clone());
        ordered.push(NamedToolChoice {
            name,
            choice: tc.clone(),
        });
    }

    (ordered, name_map)
}

fn vendor_visible_name(tc: &ToolChoice) -> String {
    if tc.tool_type == ToolType::WebSearch {
        return DEFAULT_WEB_SEARCH_TOOL_NAME.to_string();
    }
    let name = tc.name.trim();
    if !name.is_empty() {
        return name.to_string();
    }
    tc.id.trim().to_string()
}

/// Description sent to the vendor, falling back to the name and then the id
/// so the model always sees something identifying.
pub fn tool_description(tc: &ToolChoice) -> String {
    let desc = tc.description.trim();
    if !desc.is_empty() {
        return desc.to_string();
    }
    let name = tc.name.trim();
    if !name.is_empty() {
        return name.to_string();
    }
    tc.id.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn choice(id: &str, name: &str, tool_type: ToolType) -> ToolChoice {
        ToolChoice {
            id: id.into(),
            tool_type,
            name: name.into(),
            description: String::new(),
            arguments: Some(serde_json::Map::new()),
            web_search_arguments: None,
        }
    }

    #[test]
    fn prefers_name_then_id() {
        let (ordered, map) = build_tool_choice_name_mapping(&[
            choice("id-1", "lookup", ToolType::Function),
            choice("id-2", "", ToolType::Function),
        ]);
        assert_eq!(ordered.len(), 2);
        assert_eq!(ordered[0].name, "lookup");
        assert_eq!(ordered[1].name, "id-2");
        assert_eq!(map["lookup"].id, "id-1");
        assert_eq!(map["id-2"].id, "id-2");
    }

    #[test]
    fn web_search_uses_constant_name() {
        let (ordered, map) = build_tool_choice_name_mapping(&[choice(
            "ws-1",
            "ignored",
            ToolType::WebSearch,
        )]);
        assert_eq!(ordered[0].name, DEFAULT_WEB_SEARCH_TOOL_NAME);
        assert_eq!(map[DEFAULT_WEB_SEARCH_TOOL_NAME].id, "ws-1");
    }

    #[test]
    fn duplicate_names_first_wins() {
        let (ordered, map) = build_tool_choice_name_mapping(&[
            choice("id-1", "dup", ToolType::Function),
            choice("id-2", "dup", ToolType::Function),
            choice("id-3", "other", ToolType::Function),
        ]);
        assert_eq!(ordered.len(), 2);
        assert_eq!(map["dup"].id, "id-1");

        // The mapping is a partial injection: ids are unique over the map.
        let mut ids: Vec<&str> = map.values().map(|c| c.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), map.len());
    }

    #[test]
    fn nameless_idless_choice_is_dropped() {
        let (ordered, map) = build_tool_choice_name_mapping(&[choice("", "", ToolType::Function)]);
        assert!(ordered.is_empty());
        assert!(map.is_empty());
    }

    #[test]
    fn description_fallback_chain() {
        let mut tc = choice("id-9", "named", ToolType::Function);
        tc.description = "does things".into();
        assert_eq!(tool_description(&tc), "does things");
        tc.description.clear();
        assert_eq!(tool_description(&tc), "named");
        tc.name.clear();
        assert_eq!(tool_description(&tc), "id-9");
    }
}
