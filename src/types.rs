//! Canonical request/response data model shared by all provider adapters.
//!
//! Every union type is represented as a `kind` discriminator plus one optional
//! payload field per variant. Decoders treat a union whose payload does not
//! match its `kind` as empty and drop it. The serialized shape of the types in
//! this file is a versioned data contract; see [`crate::contract`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default MIME type assumed for image data without an explicit MIME.
pub const DEFAULT_IMAGE_DATA_MIME: &str = "image/jpeg";
/// Default MIME type assumed for file data without an explicit MIME.
pub const DEFAULT_FILE_DATA_MIME: &str = "application/pdf";
/// Standard bearer-token authorization header.
pub const DEFAULT_AUTHORIZATION_HEADER_KEY: &str = "Authorization";
/// Anthropic's native API key header.
pub const DEFAULT_ANTHROPIC_AUTHORIZATION_HEADER_KEY: &str = "x-api-key";
/// Vendor-visible name used for web-search tool choices.
pub const DEFAULT_WEB_SEARCH_TOOL_NAME: &str = "web_search";

pub const DEFAULT_ANTHROPIC_ORIGIN: &str = "https://api.anthropic.com";
pub const DEFAULT_OPENAI_ORIGIN: &str = "https://api.openai.com/v1";

/// Per-request timeout applied when `ModelParam.timeout` is zero.
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(120);

/// Vendor SDK flavor a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderSdkType {
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "openaiChat")]
    OpenAiChatCompletions,
    #[serde(rename = "openaiResponses")]
    OpenAiResponses,
}

/// Configuration identifying one upstream provider endpoint.
///
/// Owned by the registry; adapters receive a snapshot copy per request so
/// in-flight calls are unaffected by concurrent key rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderParam {
    pub name: String,
    pub sdk_type: ProviderSdkType,
    pub origin: String,
    #[serde(default)]
    pub chat_completion_path_prefix: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default)]
    pub api_key_header_key: String,
    #[serde(default)]
    pub default_headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReasoningType {
    #[serde(rename = "hybridWithTokens")]
    HybridWithTokens,
    #[serde(rename = "singleWithLevels")]
    SingleWithLevels,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningLevel {
    None,
    Minimal,
    Low,
    Medium,
    High,
    XHigh,
}

impl ReasoningLevel {
    /// Wire value used by OpenAI `reasoning_effort` / `reasoning.effort`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningLevel::None => "none",
            ReasoningLevel::Minimal => "minimal",
            ReasoningLevel::Low => "low",
            ReasoningLevel::Medium => "medium",
            ReasoningLevel::High => "high",
            ReasoningLevel::XHigh => "xhigh",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningParam {
    #[serde(rename = "type")]
    pub reasoning_type: ReasoningType,
    #[serde(default)]
    pub level: Option<ReasoningLevel>,
    #[serde(default)]
    pub tokens: i64,
}

/// Model-level knobs for a single completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelParam {
    pub name: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub max_prompt_length: i64,
    #[serde(default)]
    pub max_output_length: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningParam>,
    #[serde(default)]
    pub system_prompt: String,
    /// Request timeout in seconds; 0 means the library default.
    #[serde(default)]
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_parameters_raw_json: Option<String>,
}

impl ModelParam {
    pub fn request_timeout(&self) -> Duration {
        if self.timeout > 0 {
            Duration::from_secs(self.timeout)
        } else {
            DEFAULT_API_TIMEOUT
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    InProgress,
    #[default]
    Completed,
    Incomplete,
    Failed,
}

impl Status {
    /// Wire value used by the OpenAI APIs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::InProgress => "in_progress",
            Status::Completed => "completed",
            Status::Incomplete => "incomplete",
            Status::Failed => "failed",
        }
    }

    pub fn from_wire(s: &str) -> Status {
        match s {
            "in_progress" => Status::InProgress,
            "incomplete" => Status::Incomplete,
            "failed" => Status::Failed,
            _ => Status::Completed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
    #[serde(rename = "custom")]
    Custom,
    #[serde(rename = "webSearch")]
    WebSearch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageDetail {
    #[default]
    Auto,
    Low,
    High,
}

impl ImageDetail {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageDetail::Auto => "auto",
            ImageDetail::Low => "low",
            ImageDetail::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CitationKind {
    #[serde(rename = "url")]
    Url,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlCitation {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub start_index: i64,
    #[serde(default)]
    pub end_index: i64,
    #[serde(default)]
    pub cited_text: String,
    #[serde(default)]
    pub encrypted_index: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub kind: CitationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_citation: Option<UrlCitation>,
}

impl Citation {
    pub fn url(c: UrlCitation) -> Citation {
        Citation {
            kind: CitationKind::Url,
            url_citation: Some(c),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItemText {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItemImage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub image_name: String,
    /// Base64-encoded image bytes (without a data-URL prefix).
    #[serde(default)]
    pub image_data: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub image_mime: String,
    #[serde(default)]
    pub detail: ImageDetail,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItemFile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub file_name: String,
    /// Base64-encoded file bytes (without a data-URL prefix).
    #[serde(default)]
    pub file_data: String,
    #[serde(default)]
    pub file_url: String,
    #[serde(default)]
    pub file_mime: String,
    #[serde(default)]
    pub additional_context: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItemRefusal {
    pub refusal: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentItemKind {
    Text,
    Image,
    File,
    Refusal,
}

/// One content item of a user or assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItemUnion {
    pub kind: ContentItemKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_item: Option<ContentItemText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_item: Option<ContentItemImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_item: Option<ContentItemFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refusal_item: Option<ContentItemRefusal>,
}

impl ContentItemUnion {
    pub fn text(text: impl Into<String>) -> ContentItemUnion {
        ContentItemUnion {
            kind: ContentItemKind::Text,
            text_item: Some(ContentItemText {
                text: text.into(),
                citations: Vec::new(),
            }),
            image_item: None,
            file_item: None,
            refusal_item: None,
        }
    }

    pub fn text_with_citations(text: impl Into<String>, citations: Vec<Citation>) -> ContentItemUnion {
        ContentItemUnion {
            kind: ContentItemKind::Text,
            text_item: Some(ContentItemText {
                text: text.into(),
                citations,
            }),
            image_item: None,
            file_item: None,
            refusal_item: None,
        }
    }

    pub fn image(item: ContentItemImage) -> ContentItemUnion {
        ContentItemUnion {
            kind: ContentItemKind::Image,
            text_item: None,
            image_item: Some(item),
            file_item: None,
            refusal_item: None,
        }
    }

    pub fn file(item: ContentItemFile) -> ContentItemUnion {
        ContentItemUnion {
            kind: ContentItemKind::File,
            text_item: None,
            image_item: None,
            file_item: Some(item),
            refusal_item: None,
        }
    }

    pub fn refusal(refusal: impl Into<String>) -> ContentItemUnion {
        ContentItemUnion {
            kind: ContentItemKind::Refusal,
            text_item: None,
            image_item: None,
            file_item: None,
            refusal_item: Some(ContentItemRefusal {
                refusal: refusal.into(),
            }),
        }
    }
}

/// A user input message or a prior-turn assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputOutputContent {
    #[serde(default)]
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub contents: Vec<ContentItemUnion>,
}

/// Assistant reasoning carried across turns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningContent {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_assistant_role")]
    pub role: Role,
    #[serde(default)]
    pub status: Status,
    /// Anthropic-style signature validating `thinking` for replay.
    #[serde(default)]
    pub signature: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thinking: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redacted_thinking: Vec<String>,
    /// OpenAI Responses encrypted reasoning payloads (opaque).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub encrypted_content: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub summary: Vec<String>,
}

fn default_assistant_role() -> Role {
    Role::Assistant
}

impl ReasoningContent {
    pub fn first_non_empty_encrypted(&self) -> Option<&str> {
        self.encrypted_content
            .iter()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
    }
}

impl Default for Role {
    fn default() -> Self {
        Role::User
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WebSearchToolCallKind {
    Search,
    OpenPage,
    Find,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSearchToolCallSearchSource {
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSearchToolCallSearch {
    #[serde(default)]
    pub query: String,
    /// Raw provider input payload, preserved so nothing is lost when the
    /// upstream shape grows beyond `query`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<WebSearchToolCallSearchSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSearchToolCallOpenPage {
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSearchToolCallFind {
    pub pattern: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSearchToolCallItemUnion {
    pub kind: WebSearchToolCallKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_item: Option<WebSearchToolCallSearch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_page_item: Option<WebSearchToolCallOpenPage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub find_item: Option<WebSearchToolCallFind>,
}

impl WebSearchToolCallItemUnion {
    pub fn search(item: WebSearchToolCallSearch) -> Self {
        WebSearchToolCallItemUnion {
            kind: WebSearchToolCallKind::Search,
            search_item: Some(item),
            open_page_item: None,
            find_item: None,
        }
    }

    pub fn open_page(url: impl Into<String>) -> Self {
        WebSearchToolCallItemUnion {
            kind: WebSearchToolCallKind::OpenPage,
            search_item: None,
            open_page_item: Some(WebSearchToolCallOpenPage { url: url.into() }),
            find_item: None,
        }
    }

    pub fn find(pattern: impl Into<String>, url: impl Into<String>) -> Self {
        WebSearchToolCallItemUnion {
            kind: WebSearchToolCallKind::Find,
            search_item: None,
            open_page_item: None,
            find_item: Some(WebSearchToolCallFind {
                pattern: pattern.into(),
                url: url.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WebSearchToolOutputKind {
    Search,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSearchToolOutputSearch {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub encrypted_content: String,
    #[serde(default)]
    pub page_age: String,
    #[serde(default)]
    pub rendered_content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSearchToolOutputError {
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSearchToolOutputItemUnion {
    pub kind: WebSearchToolOutputKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_item: Option<WebSearchToolOutputSearch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_item: Option<WebSearchToolOutputError>,
}

impl WebSearchToolOutputItemUnion {
    pub fn search(item: WebSearchToolOutputSearch) -> Self {
        WebSearchToolOutputItemUnion {
            kind: WebSearchToolOutputKind::Search,
            search_item: Some(item),
            error_item: None,
        }
    }

    pub fn error(code: impl Into<String>) -> Self {
        WebSearchToolOutputItemUnion {
            kind: WebSearchToolOutputKind::Error,
            search_item: None,
            error_item: Some(WebSearchToolOutputError { code: code.into() }),
        }
    }
}

/// A tool invocation requested by the model.
///
/// `choice_id` must reference a [`ToolChoice`] present in the same request;
/// decoders drop calls they cannot map back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(default)]
    pub choice_id: String,
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    #[serde(default = "default_assistant_role")]
    pub role: Role,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub call_id: String,
    #[serde(default)]
    pub name: String,
    /// Raw JSON text of the call arguments.
    #[serde(default)]
    pub arguments: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub web_search_tool_call_items: Vec<WebSearchToolCallItemUnion>,
}

/// The result of a tool invocation, fed back as input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutput {
    #[serde(default)]
    pub choice_id: String,
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub call_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contents: Vec<ContentItemUnion>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub web_search_tool_output_items: Vec<WebSearchToolOutputItemUnion>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSearchUserLocation {
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub timezone: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSearchToolChoiceItem {
    /// One of "low", "medium", "high"; unset/invalid defaults to "medium".
    #[serde(default)]
    pub search_context_size: String,
    #[serde(default)]
    pub max_uses: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_location: Option<WebSearchUserLocation>,
}

/// A tool definition made available to the model for one request.
///
/// `id` is caller-supplied and opaque; `name` is the vendor-visible symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolChoice {
    pub id: String,
    #[serde(rename = "type", default = "ToolChoice::default_type")]
    pub tool_type: ToolType,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema object describing the call arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search_arguments: Option<WebSearchToolChoiceItem>,
}

impl ToolChoice {
    fn default_type() -> ToolType {
        ToolType::Function
    }
}

impl Default for ToolType {
    fn default() -> Self {
        ToolType::Function
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InputKind {
    InputMessage,
    OutputMessage,
    ReasoningMessage,
    FunctionToolCall,
    CustomToolCall,
    WebSearchToolCall,
    FunctionToolOutput,
    CustomToolOutput,
    WebSearchToolOutput,
}

/// One element of the interleaved request input sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputUnion {
    pub kind: InputKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_message: Option<InputOutputContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_message: Option<InputOutputContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_message: Option<ReasoningContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_tool_call: Option<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_tool_call: Option<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search_tool_call: Option<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_tool_output: Option<ToolOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_tool_output: Option<ToolOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search_tool_output: Option<ToolOutput>,
}

impl InputUnion {
    fn blank(kind: InputKind) -> InputUnion {
        InputUnion {
            kind,
            input_message: None,
            output_message: None,
            reasoning_message: None,
            function_tool_call: None,
            custom_tool_call: None,
            web_search_tool_call: None,
            function_tool_output: None,
            custom_tool_output: None,
            web_search_tool_output: None,
        }
    }

    pub fn input_message(msg: InputOutputContent) -> InputUnion {
        let mut u = Self::blank(InputKind::InputMessage);
        u.input_message = Some(msg);
        u
    }

    /// Convenience constructor for a plain user text message.
    pub fn user_text(text: impl Into<String>) -> InputUnion {
        Self::input_message(InputOutputContent {
            id: String::new(),
            role: Role::User,
            status: Status::Completed,
            contents: vec![ContentItemUnion::text(text)],
        })
    }

    pub fn output_message(msg: InputOutputContent) -> InputUnion {
        let mut u = Self::blank(InputKind::OutputMessage);
        u.output_message = Some(msg);
        u
    }

    pub fn reasoning_message(msg: ReasoningContent) -> InputUnion {
        let mut u = Self::blank(InputKind::ReasoningMessage);
        u.reasoning_message = Some(msg);
        u
    }

    pub fn tool_call(call: ToolCall) -> InputUnion {
        match call.tool_type {
            ToolType::Function => {
                let mut u = Self::blank(InputKind::FunctionToolCall);
                u.function_tool_call = Some(call);
                u
            }
            ToolType::Custom => {
                let mut u = Self::blank(InputKind::CustomToolCall);
                u.custom_tool_call = Some(call);
                u
            }
            ToolType::WebSearch => {
                let mut u = Self::blank(InputKind::WebSearchToolCall);
                u.web_search_tool_call = Some(call);
                u
            }
        }
    }

    pub fn tool_output(output: ToolOutput) -> InputUnion {
        match output.tool_type {
            ToolType::Function => {
                let mut u = Self::blank(InputKind::FunctionToolOutput);
                u.function_tool_output = Some(output);
                u
            }
            ToolType::Custom => {
                let mut u = Self::blank(InputKind::CustomToolOutput);
                u.custom_tool_output = Some(output);
                u
            }
            ToolType::WebSearch => {
                let mut u = Self::blank(InputKind::WebSearchToolOutput);
                u.web_search_tool_output = Some(output);
                u
            }
        }
    }

    /// Payload matching the declared `kind`, if present.
    pub fn as_tool_call(&self) -> Option<&ToolCall> {
        match self.kind {
            InputKind::FunctionToolCall => self.function_tool_call.as_ref(),
            InputKind::CustomToolCall => self.custom_tool_call.as_ref(),
            InputKind::WebSearchToolCall => self.web_search_tool_call.as_ref(),
            _ => None,
        }
    }

    pub fn as_tool_output(&self) -> Option<&ToolOutput> {
        match self.kind {
            InputKind::FunctionToolOutput => self.function_tool_output.as_ref(),
            InputKind::CustomToolOutput => self.custom_tool_output.as_ref(),
            InputKind::WebSearchToolOutput => self.web_search_tool_output.as_ref(),
            _ => None,
        }
    }

    /// True when the variant payload is absent or does not match `kind`.
    pub fn is_empty(&self) -> bool {
        match self.kind {
            InputKind::InputMessage => self.input_message.is_none(),
            InputKind::OutputMessage => self.output_message.is_none(),
            InputKind::ReasoningMessage => self.reasoning_message.is_none(),
            InputKind::FunctionToolCall => self.function_tool_call.is_none(),
            InputKind::CustomToolCall => self.custom_tool_call.is_none(),
            InputKind::WebSearchToolCall => self.web_search_tool_call.is_none(),
            InputKind::FunctionToolOutput => self.function_tool_output.is_none(),
            InputKind::CustomToolOutput => self.custom_tool_output.is_none(),
            InputKind::WebSearchToolOutput => self.web_search_tool_output.is_none(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutputKind {
    OutputMessage,
    ReasoningMessage,
    FunctionToolCall,
    CustomToolCall,
    WebSearchToolCall,
    WebSearchToolOutput,
}

/// One element of a normalized completion response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputUnion {
    pub kind: OutputKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_message: Option<InputOutputContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_message: Option<ReasoningContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_tool_call: Option<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_tool_call: Option<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search_tool_call: Option<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search_tool_output: Option<ToolOutput>,
}

impl OutputUnion {
    fn blank(kind: OutputKind) -> OutputUnion {
        OutputUnion {
            kind,
            output_message: None,
            reasoning_message: None,
            function_tool_call: None,
            custom_tool_call: None,
            web_search_tool_call: None,
            web_search_tool_output: None,
        }
    }

    pub fn output_message(msg: InputOutputContent) -> OutputUnion {
        let mut u = Self::blank(OutputKind::OutputMessage);
        u.output_message = Some(msg);
        u
    }

    pub fn reasoning_message(msg: ReasoningContent) -> OutputUnion {
        let mut u = Self::blank(OutputKind::ReasoningMessage);
        u.reasoning_message = Some(msg);
        u
    }

    pub fn tool_call(call: ToolCall) -> OutputUnion {
        match call.tool_type {
            ToolType::Function => {
                let mut u = Self::blank(OutputKind::FunctionToolCall);
                u.function_tool_call = Some(call);
                u
            }
            ToolType::Custom => {
                let mut u = Self::blank(OutputKind::CustomToolCall);
                u.custom_tool_call = Some(call);
                u
            }
            ToolType::WebSearch => {
                let mut u = Self::blank(OutputKind::WebSearchToolCall);
                u.web_search_tool_call = Some(call);
                u
            }
        }
    }

    pub fn web_search_tool_output(output: ToolOutput) -> OutputUnion {
        let mut u = Self::blank(OutputKind::WebSearchToolOutput);
        u.web_search_tool_output = Some(output);
        u
    }

    pub fn as_tool_call(&self) -> Option<&ToolCall> {
        match self.kind {
            OutputKind::FunctionToolCall => self.function_tool_call.as_ref(),
            OutputKind::CustomToolCall => self.custom_tool_call.as_ref(),
            OutputKind::WebSearchToolCall => self.web_search_tool_call.as_ref(),
            _ => None,
        }
    }
}

/// Normalized token accounting.
///
/// Invariant: `input_tokens_uncached == max(input_tokens_total - input_tokens_cached, 0)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default)]
    pub input_tokens_total: i64,
    #[serde(default)]
    pub input_tokens_cached: i64,
    #[serde(default)]
    pub input_tokens_uncached: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub reasoning_tokens: i64,
}

/// Error payload carried inside a response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchCompletionRequest {
    pub model_param: ModelParam,
    #[serde(default)]
    pub inputs: Vec<InputUnion>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_choices: Vec<ToolChoice>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchCompletionResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputUnion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// Opaque debug blob; see the debug module for the shape guaranteed to tests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_details: Option<serde_json::Value>,
}

/// Failure carrying any partial response captured before the error.
///
/// Transport and stream failures still produce usage and debug details; both
/// travel with the error so callers never lose the partial result.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct CompletionError {
    pub message: String,
    pub response: Option<Box<FetchCompletionResponse>>,
}

impl CompletionError {
    pub fn new(message: impl Into<String>) -> CompletionError {
        CompletionError {
            message: message.into(),
            response: None,
        }
    }

    pub fn with_response(
        message: impl Into<String>,
        response: FetchCompletionResponse,
    ) -> CompletionError {
        CompletionError {
            message: message.into(),
            response: Some(Box::new(response)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamContentKind {
    Text,
    Thinking,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamTextChunk {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamThinkingChunk {
    pub text: String,
}

/// One event delivered to the caller's stream handler.
///
/// Exactly one of `text` / `thinking` is set, determined by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub kind: StreamContentKind,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<StreamTextChunk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<StreamThinkingChunk>,
}

impl StreamEvent {
    pub fn text(provider: impl Into<String>, model: impl Into<String>, text: impl Into<String>) -> StreamEvent {
        StreamEvent {
            kind: StreamContentKind::Text,
            provider: provider.into(),
            model: model.into(),
            text: Some(StreamTextChunk { text: text.into() }),
            thinking: None,
        }
    }

    pub fn thinking(
        provider: impl Into<String>,
        model: impl Into<String>,
        text: impl Into<String>,
    ) -> StreamEvent {
        StreamEvent {
            kind: StreamContentKind::Thinking,
            provider: provider.into(),
            model: model.into(),
            text: None,
            thinking: Some(StreamThinkingChunk { text: text.into() }),
        }
    }
}

/// Callback invoked with incremental stream events. Returning an error stops
/// streaming early and propagates the error to the caller.
pub type StreamHandler = Arc<dyn Fn(StreamEvent) -> anyhow::Result<()> + Send + Sync>;

/// Low-level streaming knobs; zero values mean library defaults.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    #[serde(default)]
    pub flush_interval_millis: u64,
    #[serde(default)]
    pub flush_chunk_size: usize,
}

/// Optional behaviors for a fetch. The default value streams nothing.
#[derive(Clone, Default)]
pub struct FetchCompletionOptions {
    pub stream_handler: Option<StreamHandler>,
    pub stream_config: Option<StreamConfig>,
}

impl std::fmt::Debug for FetchCompletionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchCompletionOptions")
            .field("stream_handler", &self.stream_handler.is_some())
            .field("stream_config", &self.stream_config)
            .finish()
    }
}
