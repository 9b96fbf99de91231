//! Anthropic Messages API adapter.
//!
//! Translates the canonical model to and from the Messages wire protocol,
//! including thinking blocks, server-side web search, and SSE streaming.

mod thinking;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::client::{
    apply_additional_parameters, read_body_with_debug, send_request, EndpointClient,
};
use crate::debug::{DebugSpan, HttpDebugger};
use crate::streaming::{stream_emit, BufferedStreamer, ResolvedStreamConfig, SseLineScanner};
use crate::CompletionProvider;
use crate::tool_mapping::{build_tool_choice_name_mapping, tool_description};
use crate::types::*;

use thinking::resolve_thinking;

const MESSAGES_PATH: &str = "v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const WEB_SEARCH_TOOL_TYPE: &str = "web_search_20250305";

/// `CompletionProvider` for the Anthropic Messages API.
pub struct AnthropicMessagesApi {
    state: RwLock<ProviderState>,
    debugger: Option<Arc<HttpDebugger>>,
}

struct ProviderState {
    param: ProviderParam,
    client: Option<EndpointClient>,
}

impl AnthropicMessagesApi {
    pub fn new(
        param: ProviderParam,
        debugger: Option<Arc<HttpDebugger>>,
    ) -> Result<AnthropicMessagesApi> {
        if param.name.is_empty() || param.origin.is_empty() {
            anyhow::bail!("anthropic messages api: invalid args");
        }
        Ok(AnthropicMessagesApi {
            state: RwLock::new(ProviderState {
                param,
                client: None,
            }),
            debugger,
        })
    }

    fn snapshot(&self) -> (ProviderParam, Option<EndpointClient>) {
        let state = self.state.read().unwrap();
        (state.param.clone(), state.client.clone())
    }

    fn auth_headers(param: &ProviderParam) -> Vec<(String, String)> {
        let mut headers = vec![
            (
                DEFAULT_ANTHROPIC_AUTHORIZATION_HEADER_KEY.to_string(),
                param.api_key.clone(),
            ),
            ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
        ];
        let custom = param.api_key_header_key.trim();
        if !custom.is_empty()
            && !custom.eq_ignore_ascii_case(DEFAULT_ANTHROPIC_AUTHORIZATION_HEADER_KEY)
            && !custom.eq_ignore_ascii_case(DEFAULT_AUTHORIZATION_HEADER_KEY)
        {
            headers.push((custom.to_string(), param.api_key.clone()));
        }
        headers
    }

    async fn do_non_streaming(
        &self,
        client: &EndpointClient,
        param: &ProviderParam,
        body: Value,
        timeout: Duration,
        name_map: &std::collections::HashMap<String, ToolChoice>,
    ) -> Result<FetchCompletionResponse, CompletionError> {
        let span = self.debugger.as_ref().map(|d| d.start_span());

        let request = match build_post(client, param, &body, timeout, false) {
            Ok(r) => r,
            Err(e) => return Err(CompletionError::new(e.to_string())),
        };

        let mut resp = FetchCompletionResponse::default();
        let response = match send_request(&client.http, request, span.as_ref()).await {
            Ok(r) => r,
            Err(e) => {
                return Err(self.fail(resp, span.as_deref(), None, e.to_string(), false));
            }
        };

        let bytes = match read_body_with_debug(response, span.as_ref()).await {
            Ok(b) => b,
            Err(e) => {
                return Err(self.fail(resp, span.as_deref(), None, e.to_string(), false));
            }
        };

        let message: MessagesResponse = match serde_json::from_slice(&bytes) {
            Ok(m) => m,
            Err(e) => {
                return Err(self.fail(
                    resp,
                    span.as_deref(),
                    None,
                    format!("failed to parse response: {e}"),
                    false,
                ));
            }
        };

        let is_nil_resp = message.content.is_empty();
        let full = serde_json::to_value(&message).ok();
        if let Some(d) = &self.debugger {
            resp.debug_details =
                d.build_debug_details(span.as_deref(), full.as_ref(), None, is_nil_resp);
        }
        resp.usage = Some(usage_from_message(&message));
        if !is_nil_resp {
            resp.outputs = outputs_from_message(&message, name_map);
        }
        Ok(resp)
    }

    #[allow(clippy::too_many_arguments)]
    async fn do_streaming(
        &self,
        client: &EndpointClient,
        param: &ProviderParam,
        model: &str,
        body: Value,
        timeout: Duration,
        opts: &FetchCompletionOptions,
        name_map: &std::collections::HashMap<String, ToolChoice>,
    ) -> Result<FetchCompletionResponse, CompletionError> {
        let span = self.debugger.as_ref().map(|d| d.start_span());
        let stream_cfg = ResolvedStreamConfig::from_options(opts);

        let text_emit = stream_emit(
            opts.stream_handler.clone(),
            StreamContentKind::Text,
            param.name.clone(),
            model.to_string(),
        );
        let thinking_emit = stream_emit(
            opts.stream_handler.clone(),
            StreamContentKind::Thinking,
            param.name.clone(),
            model.to_string(),
        );
        let text_streamer =
            BufferedStreamer::new(text_emit, stream_cfg.flush_interval, stream_cfg.flush_chunk_size);
        let thinking_streamer = BufferedStreamer::new(
            thinking_emit,
            stream_cfg.flush_interval,
            stream_cfg.flush_chunk_size,
        );

        let request = match build_post(client, param, &body, timeout, true) {
            Ok(r) => r,
            Err(e) => return Err(CompletionError::new(e.to_string())),
        };

        let mut resp = FetchCompletionResponse::default();
        let mut response = match send_request(&client.http, request, span.as_ref()).await {
            Ok(r) => r,
            Err(e) => {
                text_streamer.flush();
                thinking_streamer.flush();
                return Err(self.fail(resp, span.as_deref(), None, e.to_string(), false));
            }
        };

        let mut scanner = SseLineScanner::new();
        let mut acc = MessageAccumulator::default();
        let mut stream_err: Option<String> = None;

        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if let Some(span) = &span {
                        span.append_response_body(&chunk);
                    }
                    let res = scanner.push(&chunk, |line| {
                        handle_sse_line(line, &mut acc, &text_streamer, &thinking_streamer)
                    });
                    if let Err(e) = res {
                        stream_err = Some(e.to_string());
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    stream_err = Some(format!("stream read failed: {e}"));
                    break;
                }
            }
        }
        if stream_err.is_none() {
            if let Err(e) = scanner.finish(|line| {
                handle_sse_line(line, &mut acc, &text_streamer, &thinking_streamer)
            }) {
                stream_err = Some(e.to_string());
            }
        }

        text_streamer.flush();
        thinking_streamer.flush();
        if let Some(span) = &span {
            span.finalize_response_body();
        }

        let message = acc.into_message();
        let is_nil_resp = message.content.is_empty();
        let full = serde_json::to_value(&message).ok();
        if let Some(d) = &self.debugger {
            resp.debug_details = d.build_debug_details(
                span.as_deref(),
                full.as_ref(),
                stream_err.as_deref(),
                is_nil_resp,
            );
        }
        resp.usage = Some(usage_from_message(&message));
        if !is_nil_resp {
            resp.outputs = outputs_from_message(&message, name_map);
        }

        match stream_err {
            Some(msg) => {
                resp.error = Some(ErrorDetail { message: msg.clone() });
                Err(CompletionError::with_response(msg, resp))
            }
            None => Ok(resp),
        }
    }

    /// Wraps a failure, attaching usage and debug details to the partial
    /// response travelling inside the error.
    fn fail(
        &self,
        mut resp: FetchCompletionResponse,
        span: Option<&DebugSpan>,
        full: Option<&Value>,
        message: String,
        is_nil_resp: bool,
    ) -> CompletionError {
        if let Some(d) = &self.debugger {
            resp.debug_details = d.build_debug_details(span, full, Some(&message), is_nil_resp);
        }
        if resp.usage.is_none() {
            resp.usage = Some(Usage::default());
        }
        resp.error = Some(ErrorDetail {
            message: message.clone(),
        });
        CompletionError::with_response(message, resp)
    }
}

fn build_post(
    client: &EndpointClient,
    param: &ProviderParam,
    body: &Value,
    timeout: Duration,
    streaming: bool,
) -> Result<reqwest::Request> {
    let mut builder = client
        .http
        .post(&client.endpoint)
        .timeout(timeout)
        .header(
            "accept",
            if streaming {
                "text/event-stream"
            } else {
                "application/json"
            },
        )
        .json(body);
    for (k, v) in AnthropicMessagesApi::auth_headers(param) {
        builder = builder.header(k, v);
    }
    Ok(builder.build()?)
}

#[async_trait]
impl CompletionProvider for AnthropicMessagesApi {
    async fn init_llm(&self) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if state.param.api_key.is_empty() {
            debug!(name = %state.param.name, "no API key given; not initializing client");
            return Ok(());
        }
        let client = EndpointClient::new(&state.param, MESSAGES_PATH)?;
        info!(name = %state.param.name, url = %client.endpoint, "anthropic messages provider initialized");
        state.client = Some(client);
        Ok(())
    }

    async fn deinit_llm(&self) -> Result<()> {
        let mut state = self.state.write().unwrap();
        state.client = None;
        info!(name = %state.param.name, "anthropic messages provider deinitialized");
        Ok(())
    }

    fn provider_info(&self) -> ProviderParam {
        self.state.read().unwrap().param.clone()
    }

    fn is_configured(&self) -> bool {
        !self.state.read().unwrap().param.api_key.is_empty()
    }

    fn set_api_key(&self, api_key: &str) -> Result<()> {
        self.state.write().unwrap().param.api_key = api_key.trim().to_string();
        Ok(())
    }

    async fn fetch_completion(
        &self,
        request: FetchCompletionRequest,
        opts: FetchCompletionOptions,
    ) -> Result<FetchCompletionResponse, CompletionError> {
        let (param, client) = self.snapshot();
        let Some(client) = client else {
            return Err(CompletionError::new(
                "anthropic messages api: client not initialized",
            ));
        };
        if request.inputs.is_empty() || request.model_param.name.is_empty() {
            return Err(CompletionError::new(
                "anthropic messages api: empty completion data",
            ));
        }

        let mp = &request.model_param;
        let decision = resolve_thinking(mp, &request.inputs);
        let (messages, system) = to_messages_input(&mp.system_prompt, &request.inputs);

        let (tools, name_map) = tool_choices_to_tools(&request.tool_choices);

        let wire = MessagesRequest {
            model: mp.name.clone(),
            max_tokens: mp.max_output_length,
            messages,
            system,
            // Temperature must be omitted while thinking is enabled.
            temperature: if decision.enabled { None } else { mp.temperature },
            thinking: decision
                .enabled
                .then_some(ThinkingConfigParam::Enabled {
                    budget_tokens: decision.budget,
                }),
            tools,
            stream: mp.stream && opts.stream_handler.is_some(),
        };

        let body = match serde_json::to_value(&wire) {
            Ok(v) => apply_additional_parameters(v, mp.additional_parameters_raw_json.as_deref()),
            Err(e) => return Err(CompletionError::new(format!("encode request: {e}"))),
        };

        let timeout = mp.request_timeout();
        if wire.stream {
            self.do_streaming(&client, &param, &mp.name, body, timeout, &opts, &name_map)
                .await
        } else {
            self.do_non_streaming(&client, &param, body, timeout, &name_map)
                .await
        }
    }
}

// --- Wire shapes (request) ---

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: i64,
    messages: Vec<MessageParam>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<Vec<SystemBlockParam>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<ThinkingConfigParam>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefParam>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct SystemBlockParam {
    #[serde(rename = "type")]
    block_type: &'static str,
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ThinkingConfigParam {
    Enabled { budget_tokens: i64 },
}

#[derive(Debug, Serialize)]
struct MessageParam {
    role: &'static str,
    content: Vec<ContentBlockParam>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlockParam {
    Text {
        text: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        citations: Vec<TextCitationParam>,
    },
    Image {
        source: MediaSourceParam,
    },
    Document {
        source: MediaSourceParam,
    },
    Thinking {
        thinking: String,
        signature: String,
    },
    RedactedThinking {
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ServerToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Vec<ToolResultBlockParam>,
        is_error: bool,
    },
    WebSearchToolResult {
        tool_use_id: String,
        content: Value,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum MediaSourceParam {
    Base64 {
        media_type: String,
        data: String,
    },
    Url {
        url: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ToolResultBlockParam {
    Text {
        text: String,
    },
    Image {
        source: MediaSourceParam,
    },
    Document {
        source: MediaSourceParam,
    },
}

#[derive(Debug, Serialize)]
struct TextCitationParam {
    #[serde(rename = "type")]
    citation_type: &'static str,
    url: String,
    title: String,
    cited_text: String,
    encrypted_index: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ToolDefParam {
    Client {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        input_schema: Value,
    },
    WebSearch(WebSearchToolDefParam),
}

#[derive(Debug, Serialize)]
struct WebSearchToolDefParam {
    #[serde(rename = "type")]
    tool_type: &'static str,
    name: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    allowed_domains: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    blocked_domains: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_uses: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_location: Option<WebSearchUserLocationParam>,
}

#[derive(Debug, Serialize)]
struct WebSearchUserLocationParam {
    #[serde(rename = "type")]
    location_type: &'static str,
    city: String,
    country: String,
    region: String,
    timezone: String,
}

// --- Wire shapes (response) ---

#[derive(Debug, Default, Serialize, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    content: Vec<ResponseContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
    #[serde(default)]
    cache_read_input_tokens: i64,
    #[serde(default)]
    cache_creation_input_tokens: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseContentBlock {
    Text {
        #[serde(default)]
        text: String,
        #[serde(default)]
        citations: Option<Vec<ResponseCitation>>,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
        #[serde(default)]
        signature: String,
    },
    RedactedThinking {
        #[serde(default)]
        data: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },
    ServerToolUse {
        #[serde(default)]
        id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },
    WebSearchToolResult {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default)]
        content: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ResponseCitation {
    #[serde(rename = "type", default)]
    citation_type: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    cited_text: String,
    #[serde(default)]
    encrypted_index: String,
}

#[derive(Debug, Deserialize)]
struct WebSearchResultWire {
    #[serde(default)]
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    encrypted_content: String,
    #[serde(default)]
    page_age: Option<String>,
}

// --- SSE events ---

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SseEvent {
    MessageStart {
        message: MessagesResponse,
    },
    ContentBlockStart {
        index: usize,
        content_block: Value,
    },
    ContentBlockDelta {
        index: usize,
        delta: SseContentDelta,
    },
    ContentBlockStop {
        #[allow(dead_code)]
        index: usize,
    },
    MessageDelta {
        #[serde(default)]
        delta: SseMessageDelta,
        #[serde(default)]
        usage: WireUsage,
    },
    MessageStop,
    Ping,
    Error {
        error: SseErrorDetails,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SseContentDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    InputJsonDelta { partial_json: String },
    CitationsDelta { citation: Value },
}

#[derive(Debug, Default, Deserialize)]
struct SseMessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseErrorDetails {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    message: String,
}

/// Rebuilds a full message from the event stream so decoding can share the
/// non-streaming path.
#[derive(Default)]
struct MessageAccumulator {
    message: MessagesResponse,
    partial_json: Vec<String>,
}

impl MessageAccumulator {
    fn into_message(self) -> MessagesResponse {
        self.message
    }
}

fn handle_sse_line(
    line: &str,
    acc: &mut MessageAccumulator,
    text_streamer: &BufferedStreamer,
    thinking_streamer: &BufferedStreamer,
) -> Result<()> {
    let Some(data) = line.strip_prefix("data: ") else {
        return Ok(());
    };

    let event: SseEvent = match serde_json::from_str(data) {
        Ok(e) => e,
        Err(e) => {
            // Tolerate unknown/future event shapes.
            debug!(error = %e, "ignoring unparseable stream event");
            return Ok(());
        }
    };

    match event {
        SseEvent::MessageStart { message } => {
            acc.message.id = message.id;
            acc.message.usage = message.usage;
        }
        SseEvent::ContentBlockStart { index, content_block } => {
            if index != acc.message.content.len() {
                anyhow::bail!(
                    "content block start index {index} does not match expected {}",
                    acc.message.content.len()
                );
            }
            let block: ResponseContentBlock = serde_json::from_value(content_block)
                .unwrap_or(ResponseContentBlock::Unknown);
            match &block {
                ResponseContentBlock::Text { text, .. } if !text.is_empty() => {
                    text_streamer.write(text)?;
                }
                ResponseContentBlock::Thinking { thinking, .. } if !thinking.is_empty() => {
                    thinking_streamer.write(thinking)?;
                }
                _ => {}
            }
            acc.message.content.push(block);
            acc.partial_json.push(String::new());
        }
        SseEvent::ContentBlockDelta { index, delta } => {
            let len = acc.message.content.len();
            if len == 0 || index != len - 1 {
                anyhow::bail!("content block delta index {index} does not match current block");
            }
            let block = acc.message.content.last_mut().expect("non-empty");
            match delta {
                SseContentDelta::TextDelta { text: t } => {
                    if let ResponseContentBlock::Text { text, .. } = block {
                        text.push_str(&t);
                    }
                    text_streamer.write(&t)?;
                }
                SseContentDelta::ThinkingDelta { thinking: t } => {
                    if let ResponseContentBlock::Thinking { thinking, .. } = block {
                        thinking.push_str(&t);
                    }
                    thinking_streamer.write(&t)?;
                }
                SseContentDelta::SignatureDelta { signature: s } => {
                    if let ResponseContentBlock::Thinking { signature, .. } = block {
                        signature.push_str(&s);
                    }
                }
                SseContentDelta::InputJsonDelta { partial_json } => {
                    if let Some(buf) = acc.partial_json.last_mut() {
                        buf.push_str(&partial_json);
                    }
                }
                SseContentDelta::CitationsDelta { citation } => {
                    if let ResponseContentBlock::Text { citations, .. } = block {
                        if let Ok(c) = serde_json::from_value::<ResponseCitation>(citation) {
                            citations.get_or_insert_with(Vec::new).push(c);
                        }
                    }
                }
            }
        }
        SseEvent::ContentBlockStop { .. } => {
            if let (Some(block), Some(buf)) =
                (acc.message.content.last_mut(), acc.partial_json.last())
            {
                if !buf.is_empty() {
                    if let ResponseContentBlock::ToolUse { input, .. }
                    | ResponseContentBlock::ServerToolUse { input, .. } = block
                    {
                        if let Ok(parsed) = serde_json::from_str::<Value>(buf) {
                            *input = parsed;
                        }
                    }
                }
            }
        }
        SseEvent::MessageDelta { delta, usage } => {
            if delta.stop_reason.is_some() {
                acc.message.stop_reason = delta.stop_reason;
            }
            // Counts never decrease mid-stream.
            let u = &mut acc.message.usage;
            u.input_tokens = u.input_tokens.max(usage.input_tokens);
            u.output_tokens = u.output_tokens.max(usage.output_tokens);
            u.cache_read_input_tokens = u.cache_read_input_tokens.max(usage.cache_read_input_tokens);
            u.cache_creation_input_tokens = u
                .cache_creation_input_tokens
                .max(usage.cache_creation_input_tokens);
        }
        SseEvent::MessageStop | SseEvent::Ping => {}
        SseEvent::Error { error } => {
            anyhow::bail!("stream error: {}: {}", error.error_type, error.message);
        }
    }
    Ok(())
}

// --- Canonical -> wire conversion ---

fn to_messages_input(
    system_prompt: &str,
    inputs: &[InputUnion],
) -> (Vec<MessageParam>, Option<Vec<SystemBlockParam>>) {
    let mut out: Vec<MessageParam> = Vec::new();

    for input in inputs {
        if input.is_empty() {
            continue;
        }
        match input.kind {
            InputKind::InputMessage => {
                let Some(msg) = &input.input_message else { continue };
                if msg.role != Role::User {
                    continue;
                }
                let blocks = content_items_to_blocks(&msg.contents);
                if !blocks.is_empty() {
                    out.push(MessageParam {
                        role: "user",
                        content: blocks,
                    });
                }
            }
            InputKind::OutputMessage => {
                let Some(msg) = &input.output_message else { continue };
                if msg.role != Role::Assistant {
                    continue;
                }
                let blocks = content_items_to_blocks(&msg.contents);
                if !blocks.is_empty() {
                    out.push(MessageParam {
                        role: "assistant",
                        content: blocks,
                    });
                }
            }
            InputKind::ReasoningMessage => {
                let Some(r) = &input.reasoning_message else { continue };
                if let Some(block) = reasoning_to_block(r) {
                    out.push(MessageParam {
                        role: "assistant",
                        content: vec![block],
                    });
                }
            }
            InputKind::FunctionToolCall | InputKind::CustomToolCall | InputKind::WebSearchToolCall => {
                if let Some(block) = input.as_tool_call().and_then(tool_call_to_block) {
                    out.push(MessageParam {
                        role: "assistant",
                        content: vec![block],
                    });
                }
            }
            InputKind::FunctionToolOutput
            | InputKind::CustomToolOutput
            | InputKind::WebSearchToolOutput => {
                let is_web_search = input.kind == InputKind::WebSearchToolOutput;
                if let Some(block) = input.as_tool_output().and_then(tool_output_to_block) {
                    out.push(MessageParam {
                        // Server-side search results replay as assistant blocks.
                        role: if is_web_search { "assistant" } else { "user" },
                        content: vec![block],
                    });
                }
            }
        }
    }

    let system_prompt = system_prompt.trim();
    let system = (!system_prompt.is_empty()).then(|| {
        vec![SystemBlockParam {
            block_type: "text",
            text: system_prompt.to_string(),
        }]
    });

    (out, system)
}

fn content_items_to_blocks(items: &[ContentItemUnion]) -> Vec<ContentBlockParam> {
    let mut out = Vec::with_capacity(items.len());
    for it in items {
        match it.kind {
            ContentItemKind::Text => {
                if let Some(b) = it.text_item.as_ref().and_then(text_item_to_block) {
                    out.push(b);
                }
            }
            ContentItemKind::Image => {
                if let Some(source) = it.image_item.as_ref().and_then(image_source) {
                    out.push(ContentBlockParam::Image { source });
                }
            }
            ContentItemKind::File => {
                if let Some(source) = it.file_item.as_ref().and_then(document_source) {
                    out.push(ContentBlockParam::Document { source });
                }
            }
            // Refusals are conveyed via stop_reason on this API; they are not
            // replayable input content.
            ContentItemKind::Refusal => {}
        }
    }
    out
}

fn text_item_to_block(item: &ContentItemText) -> Option<ContentBlockParam> {
    let text = item.text.trim();
    if text.is_empty() {
        return None;
    }
    let citations = item
        .citations
        .iter()
        .filter_map(|c| c.url_citation.as_ref())
        .map(|u| TextCitationParam {
            citation_type: "web_search_result_location",
            url: u.url.clone(),
            title: u.title.clone(),
            cited_text: u.cited_text.clone(),
            encrypted_index: u.encrypted_index.clone(),
        })
        .collect();
    Some(ContentBlockParam::Text {
        text: text.to_string(),
        citations,
    })
}

fn image_source(item: &ContentItemImage) -> Option<MediaSourceParam> {
    let data = item.image_data.trim();
    if !data.is_empty() {
        let mime = item.image_mime.trim();
        let mime = if mime.is_empty() { DEFAULT_IMAGE_DATA_MIME } else { mime };
        return Some(MediaSourceParam::Base64 {
            media_type: mime.to_string(),
            data: data.to_string(),
        });
    }
    let url = item.image_url.trim();
    if !url.is_empty() {
        return Some(MediaSourceParam::Url {
            url: url.to_string(),
        });
    }
    debug!(id = %item.id, name = %item.image_name, "no data or url present for image");
    None
}

fn document_source(item: &ContentItemFile) -> Option<MediaSourceParam> {
    let data = item.file_data.trim();
    let url = item.file_url.trim();
    let mime = item.file_mime.trim();

    if !data.is_empty() && mime.starts_with("application/pdf") {
        return Some(MediaSourceParam::Base64 {
            media_type: "application/pdf".to_string(),
            data: data.to_string(),
        });
    }
    if !url.is_empty() && mime.starts_with("application/pdf") {
        return Some(MediaSourceParam::Url {
            url: url.to_string(),
        });
    }
    debug!(
        id = %item.id,
        name = %item.file_name,
        mime,
        "skipping file unsupported as a document block"
    );
    None
}

fn reasoning_to_block(r: &ReasoningContent) -> Option<ContentBlockParam> {
    if !r.redacted_thinking.is_empty() {
        return Some(ContentBlockParam::RedactedThinking {
            data: r.redacted_thinking.join(" "),
        });
    }
    if !r.thinking.is_empty() && !r.signature.is_empty() {
        return Some(ContentBlockParam::Thinking {
            thinking: r.thinking.join(" "),
            signature: r.signature.clone(),
        });
    }
    // Unsigned thinking cannot be replayed on this API.
    None
}

fn tool_call_to_block(call: &ToolCall) -> Option<ContentBlockParam> {
    if call.id.trim().is_empty() {
        return None;
    }
    match call.tool_type {
        ToolType::Function | ToolType::Custom => {
            if call.name.trim().is_empty() {
                return None;
            }
            let args = call.arguments.trim();
            let input = serde_json::from_str::<Value>(if args.is_empty() { "{}" } else { args })
                .unwrap_or_else(|_| Value::Object(serde_json::Map::new()));
            Some(ContentBlockParam::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input,
            })
        }
        ToolType::WebSearch => {
            let item = call.web_search_tool_call_items.first()?;
            if item.kind != WebSearchToolCallKind::Search {
                return None;
            }
            let search = item.search_item.as_ref()?;
            let input = search.input.clone()?;
            Some(ContentBlockParam::ServerToolUse {
                id: call.id.clone(),
                name: DEFAULT_WEB_SEARCH_TOOL_NAME.to_string(),
                input: Value::Object(input),
            })
        }
    }
}

fn tool_output_to_block(output: &ToolOutput) -> Option<ContentBlockParam> {
    if output.call_id.trim().is_empty() {
        return None;
    }
    match output.tool_type {
        ToolType::Function | ToolType::Custom => {
            let items = tool_result_content(&output.contents);
            if items.is_empty() {
                return None;
            }
            Some(ContentBlockParam::ToolResult {
                tool_use_id: output.call_id.clone(),
                content: items,
                is_error: output.is_error,
            })
        }
        ToolType::WebSearch => {
            let content = web_search_output_content(&output.web_search_tool_output_items)?;
            Some(ContentBlockParam::WebSearchToolResult {
                tool_use_id: output.call_id.clone(),
                content,
            })
        }
    }
}

fn tool_result_content(items: &[ContentItemUnion]) -> Vec<ToolResultBlockParam> {
    let mut out = Vec::with_capacity(items.len());
    for it in items {
        match it.kind {
            ContentItemKind::Text => {
                if let Some(t) = &it.text_item {
                    let text = t.text.trim();
                    if !text.is_empty() {
                        out.push(ToolResultBlockParam::Text {
                            text: text.to_string(),
                        });
                    }
                }
            }
            ContentItemKind::Image => {
                if let Some(source) = it.image_item.as_ref().and_then(image_source) {
                    out.push(ToolResultBlockParam::Image { source });
                }
            }
            ContentItemKind::File => {
                if let Some(source) = it.file_item.as_ref().and_then(document_source) {
                    out.push(ToolResultBlockParam::Document { source });
                }
            }
            ContentItemKind::Refusal => {}
        }
    }
    out
}

/// An error item collapses the whole result into a single error content;
/// otherwise all search results are collected.
fn web_search_output_content(items: &[WebSearchToolOutputItemUnion]) -> Option<Value> {
    if items.is_empty() {
        return None;
    }

    for it in items {
        if it.kind == WebSearchToolOutputKind::Error {
            if let Some(err) = &it.error_item {
                return Some(serde_json::json!({
                    "type": "web_search_tool_result_error",
                    "error_code": err.code,
                }));
            }
        }
    }

    let results: Vec<Value> = items
        .iter()
        .filter(|it| it.kind == WebSearchToolOutputKind::Search)
        .filter_map(|it| it.search_item.as_ref())
        .map(|s| {
            let mut obj = serde_json::json!({
                "type": "web_search_result",
                "url": s.url,
                "title": s.title,
                "encrypted_content": s.encrypted_content,
            });
            if !s.page_age.trim().is_empty() {
                obj["page_age"] = Value::String(s.page_age.clone());
            }
            obj
        })
        .collect();

    if results.is_empty() {
        return None;
    }
    Some(Value::Array(results))
}

fn tool_choices_to_tools(
    tool_choices: &[ToolChoice],
) -> (Option<Vec<ToolDefParam>>, std::collections::HashMap<String, ToolChoice>) {
    if tool_choices.is_empty() {
        return (None, std::collections::HashMap::new());
    }

    let (ordered, name_map) = build_tool_choice_name_mapping(tool_choices);
    let mut out = Vec::with_capacity(ordered.len());
    let mut web_search_added = false;

    for named in &ordered {
        let tc = &named.choice;
        match tc.tool_type {
            ToolType::Function | ToolType::Custom => {
                let Some(args) = &tc.arguments else { continue };
                if named.name.is_empty() {
                    continue;
                }
                let mut schema = args.clone();
                schema
                    .entry("type".to_string())
                    .or_insert_with(|| Value::String("object".to_string()));
                let desc = tool_description(tc);
                out.push(ToolDefParam::Client {
                    name: named.name.clone(),
                    description: (!desc.is_empty()).then_some(desc),
                    input_schema: Value::Object(schema),
                });
            }
            ToolType::WebSearch => {
                let Some(ws) = &tc.web_search_arguments else { continue };
                if web_search_added {
                    continue;
                }
                if !ws.allowed_domains.is_empty() && !ws.blocked_domains.is_empty() {
                    warn!(
                        tool_id = %tc.id,
                        "web_search tool has both allowed_domains and blocked_domains; using allowed_domains only"
                    );
                }
                let (allowed, blocked) = if !ws.allowed_domains.is_empty() {
                    (ws.allowed_domains.clone(), Vec::new())
                } else {
                    (Vec::new(), ws.blocked_domains.clone())
                };
                out.push(ToolDefParam::WebSearch(WebSearchToolDefParam {
                    tool_type: WEB_SEARCH_TOOL_TYPE,
                    name: DEFAULT_WEB_SEARCH_TOOL_NAME,
                    allowed_domains: allowed,
                    blocked_domains: blocked,
                    max_uses: (ws.max_uses > 0).then_some(ws.max_uses),
                    user_location: ws.user_location.as_ref().map(|ul| WebSearchUserLocationParam {
                        location_type: "approximate",
                        city: ul.city.clone(),
                        country: ul.country.clone(),
                        region: ul.region.clone(),
                        timezone: ul.timezone.clone(),
                    }),
                }));
                web_search_added = true;
            }
        }
    }

    if out.is_empty() {
        (None, name_map)
    } else {
        (Some(out), name_map)
    }
}

// --- Wire -> canonical decoding ---

fn outputs_from_message(
    msg: &MessagesResponse,
    name_map: &std::collections::HashMap<String, ToolChoice>,
) -> Vec<OutputUnion> {
    let mut outs = Vec::new();
    let status = stop_reason_to_status(msg.stop_reason.as_deref());

    let web_search_choice_id = || {
        name_map
            .values()
            .find(|tc| tc.tool_type == ToolType::WebSearch)
            .map(|tc| tc.id.clone())
    };

    for block in &msg.content {
        match block {
            ResponseContentBlock::Text { text, citations } => {
                if text.trim().is_empty() {
                    continue;
                }
                let item = ContentItemUnion::text_with_citations(
                    text.clone(),
                    citations
                        .as_deref()
                        .unwrap_or(&[])
                        .iter()
                        .filter(|c| c.citation_type == "web_search_result_location")
                        .map(|c| {
                            Citation::url(UrlCitation {
                                url: c.url.clone(),
                                title: c.title.clone(),
                                cited_text: c.cited_text.clone(),
                                encrypted_index: c.encrypted_index.clone(),
                                start_index: 0,
                                end_index: 0,
                            })
                        })
                        .collect(),
                );
                outs.push(OutputUnion::output_message(InputOutputContent {
                    id: msg.id.clone(),
                    role: Role::Assistant,
                    // Per-block status is not exposed; use stop_reason.
                    status,
                    contents: vec![item],
                }));
            }
            ResponseContentBlock::Thinking { thinking, signature } => {
                outs.push(OutputUnion::reasoning_message(ReasoningContent {
                    id: msg.id.clone(),
                    role: Role::Assistant,
                    status,
                    signature: signature.clone(),
                    thinking: vec![thinking.clone()],
                    ..ReasoningContent::default()
                }));
            }
            ResponseContentBlock::RedactedThinking { data } => {
                outs.push(OutputUnion::reasoning_message(ReasoningContent {
                    id: msg.id.clone(),
                    role: Role::Assistant,
                    status,
                    redacted_thinking: vec![data.clone()],
                    ..ReasoningContent::default()
                }));
            }
            ResponseContentBlock::ToolUse { id, name, input } => {
                let id = id.trim();
                let name = name.trim();
                if id.is_empty() || name.is_empty() {
                    continue;
                }
                let Some(tc) = name_map.get(name) else {
                    debug!(name, "dropping tool call without a matching tool choice");
                    continue;
                };
                let tool_type = match tc.tool_type {
                    ToolType::Custom => ToolType::Custom,
                    _ => ToolType::Function,
                };
                outs.push(OutputUnion::tool_call(ToolCall {
                    choice_id: tc.id.clone(),
                    tool_type,
                    role: Role::Assistant,
                    id: id.to_string(),
                    call_id: id.to_string(),
                    name: name.to_string(),
                    arguments: serde_json::to_string(input).unwrap_or_else(|_| "{}".to_string()),
                    status: Status::Completed,
                    web_search_tool_call_items: vec![],
                }));
            }
            ResponseContentBlock::ServerToolUse { id, input, .. } => {
                let id = id.trim();
                if id.is_empty() {
                    continue;
                }
                let Some(choice_id) = web_search_choice_id() else {
                    debug!("dropping server tool use without a web_search tool choice");
                    continue;
                };
                outs.push(OutputUnion::tool_call(ToolCall {
                    choice_id,
                    tool_type: ToolType::WebSearch,
                    role: Role::Assistant,
                    id: id.to_string(),
                    call_id: id.to_string(),
                    name: DEFAULT_WEB_SEARCH_TOOL_NAME.to_string(),
                    arguments: String::new(),
                    status: Status::Completed,
                    web_search_tool_call_items: server_tool_input_to_items(input),
                }));
            }
            ResponseContentBlock::WebSearchToolResult { tool_use_id, content } => {
                let choice_id = web_search_choice_id().unwrap_or_default();
                let mut out = ToolOutput {
                    choice_id,
                    tool_type: ToolType::WebSearch,
                    role: Role::Assistant,
                    id: tool_use_id.clone(),
                    call_id: tool_use_id.clone(),
                    name: DEFAULT_WEB_SEARCH_TOOL_NAME.to_string(),
                    status: Status::Completed,
                    is_error: false,
                    contents: vec![],
                    web_search_tool_output_items: vec![],
                };

                if let Some(code) = content.get("error_code").and_then(Value::as_str) {
                    out.is_error = true;
                    out.web_search_tool_output_items =
                        vec![WebSearchToolOutputItemUnion::error(code)];
                } else if let Some(arr) = content.as_array() {
                    out.web_search_tool_output_items = arr
                        .iter()
                        .filter_map(|v| {
                            serde_json::from_value::<WebSearchResultWire>(v.clone()).ok()
                        })
                        .map(|w| {
                            WebSearchToolOutputItemUnion::search(WebSearchToolOutputSearch {
                                url: w.url,
                                title: w.title,
                                encrypted_content: w.encrypted_content,
                                page_age: w.page_age.unwrap_or_default(),
                                rendered_content: String::new(),
                            })
                        })
                        .collect();
                    if out.web_search_tool_output_items.is_empty() {
                        continue;
                    }
                } else {
                    continue;
                }
                outs.push(OutputUnion::web_search_tool_output(out));
            }
            ResponseContentBlock::Unknown => {
                debug!("skipping unknown response content block");
            }
        }
    }

    outs
}

/// The server web-search input payload is weakly typed; the raw map is kept
/// alongside the parsed query.
fn server_tool_input_to_items(input: &Value) -> Vec<WebSearchToolCallItemUnion> {
    let Some(map) = input.as_object() else {
        return vec![];
    };
    let query = map
        .get("query")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    vec![WebSearchToolCallItemUnion::search(WebSearchToolCallSearch {
        query,
        input: Some(map.clone()),
        sources: vec![],
    })]
}

fn stop_reason_to_status(stop_reason: Option<&str>) -> Status {
    match stop_reason {
        Some("max_tokens") => Status::Incomplete,
        Some("refusal") | Some("pause_turn") | Some("stop_sequence") => Status::Failed,
        Some("end_turn") | Some("tool_use") => Status::Completed,
        _ => Status::Completed,
    }
}

fn usage_from_message(msg: &MessagesResponse) -> Usage {
    let u = &msg.usage;
    Usage {
        input_tokens_cached: u.cache_read_input_tokens,
        input_tokens_uncached: u.input_tokens,
        input_tokens_total: u.cache_read_input_tokens + u.input_tokens,
        output_tokens: u.output_tokens,
        // Reasoning token counts are not exposed by this API.
        reasoning_tokens: 0,
    }
}
