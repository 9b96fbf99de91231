//! OpenAI Chat Completions API adapter.
//!
//! Reasoning is configuration-only on this API (`reasoning_effort`); there
//! is no message-level reasoning item, and web search is configured through
//! top-level `web_search_options` rather than a tool definition.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::client::{
    apply_additional_parameters, read_body_with_debug, send_request, EndpointClient,
};
use crate::debug::{DebugSpan, HttpDebugger};
use crate::streaming::{stream_emit, BufferedStreamer, ResolvedStreamConfig, SseLineScanner};
use crate::tool_mapping::{build_tool_choice_name_mapping, tool_description};
use crate::types::*;
use crate::CompletionProvider;

const CHAT_COMPLETIONS_PATH: &str = "chat/completions";

/// `CompletionProvider` for the OpenAI Chat Completions API.
pub struct OpenAiChatCompletionsApi {
    state: RwLock<ProviderState>,
    debugger: Option<Arc<HttpDebugger>>,
}

struct ProviderState {
    param: ProviderParam,
    client: Option<EndpointClient>,
}

impl OpenAiChatCompletionsApi {
    pub fn new(
        param: ProviderParam,
        debugger: Option<Arc<HttpDebugger>>,
    ) -> Result<OpenAiChatCompletionsApi> {
        if param.name.is_empty() || param.origin.is_empty() {
            anyhow::bail!("openai chat completions api: invalid args");
        }
        Ok(OpenAiChatCompletionsApi {
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
        let mut headers = vec![(
            DEFAULT_AUTHORIZATION_HEADER_KEY.to_string(),
            format!("Bearer {}", param.api_key),
        )];
        let custom = param.api_key_header_key.trim();
        if !custom.is_empty() && !custom.eq_ignore_ascii_case(DEFAULT_AUTHORIZATION_HEADER_KEY) {
            headers.push((custom.to_string(), param.api_key.clone()));
        }
        headers
    }

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

    async fn do_non_streaming(
        &self,
        client: &EndpointClient,
        param: &ProviderParam,
        body: Value,
        timeout: Duration,
        name_map: &HashMap<String, ToolChoice>,
    ) -> Result<FetchCompletionResponse, CompletionError> {
        let span = self.debugger.as_ref().map(|d| d.start_span());
        let mut resp = FetchCompletionResponse::default();

        let request = match build_post(client, param, &body, timeout, false) {
            Ok(r) => r,
            Err(e) => return Err(CompletionError::new(e.to_string())),
        };

        let response = match send_request(&client.http, request, span.as_ref()).await {
            Ok(r) => r,
            Err(e) => return Err(self.fail(resp, span.as_deref(), None, e.to_string(), false)),
        };

        let bytes = match read_body_with_debug(response, span.as_ref()).await {
            Ok(b) => b,
            Err(e) => return Err(self.fail(resp, span.as_deref(), None, e.to_string(), false)),
        };

        let parsed: ChatResponse = match serde_json::from_slice(&bytes) {
            Ok(p) => p,
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

        let is_nil_resp = parsed.choices.is_empty();
        let full = serde_json::to_value(&parsed).ok();
        if let Some(d) = &self.debugger {
            resp.debug_details =
                d.build_debug_details(span.as_deref(), full.as_ref(), None, is_nil_resp);
        }
        resp.usage = Some(usage_from_chat(&parsed));
        if !is_nil_resp {
            resp.outputs = outputs_from_chat(&parsed, name_map);
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
        name_map: &HashMap<String, ToolChoice>,
    ) -> Result<FetchCompletionResponse, CompletionError> {
        let span = self.debugger.as_ref().map(|d| d.start_span());
        let stream_cfg = ResolvedStreamConfig::from_options(opts);

        // This API exposes no reasoning stream, so only text is buffered.
        let text_streamer = BufferedStreamer::new(
            stream_emit(
                opts.stream_handler.clone(),
                StreamContentKind::Text,
                param.name.clone(),
                model.to_string(),
            ),
            stream_cfg.flush_interval,
            stream_cfg.flush_chunk_size,
        );

        let mut resp = FetchCompletionResponse::default();
        let request = match build_post(client, param, &body, timeout, true) {
            Ok(r) => r,
            Err(e) => return Err(CompletionError::new(e.to_string())),
        };

        let mut response = match send_request(&client.http, request, span.as_ref()).await {
            Ok(r) => r,
            Err(e) => {
                text_streamer.flush();
                return Err(self.fail(resp, span.as_deref(), None, e.to_string(), false));
            }
        };

        let mut scanner = SseLineScanner::new();
        let mut acc = ChatAccumulator::default();
        let mut stream_err: Option<String> = None;

        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if let Some(span) = &span {
                        span.append_response_body(&chunk);
                    }
                    let res = scanner.push(&chunk, |line| {
                        handle_sse_line(line, &mut acc, &text_streamer)
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
            if let Err(e) =
                scanner.finish(|line| handle_sse_line(line, &mut acc, &text_streamer))
            {
                stream_err = Some(e.to_string());
            }
        }

        text_streamer.flush();
        if let Some(span) = &span {
            span.finalize_response_body();
        }

        let parsed = acc.into_response();
        let is_nil_resp = parsed.choices.is_empty();
        let full = serde_json::to_value(&parsed).ok();
        if let Some(d) = &self.debugger {
            resp.debug_details = d.build_debug_details(
                span.as_deref(),
                full.as_ref(),
                stream_err.as_deref(),
                is_nil_resp,
            );
        }
        resp.usage = Some(usage_from_chat(&parsed));
        if !is_nil_resp {
            resp.outputs = outputs_from_chat(&parsed, name_map);
        }

        match stream_err {
            Some(msg) => {
                resp.error = Some(ErrorDetail { message: msg.clone() });
                Err(CompletionError::with_response(msg, resp))
            }
            None => Ok(resp),
        }
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
        .header("Content-Type", "application/json")
        .json(body);
    if streaming {
        builder = builder.header("Accept", "text/event-stream");
    }
    for (k, v) in OpenAiChatCompletionsApi::auth_headers(param) {
        builder = builder.header(k, v);
    }
    Ok(builder.build()?)
}

#[async_trait]
impl CompletionProvider for OpenAiChatCompletionsApi {
    async fn init_llm(&self) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if state.param.api_key.is_empty() {
            debug!(name = %state.param.name, "no API key given; not initializing client");
            return Ok(());
        }
        let client = EndpointClient::new(&state.param, CHAT_COMPLETIONS_PATH)?;
        info!(name = %state.param.name, url = %client.endpoint, "openai chat completions provider initialized");
        state.client = Some(client);
        Ok(())
    }

    async fn deinit_llm(&self) -> Result<()> {
        let mut state = self.state.write().unwrap();
        state.client = None;
        info!(name = %state.param.name, "openai chat completions provider deinitialized");
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
                "openai chat completions api: client not initialized",
            ));
        };
        if request.inputs.is_empty() || request.model_param.name.is_empty() {
            return Err(CompletionError::new(
                "openai chat completions api: empty completion data",
            ));
        }

        let mp = &request.model_param;
        let messages =
            to_chat_messages(&mp.system_prompt, &request.inputs, &mp.name, &param.name);

        let reasoning_effort = match mp.reasoning.as_ref() {
            Some(rp) if rp.reasoning_type == ReasoningType::SingleWithLevels => match rp.level {
                Some(level) => Some(level.as_str().to_string()),
                None => {
                    return Err(CompletionError::new(
                        "invalid reasoning level for singleWithLevels",
                    ));
                }
            },
            _ => None,
        };

        let (tools, name_map) = tool_choices_to_tools(&request.tool_choices);
        // A single web-search choice maps to top-level options; first wins.
        let web_search_options = request
            .tool_choices
            .iter()
            .find(|tc| tc.tool_type == ToolType::WebSearch && tc.web_search_arguments.is_some())
            .and_then(|tc| tc.web_search_arguments.as_ref())
            .map(web_search_options_value);

        let stream = mp.stream && opts.stream_handler.is_some();
        let wire = ChatRequest {
            model: mp.name.clone(),
            max_completion_tokens: mp.max_output_length,
            messages,
            temperature: mp.temperature,
            reasoning_effort,
            tools,
            web_search_options,
            stream,
            stream_options: stream.then_some(StreamOptionsParam {
                include_usage: true,
            }),
        };

        let body = match serde_json::to_value(&wire) {
            Ok(v) => apply_additional_parameters(v, mp.additional_parameters_raw_json.as_deref()),
            Err(e) => return Err(CompletionError::new(format!("encode request: {e}"))),
        };

        let timeout = mp.request_timeout();
        if stream {
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
struct ChatRequest {
    model: String,
    max_completion_tokens: i64,
    messages: Vec<ChatMessageParam>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    web_search_options: Option<Value>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptionsParam>,
}

#[derive(Debug, Serialize)]
struct StreamOptionsParam {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessageParam {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ChatMessageParam {
    fn with_content(role: &'static str, content: Value) -> ChatMessageParam {
        ChatMessageParam {
            role,
            content: Some(content),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

// --- Wire shapes (response) ---

#[derive(Debug, Default, Serialize, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    choices: Vec<ChatChoiceWire>,
    #[serde(default)]
    usage: Option<ChatUsageWire>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ChatChoiceWire {
    #[serde(default)]
    finish_reason: String,
    #[serde(default)]
    message: ChatMessageWire,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ChatMessageWire {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChatToolCallWire>,
    #[serde(default)]
    annotations: Vec<ChatAnnotationWire>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ChatToolCallWire {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default)]
    call_type: String,
    #[serde(default)]
    function: Option<ChatFunctionWire>,
    #[serde(default)]
    custom: Option<ChatCustomWire>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ChatFunctionWire {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ChatCustomWire {
    #[serde(default)]
    name: String,
    #[serde(default)]
    input: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ChatAnnotationWire {
    #[serde(rename = "type", default)]
    ann_type: String,
    #[serde(default)]
    url_citation: Option<ChatUrlCitationWire>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ChatUrlCitationWire {
    #[serde(default)]
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    start_index: i64,
    #[serde(default)]
    end_index: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ChatUsageWire {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetailsWire>,
    #[serde(default)]
    completion_tokens_details: Option<CompletionTokensDetailsWire>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PromptTokensDetailsWire {
    #[serde(default)]
    cached_tokens: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CompletionTokensDetailsWire {
    #[serde(default)]
    reasoning_tokens: i64,
}

// --- SSE events ---

#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    choices: Vec<ChatStreamChoice>,
    #[serde(default)]
    usage: Option<ChatUsageWire>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatStreamChoice {
    #[serde(default)]
    delta: ChatStreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChatStreamDeltaToolCall>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatStreamDeltaToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default)]
    call_type: Option<String>,
    #[serde(default)]
    function: Option<ChatStreamDeltaFunction>,
    #[serde(default)]
    custom: Option<ChatStreamDeltaCustom>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatStreamDeltaFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatStreamDeltaCustom {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<String>,
}

/// Rebuilds a `ChatResponse` for choice 0 from the chunk stream so decoding
/// can share the non-streaming path.
#[derive(Default)]
struct ChatAccumulator {
    id: String,
    content: String,
    refusal: String,
    finish_reason: String,
    tool_calls: Vec<ChatToolCallWire>,
    usage: Option<ChatUsageWire>,
    saw_choice: bool,
}

impl ChatAccumulator {
    fn into_response(self) -> ChatResponse {
        if !self.saw_choice {
            return ChatResponse {
                id: self.id,
                choices: vec![],
                usage: self.usage,
            };
        }
        ChatResponse {
            id: self.id,
            choices: vec![ChatChoiceWire {
                finish_reason: self.finish_reason,
                message: ChatMessageWire {
                    content: (!self.content.is_empty()).then_some(self.content),
                    refusal: (!self.refusal.is_empty()).then_some(self.refusal),
                    tool_calls: self.tool_calls,
                    annotations: vec![],
                },
            }],
            usage: self.usage,
        }
    }
}

fn handle_sse_line(
    line: &str,
    acc: &mut ChatAccumulator,
    text_streamer: &BufferedStreamer,
) -> Result<()> {
    let Some(data) = line.strip_prefix("data: ") else {
        return Ok(());
    };
    if data.trim() == "[DONE]" {
        return Ok(());
    }

    let chunk: ChatStreamChunk = match serde_json::from_str(data) {
        Ok(c) => c,
        Err(e) => {
            debug!(error = %e, "ignoring unparseable stream chunk");
            return Ok(());
        }
    };

    if !chunk.id.is_empty() {
        acc.id = chunk.id;
    }
    if let Some(usage) = chunk.usage {
        acc.usage = Some(usage);
    }

    // Only the first choice is surfaced.
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(());
    };
    acc.saw_choice = true;

    if let Some(reason) = choice.finish_reason {
        if !reason.is_empty() {
            acc.finish_reason = reason;
        }
    }
    if let Some(refusal) = &choice.delta.refusal {
        acc.refusal.push_str(refusal);
    }
    for tc in choice.delta.tool_calls {
        while acc.tool_calls.len() <= tc.index {
            acc.tool_calls.push(ChatToolCallWire::default());
        }
        let slot = &mut acc.tool_calls[tc.index];
        if let Some(id) = tc.id {
            if !id.is_empty() {
                slot.id = id;
            }
        }
        if let Some(t) = tc.call_type {
            if !t.is_empty() {
                slot.call_type = t;
            }
        }
        if let Some(f) = tc.function {
            let slot_fn = slot.function.get_or_insert_with(ChatFunctionWire::default);
            if let Some(name) = f.name {
                slot_fn.name.push_str(&name);
            }
            if let Some(args) = f.arguments {
                slot_fn.arguments.push_str(&args);
            }
        }
        if let Some(c) = tc.custom {
            let slot_custom = slot.custom.get_or_insert_with(ChatCustomWire::default);
            if let Some(name) = c.name {
                slot_custom.name.push_str(&name);
            }
            if let Some(input) = c.input {
                slot_custom.input.push_str(&input);
            }
        }
    }

    // Refusal and tool-call transitions never emit text.
    if let Some(content) = choice.delta.content {
        if !content.trim().is_empty() {
            acc.content.push_str(&content);
            text_streamer.write(&content)?;
        }
    }

    Ok(())
}

// --- Canonical -> wire conversion ---

fn to_chat_messages(
    system_prompt: &str,
    inputs: &[InputUnion],
    model_name: &str,
    provider_name: &str,
) -> Vec<ChatMessageParam> {
    let mut out = Vec::new();

    if let Some(msg) = system_prompt_message(provider_name, model_name, system_prompt) {
        out.push(msg);
    }

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
                let parts = user_content_parts(&msg.contents);
                if !parts.is_empty() {
                    out.push(ChatMessageParam::with_content("user", Value::Array(parts)));
                }
            }
            InputKind::OutputMessage => {
                let Some(msg) = &input.output_message else { continue };
                if msg.role != Role::Assistant {
                    continue;
                }
                let parts = assistant_content_parts(&msg.contents);
                if !parts.is_empty() {
                    out.push(ChatMessageParam::with_content(
                        "assistant",
                        Value::Array(parts),
                    ));
                }
            }
            InputKind::FunctionToolCall | InputKind::CustomToolCall => {
                if let Some(msg) = input.as_tool_call().and_then(tool_call_to_message) {
                    out.push(msg);
                }
            }
            InputKind::FunctionToolOutput | InputKind::CustomToolOutput => {
                if let Some(msg) = input.as_tool_output().and_then(tool_output_to_message) {
                    out.push(msg);
                }
            }
            // No structured reasoning messages on this API.
            InputKind::ReasoningMessage => {}
            // Web search is top-level configuration here, not a tool.
            InputKind::WebSearchToolCall | InputKind::WebSearchToolOutput => {}
        }
    }

    out
}

/// System instructions become a `developer` message for OpenAI's `o*` and
/// `gpt-5*` model families.
fn system_prompt_message(
    provider_name: &str,
    model_name: &str,
    system_prompt: &str,
) -> Option<ChatMessageParam> {
    let sp = system_prompt.trim();
    if sp.is_empty() {
        return None;
    }
    let role = if provider_name == "openai"
        && (model_name.starts_with('o') || model_name.starts_with("gpt-5"))
    {
        "developer"
    } else {
        "system"
    };
    Some(ChatMessageParam::with_content(
        role,
        Value::String(sp.to_string()),
    ))
}

fn user_content_parts(items: &[ContentItemUnion]) -> Vec<Value> {
    let mut out = Vec::with_capacity(items.len());
    for it in items {
        match it.kind {
            ContentItemKind::Text => {
                if let Some(t) = &it.text_item {
                    let txt = t.text.trim();
                    if !txt.is_empty() {
                        out.push(json!({"type": "text", "text": txt}));
                    }
                }
            }
            ContentItemKind::Image => {
                let Some(img) = &it.image_item else { continue };
                let data = img.image_data.trim();
                let url = img.image_url.trim();
                let image_url = if !data.is_empty() {
                    let mime = img.image_mime.trim();
                    let mime = if mime.is_empty() { DEFAULT_IMAGE_DATA_MIME } else { mime };
                    format!("data:{mime};base64,{data}")
                } else if !url.is_empty() {
                    url.to_string()
                } else {
                    continue;
                };
                out.push(json!({
                    "type": "image_url",
                    "image_url": {"url": image_url, "detail": img.detail.as_str()},
                }));
            }
            ContentItemKind::File => {
                let Some(f) = &it.file_item else { continue };
                // Only embedded data is supported here; there is no
                // URL-reference file part on this API.
                let data = f.file_data.trim();
                if data.is_empty() {
                    continue;
                }
                let mime = f.file_mime.trim();
                let mime = if mime.is_empty() { DEFAULT_FILE_DATA_MIME } else { mime };
                let mut file = json!({"file_data": format!("data:{mime};base64,{data}")});
                let name = f.file_name.trim();
                if !name.is_empty() {
                    file["filename"] = Value::String(name.to_string());
                }
                out.push(json!({"type": "file", "file": file}));
            }
            // Refusals are assistant outputs, not user inputs.
            ContentItemKind::Refusal => {}
        }
    }
    out
}

fn assistant_content_parts(items: &[ContentItemUnion]) -> Vec<Value> {
    let mut out = Vec::new();
    let mut added_refusal = false;
    for it in items {
        match it.kind {
            ContentItemKind::Text => {
                if let Some(t) = &it.text_item {
                    let txt = t.text.trim();
                    if !txt.is_empty() {
                        out.push(json!({"type": "text", "text": txt}));
                    }
                }
            }
            ContentItemKind::Refusal => {
                // At most one refusal part per message.
                if added_refusal {
                    continue;
                }
                if let Some(r) = &it.refusal_item {
                    let refusal = r.refusal.trim();
                    if !refusal.is_empty() {
                        out.push(json!({"type": "refusal", "refusal": refusal}));
                        added_refusal = true;
                    }
                }
            }
            // No image or file support in assistant messages.
            ContentItemKind::Image | ContentItemKind::File => {}
        }
    }
    out
}

fn tool_call_to_message(call: &ToolCall) -> Option<ChatMessageParam> {
    if call.id.trim().is_empty() {
        return None;
    }
    let tool_call = match call.tool_type {
        ToolType::Function => json!({
            "id": call.id,
            "type": "function",
            "function": {"name": call.name, "arguments": call.arguments},
        }),
        ToolType::Custom => json!({
            "id": call.id,
            "type": "custom",
            "custom": {"name": call.name, "input": call.arguments},
        }),
        ToolType::WebSearch => return None,
    };
    Some(ChatMessageParam {
        role: "assistant",
        content: None,
        tool_calls: vec![tool_call],
        tool_call_id: None,
    })
}

fn tool_output_to_message(output: &ToolOutput) -> Option<ChatMessageParam> {
    if output.call_id.trim().is_empty() || output.contents.is_empty() {
        return None;
    }
    let parts: Vec<Value> = output
        .contents
        .iter()
        .filter(|it| it.kind == ContentItemKind::Text)
        .filter_map(|it| it.text_item.as_ref())
        .map(|t| t.text.trim())
        .filter(|s| !s.is_empty())
        .map(|s| json!({"type": "text", "text": s}))
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(ChatMessageParam {
        role: "tool",
        content: Some(Value::Array(parts)),
        tool_calls: Vec::new(),
        tool_call_id: Some(output.call_id.clone()),
    })
}

fn tool_choices_to_tools(
    tool_choices: &[ToolChoice],
) -> (Option<Vec<Value>>, HashMap<String, ToolChoice>) {
    if tool_choices.is_empty() {
        return (None, HashMap::new());
    }

    let (ordered, name_map) = build_tool_choice_name_mapping(tool_choices);
    let mut out = Vec::with_capacity(ordered.len());

    for named in &ordered {
        let tc = &named.choice;
        match tc.tool_type {
            // Both function and custom tools are expressed as function
            // tools, mirroring the Responses adapter.
            ToolType::Function | ToolType::Custom => {
                let Some(args) = &tc.arguments else { continue };
                if named.name.is_empty() {
                    continue;
                }
                let mut function = json!({
                    "name": named.name,
                    "parameters": Value::Object(args.clone()),
                });
                let desc = tool_description(tc);
                if !desc.is_empty() {
                    function["description"] = Value::String(desc);
                }
                out.push(json!({"type": "function", "function": function}));
            }
            // Handled via top-level web_search_options.
            ToolType::WebSearch => {}
        }
    }

    if out.is_empty() {
        (None, name_map)
    } else {
        (Some(out), name_map)
    }
}

fn web_search_options_value(ws: &WebSearchToolChoiceItem) -> Value {
    let size = match ws.search_context_size.trim().to_lowercase().as_str() {
        "low" => "low",
        "high" => "high",
        _ => "medium",
    };
    let mut opts = json!({"search_context_size": size});
    if let Some(ul) = &ws.user_location {
        let mut approximate = serde_json::Map::new();
        for (key, value) in [
            ("city", &ul.city),
            ("country", &ul.country),
            ("region", &ul.region),
            ("timezone", &ul.timezone),
        ] {
            let value = value.trim();
            if !value.is_empty() {
                approximate.insert(key.to_string(), Value::String(value.to_string()));
            }
        }
        opts["user_location"] = json!({
            "type": "approximate",
            "approximate": Value::Object(approximate),
        });
    }
    opts
}

// --- Wire -> canonical decoding ---

fn outputs_from_chat(
    resp: &ChatResponse,
    name_map: &HashMap<String, ToolChoice>,
) -> Vec<OutputUnion> {
    let Some(choice) = resp.choices.first() else {
        return Vec::new();
    };
    let msg = &choice.message;
    let status = finish_reason_to_status(&choice.finish_reason);

    let mut outs = Vec::new();

    // A refusal takes precedence over text for the choice.
    let refusal = msg.refusal.as_deref().unwrap_or("").trim();
    let content = msg.content.as_deref().unwrap_or("").trim();
    if !refusal.is_empty() {
        outs.push(OutputUnion::output_message(InputOutputContent {
            id: resp.id.clone(),
            role: Role::Assistant,
            // Per-block status is not exposed; use finish_reason.
            status,
            contents: vec![ContentItemUnion::refusal(refusal)],
        }));
    } else if !content.is_empty() {
        let citations = chat_annotations_to_citations(&msg.annotations);
        outs.push(OutputUnion::output_message(InputOutputContent {
            id: resp.id.clone(),
            role: Role::Assistant,
            status,
            contents: vec![ContentItemUnion::text_with_citations(content, citations)],
        }));
    }

    for tc in &msg.tool_calls {
        match tc.call_type.as_str() {
            "function" => {
                let Some(f) = &tc.function else { continue };
                if tc.id.is_empty() || f.name.trim().is_empty() {
                    continue;
                }
                let Some(choice_def) = name_map.get(&f.name) else {
                    debug!(name = %f.name, "dropping tool call without a matching tool choice");
                    continue;
                };
                outs.push(OutputUnion::tool_call(ToolCall {
                    choice_id: choice_def.id.clone(),
                    tool_type: ToolType::Function,
                    role: Role::Assistant,
                    id: tc.id.clone(),
                    call_id: tc.id.clone(),
                    name: f.name.clone(),
                    arguments: f.arguments.clone(),
                    status,
                    web_search_tool_call_items: vec![],
                }));
            }
            "custom" => {
                let Some(c) = &tc.custom else { continue };
                if tc.id.is_empty() || c.name.trim().is_empty() {
                    continue;
                }
                let Some(choice_def) = name_map.get(&c.name) else {
                    debug!(name = %c.name, "dropping custom tool call without a matching tool choice");
                    continue;
                };
                outs.push(OutputUnion::tool_call(ToolCall {
                    choice_id: choice_def.id.clone(),
                    tool_type: ToolType::Custom,
                    role: Role::Assistant,
                    id: tc.id.clone(),
                    call_id: tc.id.clone(),
                    name: c.name.clone(),
                    arguments: c.input.clone(),
                    // No explicit status for custom tool calls.
                    status: Status::Completed,
                    web_search_tool_call_items: vec![],
                }));
            }
            _ => {
                debug!(call_type = %tc.call_type, "skipping unknown tool call type");
            }
        }
    }

    outs
}

fn chat_annotations_to_citations(anns: &[ChatAnnotationWire]) -> Vec<Citation> {
    anns.iter()
        .filter(|a| a.ann_type == "url_citation")
        .filter_map(|a| a.url_citation.as_ref())
        .map(|u| {
            Citation::url(UrlCitation {
                url: u.url.clone(),
                title: u.title.clone(),
                start_index: u.start_index,
                end_index: u.end_index,
                cited_text: String::new(),
                encrypted_index: String::new(),
            })
        })
        .collect()
}

fn finish_reason_to_status(reason: &str) -> Status {
    match reason {
        "length" => Status::Incomplete,
        "content_filter" => Status::Failed,
        "stop" | "tool_calls" => Status::Completed,
        // Unknown/empty counts as completed; transport errors surface
        // separately.
        _ => Status::Completed,
    }
}

fn usage_from_chat(resp: &ChatResponse) -> Usage {
    let Some(u) = &resp.usage else {
        return Usage::default();
    };
    let cached = u
        .prompt_tokens_details
        .as_ref()
        .map(|d| d.cached_tokens)
        .unwrap_or(0);
    Usage {
        input_tokens_total: u.prompt_tokens,
        input_tokens_cached: cached,
        input_tokens_uncached: (u.prompt_tokens - cached).max(0),
        output_tokens: u.completion_tokens,
        reasoning_tokens: u
            .completion_tokens_details
            .as_ref()
            .map(|d| d.reasoning_tokens)
            .unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::EmitFn;
    use serde_json::json;

    fn tool_choice(id: &str, name: &str, tool_type: ToolType) -> ToolChoice {
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
    fn system_prompt_role_depends_on_model_family() {
        let msg = system_prompt_message("openai", "gpt-5", "rules").unwrap();
        assert_eq!(msg.role, "developer");
        let msg = system_prompt_message("openai", "o3-mini", "rules").unwrap();
        assert_eq!(msg.role, "developer");
        let msg = system_prompt_message("openai", "gpt-4.1", "rules").unwrap();
        assert_eq!(msg.role, "system");
        let msg = system_prompt_message("my-proxy", "gpt-5", "rules").unwrap();
        assert_eq!(msg.role, "system");
        assert!(system_prompt_message("openai", "gpt-5", "  ").is_none());
    }

    #[test]
    fn reasoning_inputs_are_dropped() {
        let inputs = vec![
            InputUnion::user_text("q"),
            InputUnion::reasoning_message(ReasoningContent {
                thinking: vec!["chain".into()],
                signature: "sig".into(),
                ..ReasoningContent::default()
            }),
        ];
        let msgs = to_chat_messages("", &inputs, "gpt-4.1", "openai");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, "user");
    }

    #[test]
    fn user_parts_support_text_image_and_file() {
        let msg = InputOutputContent {
            id: String::new(),
            role: Role::User,
            status: Status::Completed,
            contents: vec![
                ContentItemUnion::text("look at this"),
                ContentItemUnion::image(ContentItemImage {
                    image_url: "https://img.example/x.png".into(),
                    detail: ImageDetail::Low,
                    ..ContentItemImage::default()
                }),
                ContentItemUnion::file(ContentItemFile {
                    file_data: "QUJD".into(),
                    file_name: "doc.pdf".into(),
                    ..ContentItemFile::default()
                }),
                // URL-only files cannot be expressed and are skipped.
                ContentItemUnion::file(ContentItemFile {
                    file_url: "https://files.example/doc.pdf".into(),
                    ..ContentItemFile::default()
                }),
            ],
        };
        let msgs = to_chat_messages("", &[InputUnion::input_message(msg)], "gpt-4.1", "openai");
        let content = msgs[0].content.as_ref().unwrap();
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["image_url"]["detail"], "low");
        assert_eq!(
            content[2]["file"]["file_data"],
            "data:application/pdf;base64,QUJD"
        );
        assert_eq!(content[2]["file"]["filename"], "doc.pdf");
        assert_eq!(content.as_array().unwrap().len(), 3);
    }

    #[test]
    fn tool_call_and_output_messages() {
        let call = InputUnion::tool_call(ToolCall {
            choice_id: "c1".into(),
            tool_type: ToolType::Function,
            role: Role::Assistant,
            id: "call_1".into(),
            call_id: "call_1".into(),
            name: "lookup".into(),
            arguments: r#"{"q":"x"}"#.into(),
            status: Status::Completed,
            web_search_tool_call_items: vec![],
        });
        let output = InputUnion::tool_output(ToolOutput {
            choice_id: "c1".into(),
            tool_type: ToolType::Function,
            role: Role::User,
            id: String::new(),
            call_id: "call_1".into(),
            name: "lookup".into(),
            status: Status::Completed,
            is_error: false,
            contents: vec![ContentItemUnion::text("result")],
            web_search_tool_output_items: vec![],
        });
        let msgs = to_chat_messages("", &[call, output], "gpt-4.1", "openai");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, "assistant");
        assert_eq!(msgs[0].tool_calls[0]["function"]["name"], "lookup");
        assert_eq!(msgs[1].role, "tool");
        assert_eq!(msgs[1].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn web_search_choice_becomes_options_not_tool() {
        let mut ws = tool_choice("ws1", "", ToolType::WebSearch);
        ws.arguments = None;
        ws.web_search_arguments = Some(WebSearchToolChoiceItem {
            search_context_size: "weird".into(),
            user_location: Some(WebSearchUserLocation {
                city: "Pune".into(),
                ..WebSearchUserLocation::default()
            }),
            ..WebSearchToolChoiceItem::default()
        });

        let (tools, _) = tool_choices_to_tools(&[
            tool_choice("f1", "lookup", ToolType::Function),
            ws.clone(),
        ]);
        let tools = tools.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["type"], "function");

        let opts = web_search_options_value(ws.web_search_arguments.as_ref().unwrap());
        assert_eq!(opts["search_context_size"], "medium");
        assert_eq!(opts["user_location"]["type"], "approximate");
        assert_eq!(opts["user_location"]["approximate"]["city"], "Pune");
        assert!(opts["user_location"]["approximate"].get("country").is_none());
    }

    #[test]
    fn decode_text_with_annotations_and_tool_calls() {
        let resp: ChatResponse = serde_json::from_value(json!({
            "id": "chatcmpl_1",
            "choices": [{
                "finish_reason": "tool_calls",
                "message": {
                    "content": "see docs",
                    "annotations": [{
                        "type": "url_citation",
                        "url_citation": {"url": "https://d.rs", "title": "Docs", "start_index": 0, "end_index": 8}
                    }],
                    "tool_calls": [
                        {"id": "call_1", "type": "function", "function": {"name": "lookup", "arguments": "{}"}},
                        {"id": "call_2", "type": "function", "function": {"name": "unmapped", "arguments": "{}"}}
                    ]
                }
            }],
            "usage": {"prompt_tokens": 8, "completion_tokens": 2,
                      "prompt_tokens_details": {"cached_tokens": 3},
                      "completion_tokens_details": {"reasoning_tokens": 1}}
        }))
        .unwrap();

        let (_, name_map) =
            build_tool_choice_name_mapping(&[tool_choice("c-l", "lookup", ToolType::Function)]);
        let outs = outputs_from_chat(&resp, &name_map);
        assert_eq!(outs.len(), 2);

        let m = outs[0].output_message.as_ref().unwrap();
        assert_eq!(m.status, Status::Completed);
        let t = m.contents[0].text_item.as_ref().unwrap();
        assert_eq!(t.citations[0].url_citation.as_ref().unwrap().url, "https://d.rs");

        let c = outs[1].function_tool_call.as_ref().unwrap();
        assert_eq!(c.choice_id, "c-l");

        let usage = usage_from_chat(&resp);
        assert_eq!(usage.input_tokens_total, 8);
        assert_eq!(usage.input_tokens_cached, 3);
        assert_eq!(usage.input_tokens_uncached, 5);
        assert_eq!(usage.reasoning_tokens, 1);
    }

    #[test]
    fn refusal_suppresses_text() {
        let resp: ChatResponse = serde_json::from_value(json!({
            "id": "chatcmpl_2",
            "choices": [{
                "finish_reason": "stop",
                "message": {"content": "should be hidden", "refusal": "cannot help with that"}
            }]
        }))
        .unwrap();
        let outs = outputs_from_chat(&resp, &HashMap::new());
        assert_eq!(outs.len(), 1);
        let m = outs[0].output_message.as_ref().unwrap();
        assert_eq!(m.contents.len(), 1);
        assert_eq!(m.contents[0].kind, ContentItemKind::Refusal);
        assert_eq!(
            m.contents[0].refusal_item.as_ref().unwrap().refusal,
            "cannot help with that"
        );
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(finish_reason_to_status("length"), Status::Incomplete);
        assert_eq!(finish_reason_to_status("content_filter"), Status::Failed);
        assert_eq!(finish_reason_to_status("stop"), Status::Completed);
        assert_eq!(finish_reason_to_status("tool_calls"), Status::Completed);
        assert_eq!(finish_reason_to_status(""), Status::Completed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn streaming_accumulates_choice_zero() {
        use std::sync::Mutex;
        let seen = Arc::new(Mutex::new(String::new()));
        let seen2 = Arc::clone(&seen);
        let emit: EmitFn = Arc::new(move |s: String| {
            seen2.lock().unwrap().push_str(&s);
            Ok(())
        });
        let text = BufferedStreamer::new(emit, Duration::from_secs(3600), 1 << 20);
        let mut acc = ChatAccumulator::default();

        let lines = [
            r#"data: {"id":"chatcmpl_s","choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"data: {"id":"chatcmpl_s","choices":[{"delta":{"content":"lo"}}]}"#,
            r#"data: {"id":"chatcmpl_s","choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"lookup","arguments":"{\"q\":"}}]}}]}"#,
            r#"data: {"id":"chatcmpl_s","choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"1}"}}]}}]}"#,
            r#"data: {"id":"chatcmpl_s","choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            r#"data: {"id":"chatcmpl_s","choices":[],"usage":{"prompt_tokens":5,"completion_tokens":2}}"#,
            r#"data: [DONE]"#,
        ];
        for line in lines {
            handle_sse_line(line, &mut acc, &text).unwrap();
        }
        text.flush();

        assert_eq!(seen.lock().unwrap().as_str(), "Hello");

        let resp = acc.into_response();
        assert_eq!(resp.id, "chatcmpl_s");
        let choice = &resp.choices[0];
        assert_eq!(choice.finish_reason, "tool_calls");
        assert_eq!(choice.message.content.as_deref(), Some("Hello"));
        let tc = &choice.message.tool_calls[0];
        assert_eq!(tc.id, "call_1");
        assert_eq!(tc.function.as_ref().unwrap().arguments, "{\"q\":1}");
        assert_eq!(resp.usage.as_ref().unwrap().prompt_tokens, 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refusal_deltas_do_not_emit_text() {
        use std::sync::Mutex;
        let seen = Arc::new(Mutex::new(String::new()));
        let seen2 = Arc::clone(&seen);
        let emit: EmitFn = Arc::new(move |s: String| {
            seen2.lock().unwrap().push_str(&s);
            Ok(())
        });
        let text = BufferedStreamer::new(emit, Duration::from_secs(3600), 1 << 20);
        let mut acc = ChatAccumulator::default();

        let lines = [
            r#"data: {"id":"c","choices":[{"delta":{"refusal":"no "}}]}"#,
            r#"data: {"id":"c","choices":[{"delta":{"refusal":"way"}},{"delta":{"content":"other choice"}}]}"#,
            r#"data: {"id":"c","choices":[{"delta":{},"finish_reason":"stop"}]}"#,
        ];
        for line in lines {
            handle_sse_line(line, &mut acc, &text).unwrap();
        }
        text.flush();

        assert!(seen.lock().unwrap().is_empty());
        let resp = acc.into_response();
        assert_eq!(resp.choices[0].message.refusal.as_deref(), Some("no way"));
    }

    #[test]
    fn request_wire_shape() {
        let wire = ChatRequest {
            model: "gpt-5".into(),
            max_completion_tokens: 1024,
            messages: vec![ChatMessageParam::with_content(
                "user",
                Value::String("hi".into()),
            )],
            temperature: Some(0.2),
            reasoning_effort: Some("low".into()),
            tools: None,
            web_search_options: Some(json!({"search_context_size": "medium"})),
            stream: true,
            stream_options: Some(StreamOptionsParam {
                include_usage: true,
            }),
        };
        let v = serde_json::to_value(&wire).unwrap();
        assert_eq!(v["max_completion_tokens"], 1024);
        assert_eq!(v["reasoning_effort"], "low");
        assert_eq!(v["web_search_options"]["search_context_size"], "medium");
        assert_eq!(v["stream_options"]["include_usage"], true);
    }
}
