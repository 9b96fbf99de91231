//! OpenAI Responses API adapter.
//!
//! Runs statelessly: `store` is always false and encrypted reasoning content
//! is requested so reasoning context can be replayed across turns without
//! server-side state.

mod reasoning;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::client::{
    apply_additional_parameters, read_body_with_debug, send_request, EndpointClient,
};
use crate::debug::{DebugSpan, HttpDebugger};
use crate::streaming::{stream_emit, BufferedStreamer, ResolvedStreamConfig, SseLineScanner};
use crate::tool_mapping::{build_tool_choice_name_mapping, tool_description};
use crate::types::*;
use crate::CompletionProvider;

use reasoning::sanitize_reasoning_inputs;

const RESPONSES_PATH: &str = "responses";
const ENCRYPTED_REASONING_INCLUDE: &str = "reasoning.encrypted_content";

/// `CompletionProvider` for the OpenAI Responses API.
pub struct OpenAiResponsesApi {
    state: RwLock<ProviderState>,
    debugger: Option<Arc<HttpDebugger>>,
}

struct ProviderState {
    param: ProviderParam,
    client: Option<EndpointClient>,
}

impl OpenAiResponsesApi {
    pub fn new(
        param: ProviderParam,
        debugger: Option<Arc<HttpDebugger>>,
    ) -> Result<OpenAiResponsesApi> {
        if param.name.is_empty() || param.origin.is_empty() {
            anyhow::bail!("openai responses api: invalid args");
        }
        Ok(OpenAiResponsesApi {
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

        let parsed: ResponsesResponse = match serde_json::from_slice(&bytes) {
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

        let is_nil_resp = parsed.output.is_empty();
        let full = serde_json::to_value(&parsed).ok();
        if let Some(d) = &self.debugger {
            resp.debug_details =
                d.build_debug_details(span.as_deref(), full.as_ref(), None, is_nil_resp);
        }
        resp.usage = Some(usage_from_response(&parsed));
        resp.outputs = outputs_from_response(&parsed, name_map);
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
        let thinking_streamer = BufferedStreamer::new(
            stream_emit(
                opts.stream_handler.clone(),
                StreamContentKind::Thinking,
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
                thinking_streamer.flush();
                return Err(self.fail(resp, span.as_deref(), None, e.to_string(), false));
            }
        };

        let mut scanner = SseLineScanner::new();
        let mut full_response: Option<ResponsesResponse> = None;
        let mut stream_err: Option<String> = None;
        let mut finished = false;

        'read: loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if let Some(span) = &span {
                        span.append_response_body(&chunk);
                    }
                    let res = scanner.push(&chunk, |line| {
                        handle_sse_line(
                            line,
                            &text_streamer,
                            &thinking_streamer,
                            &mut full_response,
                            &mut finished,
                        )
                    });
                    match res {
                        Ok(()) => {
                            if finished {
                                break 'read;
                            }
                        }
                        Err(e) => {
                            stream_err = Some(e.to_string());
                            break 'read;
                        }
                    }
                }
                Ok(None) => break 'read,
                Err(e) => {
                    stream_err = Some(format!("stream read failed: {e}"));
                    break 'read;
                }
            }
        }

        text_streamer.flush();
        thinking_streamer.flush();
        if let Some(span) = &span {
            span.finalize_response_body();
        }

        let parsed = full_response.unwrap_or_default();
        let is_nil_resp = parsed.output.is_empty();
        let full = serde_json::to_value(&parsed).ok();
        if let Some(d) = &self.debugger {
            resp.debug_details = d.build_debug_details(
                span.as_deref(),
                full.as_ref(),
                stream_err.as_deref(),
                is_nil_resp,
            );
        }
        resp.usage = Some(usage_from_response(&parsed));
        if !is_nil_resp {
            resp.outputs = outputs_from_response(&parsed, name_map);
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
    for (k, v) in OpenAiResponsesApi::auth_headers(param) {
        builder = builder.header(k, v);
    }
    Ok(builder.build()?)
}

#[async_trait]
impl CompletionProvider for OpenAiResponsesApi {
    async fn init_llm(&self) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if state.param.api_key.is_empty() {
            debug!(name = %state.param.name, "no API key given; not initializing client");
            return Ok(());
        }
        let client = EndpointClient::new(&state.param, RESPONSES_PATH)?;
        info!(name = %state.param.name, url = %client.endpoint, "openai responses provider initialized");
        state.client = Some(client);
        Ok(())
    }

    async fn deinit_llm(&self) -> Result<()> {
        let mut state = self.state.write().unwrap();
        state.client = None;
        info!(name = %state.param.name, "openai responses provider deinitialized");
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
                "openai responses api: client not initialized",
            ));
        };
        if request.inputs.is_empty() || request.model_param.name.is_empty() {
            return Err(CompletionError::new("openai responses api: invalid data"));
        }

        let mp = &request.model_param;
        let inputs = sanitize_reasoning_inputs(request.inputs);
        let input_items = to_input_items(&inputs);

        let reasoning = match mp.reasoning.as_ref() {
            Some(rp) if rp.reasoning_type == ReasoningType::SingleWithLevels => match rp.level {
                Some(level) => Some(ReasoningConfigParam {
                    effort: level.as_str().to_string(),
                    summary: "auto".to_string(),
                }),
                None => {
                    return Err(CompletionError::new(
                        "invalid reasoning level for singleWithLevels",
                    ));
                }
            },
            _ => None,
        };

        let (tools, name_map) = tool_choices_to_tools(&request.tool_choices);

        let stream = mp.stream && opts.stream_handler.is_some();
        let wire = ResponsesRequest {
            model: mp.name.clone(),
            max_output_tokens: mp.max_output_length,
            input: input_items,
            instructions: {
                let sys = mp.system_prompt.trim();
                (!sys.is_empty()).then(|| sys.to_string())
            },
            temperature: mp.temperature,
            reasoning,
            tools,
            store: false,
            stream,
            include: vec![ENCRYPTED_REASONING_INCLUDE.to_string()],
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
struct ResponsesRequest {
    model: String,
    max_output_tokens: i64,
    input: Vec<InputItemParam>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<ReasoningConfigParam>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefParam>>,
    store: bool,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    include: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ReasoningConfigParam {
    effort: String,
    summary: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InputItemParam {
    Message {
        role: &'static str,
        content: Vec<ContentPartParam>,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<&'static str>,
    },
    Reasoning {
        id: String,
        summary: Vec<SummaryPartParam>,
        #[serde(skip_serializing_if = "Option::is_none")]
        encrypted_content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<&'static str>,
    },
    FunctionCall {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        call_id: String,
        name: String,
        arguments: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<&'static str>,
    },
    FunctionCallOutput {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        call_id: String,
        output: Vec<ContentPartParam>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<&'static str>,
    },
    CustomToolCall {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        call_id: String,
        name: String,
        input: String,
    },
    CustomToolCallOutput {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        call_id: String,
        output: Vec<ContentPartParam>,
    },
    WebSearchCall {
        id: String,
        status: &'static str,
        action: Value,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPartParam {
    InputText {
        text: String,
    },
    InputImage {
        image_url: String,
        detail: &'static str,
    },
    InputFile {
        #[serde(skip_serializing_if = "Option::is_none")]
        file_data: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    OutputText {
        text: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        annotations: Vec<AnnotationParam>,
    },
    Refusal {
        refusal: String,
    },
}

#[derive(Debug, Serialize)]
struct SummaryPartParam {
    #[serde(rename = "type")]
    part_type: &'static str,
    text: String,
}

#[derive(Debug, Serialize)]
struct AnnotationParam {
    #[serde(rename = "type")]
    ann_type: &'static str,
    url: String,
    title: String,
    start_index: i64,
    end_index: i64,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ToolDefParam {
    Function {
        #[serde(rename = "type")]
        tool_type: &'static str,
        name: String,
        parameters: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    WebSearch {
        #[serde(rename = "type")]
        tool_type: &'static str,
        search_context_size: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        filters: Option<WebSearchFiltersParam>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_location: Option<Value>,
    },
}

#[derive(Debug, Serialize)]
struct WebSearchFiltersParam {
    allowed_domains: Vec<String>,
}

// --- Wire shapes (response) ---

#[derive(Debug, Default, Serialize, Deserialize)]
struct ResponsesResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    output: Vec<OutputItemWire>,
    #[serde(default)]
    usage: Option<ResponsesUsageWire>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    incomplete_details: Option<IncompleteDetailsWire>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IncompleteDetailsWire {
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputItemWire {
    Message {
        #[serde(default)]
        id: String,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        content: Vec<OutputContentWire>,
    },
    Reasoning {
        #[serde(default)]
        id: String,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        summary: Vec<SummaryWire>,
        #[serde(default)]
        content: Vec<ReasoningTextWire>,
        #[serde(default)]
        encrypted_content: Option<String>,
    },
    FunctionCall {
        #[serde(default)]
        id: String,
        #[serde(default)]
        call_id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        arguments: String,
        #[serde(default)]
        status: Option<String>,
    },
    CustomToolCall {
        #[serde(default)]
        id: String,
        #[serde(default)]
        call_id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: String,
    },
    WebSearchCall {
        #[serde(default)]
        id: String,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        action: Option<WebSearchActionWire>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputContentWire {
    OutputText {
        #[serde(default)]
        text: String,
        #[serde(default)]
        annotations: Vec<AnnotationWire>,
    },
    Refusal {
        #[serde(default)]
        refusal: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AnnotationWire {
    #[serde(rename = "type", default)]
    ann_type: String,
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
struct SummaryWire {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ReasoningTextWire {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WebSearchActionWire {
    #[serde(rename = "type", default)]
    action_type: String,
    #[serde(default)]
    query: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    pattern: String,
    #[serde(default)]
    sources: Vec<WebSearchSourceWire>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WebSearchSourceWire {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ResponsesUsageWire {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
    #[serde(default)]
    input_tokens_details: Option<InputTokensDetailsWire>,
    #[serde(default)]
    output_tokens_details: Option<OutputTokensDetailsWire>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct InputTokensDetailsWire {
    #[serde(default)]
    cached_tokens: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OutputTokensDetailsWire {
    #[serde(default)]
    reasoning_tokens: i64,
}

// --- SSE events ---

#[derive(Debug, Deserialize)]
struct SseEventWire {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    response: Option<ResponsesResponse>,
}

fn handle_sse_line(
    line: &str,
    text_streamer: &BufferedStreamer,
    thinking_streamer: &BufferedStreamer,
    full_response: &mut Option<ResponsesResponse>,
    finished: &mut bool,
) -> Result<()> {
    let Some(data) = line.strip_prefix("data: ") else {
        return Ok(());
    };
    if data.trim() == "[DONE]" {
        *finished = true;
        return Ok(());
    }

    let event: SseEventWire = match serde_json::from_str(data) {
        Ok(e) => e,
        Err(e) => {
            debug!(error = %e, "ignoring unparseable stream event");
            return Ok(());
        }
    };

    match event.event_type.as_str() {
        "response.output_text.delta" => {
            if let Some(delta) = event.delta {
                text_streamer.write(&delta)?;
            }
        }
        "response.reasoning_text.delta" | "response.reasoning_summary_text.delta" => {
            if let Some(delta) = event.delta {
                thinking_streamer.write(&delta)?;
            }
        }
        "response.completed" => {
            *full_response = event.response;
            *finished = true;
        }
        "response.failed" => {
            let message = event
                .response
                .as_ref()
                .and_then(|r| r.error.as_ref())
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            *full_response = event.response;
            anyhow::bail!("API failed, {message}");
        }
        "response.incomplete" => {
            let reason = event
                .response
                .as_ref()
                .and_then(|r| r.incomplete_details.as_ref())
                .map(|d| d.reason.clone())
                .unwrap_or_default();
            *full_response = event.response;
            anyhow::bail!("API finished as incomplete, {reason}");
        }
        _ => {}
    }
    Ok(())
}

// --- Canonical -> wire conversion ---

fn to_input_items(inputs: &[InputUnion]) -> Vec<InputItemParam> {
    let mut out = Vec::new();

    for input in inputs {
        if input.is_empty() {
            continue;
        }
        match input.kind {
            InputKind::InputMessage => {
                let Some(msg) = &input.input_message else { continue };
                // Dev/system instructions travel in the top-level field; only
                // the user role is valid here.
                if msg.role != Role::User {
                    continue;
                }
                let content = input_content_parts(&msg.contents);
                if content.is_empty() {
                    continue;
                }
                out.push(InputItemParam::Message {
                    role: "user",
                    content,
                    id: None,
                    status: None,
                });
            }
            InputKind::OutputMessage => {
                let Some(msg) = &input.output_message else { continue };
                if msg.role != Role::Assistant {
                    continue;
                }
                let content = output_content_parts(&msg.contents);
                if content.is_empty() {
                    continue;
                }
                out.push(InputItemParam::Message {
                    role: "assistant",
                    content,
                    id: (!msg.id.is_empty()).then(|| msg.id.clone()),
                    status: Some(msg.status.as_str()),
                });
            }
            InputKind::ReasoningMessage => {
                let Some(r) = &input.reasoning_message else { continue };
                out.push(reasoning_to_item(r));
            }
            InputKind::FunctionToolCall | InputKind::CustomToolCall | InputKind::WebSearchToolCall => {
                if let Some(item) = input.as_tool_call().and_then(tool_call_to_item) {
                    out.push(item);
                }
            }
            InputKind::FunctionToolOutput | InputKind::CustomToolOutput => {
                if let Some(item) = input.as_tool_output().and_then(tool_output_to_item) {
                    out.push(item);
                }
            }
            // This API has no web-search output item.
            InputKind::WebSearchToolOutput => {}
        }
    }

    out
}

fn input_content_parts(items: &[ContentItemUnion]) -> Vec<ContentPartParam> {
    let mut out = Vec::with_capacity(items.len());
    for it in items {
        match it.kind {
            ContentItemKind::Text => {
                if let Some(t) = &it.text_item {
                    let txt = t.text.trim();
                    if !txt.is_empty() {
                        out.push(ContentPartParam::InputText {
                            text: txt.to_string(),
                        });
                    }
                }
            }
            ContentItemKind::Image => {
                let Some(img) = &it.image_item else { continue };
                let data = img.image_data.trim();
                let url = img.image_url.trim();
                // Supplied data wins over a URL.
                let image_url = if !data.is_empty() {
                    let mime = img.image_mime.trim();
                    let mime = if mime.is_empty() { DEFAULT_IMAGE_DATA_MIME } else { mime };
                    format!("data:{mime};base64,{data}")
                } else if !url.is_empty() {
                    url.to_string()
                } else {
                    debug!(id = %img.id, name = %img.image_name, "no data or url present for image");
                    continue;
                };
                out.push(ContentPartParam::InputImage {
                    image_url,
                    detail: img.detail.as_str(),
                });
            }
            ContentItemKind::File => {
                let Some(f) = &it.file_item else { continue };
                let data = f.file_data.trim();
                let url = f.file_url.trim();
                if !data.is_empty() {
                    let mime = f.file_mime.trim();
                    let mime = if mime.is_empty() { DEFAULT_FILE_DATA_MIME } else { mime };
                    let name = f.file_name.trim();
                    out.push(ContentPartParam::InputFile {
                        file_data: Some(format!("data:{mime};base64,{data}")),
                        file_url: None,
                        filename: (!name.is_empty()).then(|| name.to_string()),
                    });
                } else if !url.is_empty() {
                    out.push(ContentPartParam::InputFile {
                        file_data: None,
                        file_url: Some(url.to_string()),
                        filename: None,
                    });
                } else {
                    debug!(id = %f.id, name = %f.file_name, "no data or url present for file");
                }
            }
            // Refusals are assistant output, not input.
            ContentItemKind::Refusal => {}
        }
    }
    out
}

fn output_content_parts(items: &[ContentItemUnion]) -> Vec<ContentPartParam> {
    let mut out = Vec::with_capacity(items.len());
    for it in items {
        match it.kind {
            ContentItemKind::Text => {
                if let Some(t) = &it.text_item {
                    out.push(ContentPartParam::OutputText {
                        text: t.text.clone(),
                        annotations: citations_to_annotations(&t.citations),
                    });
                }
            }
            ContentItemKind::Refusal => {
                if let Some(r) = &it.refusal_item {
                    out.push(ContentPartParam::Refusal {
                        refusal: r.refusal.clone(),
                    });
                }
            }
            // Images and files are not valid assistant output parts.
            ContentItemKind::Image | ContentItemKind::File => {}
        }
    }
    out
}

fn citations_to_annotations(citations: &[Citation]) -> Vec<AnnotationParam> {
    citations
        .iter()
        .filter_map(|c| c.url_citation.as_ref())
        .map(|u| AnnotationParam {
            ann_type: "url_citation",
            url: u.url.clone(),
            title: u.title.clone(),
            start_index: u.start_index,
            end_index: u.end_index,
        })
        .collect()
}

fn reasoning_to_item(r: &ReasoningContent) -> InputItemParam {
    let summary = r
        .summary
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| SummaryPartParam {
            part_type: "summary_text",
            text: s.to_string(),
        })
        .collect();
    InputItemParam::Reasoning {
        id: r.id.clone(),
        summary,
        encrypted_content: r.first_non_empty_encrypted().map(str::to_string),
        status: Some(r.status.as_str()),
    }
}

fn tool_call_to_item(call: &ToolCall) -> Option<InputItemParam> {
    if call.id.trim().is_empty() {
        return None;
    }
    match call.tool_type {
        ToolType::Function => Some(InputItemParam::FunctionCall {
            id: Some(call.id.clone()),
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            status: Some(call.status.as_str()),
        }),
        ToolType::Custom => Some(InputItemParam::CustomToolCall {
            id: Some(call.id.clone()),
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            input: call.arguments.clone(),
        }),
        ToolType::WebSearch => {
            let item = call.web_search_tool_call_items.first()?;
            let action = match item.kind {
                WebSearchToolCallKind::Search => {
                    let s = item.search_item.as_ref()?;
                    serde_json::json!({
                        "type": "search",
                        "query": s.query,
                        "sources": s.sources.iter().map(|src| serde_json::json!({"url": src.url})).collect::<Vec<_>>(),
                    })
                }
                WebSearchToolCallKind::OpenPage => {
                    let p = item.open_page_item.as_ref()?;
                    serde_json::json!({"type": "open_page", "url": p.url})
                }
                WebSearchToolCallKind::Find => {
                    let f = item.find_item.as_ref()?;
                    serde_json::json!({"type": "find", "pattern": f.pattern, "url": f.url})
                }
            };
            Some(InputItemParam::WebSearchCall {
                id: call.id.clone(),
                status: call.status.as_str(),
                action,
            })
        }
    }
}

fn tool_output_to_item(output: &ToolOutput) -> Option<InputItemParam> {
    if output.call_id.trim().is_empty() {
        return None;
    }
    let parts = input_content_parts(&output.contents);
    if parts.is_empty() {
        return None;
    }
    match output.tool_type {
        ToolType::Function => Some(InputItemParam::FunctionCallOutput {
            id: (!output.id.is_empty()).then(|| output.id.clone()),
            call_id: output.call_id.clone(),
            output: parts,
            status: Some(output.status.as_str()),
        }),
        ToolType::Custom => Some(InputItemParam::CustomToolCallOutput {
            id: (!output.id.is_empty()).then(|| output.id.clone()),
            call_id: output.call_id.clone(),
            output: parts,
        }),
        ToolType::WebSearch => None,
    }
}

fn tool_choices_to_tools(
    tool_choices: &[ToolChoice],
) -> (Option<Vec<ToolDefParam>>, HashMap<String, ToolChoice>) {
    if tool_choices.is_empty() {
        return (None, HashMap::new());
    }

    let (ordered, name_map) = build_tool_choice_name_mapping(tool_choices);
    let mut out = Vec::with_capacity(ordered.len());
    let mut web_search_added = false;

    for named in &ordered {
        let tc = &named.choice;
        match tc.tool_type {
            // Both function and custom tools are expressed as function tools
            // for now.
            ToolType::Function | ToolType::Custom => {
                let Some(args) = &tc.arguments else { continue };
                if named.name.is_empty() {
                    continue;
                }
                let desc = tool_description(tc);
                out.push(ToolDefParam::Function {
                    tool_type: "function",
                    name: named.name.clone(),
                    parameters: Value::Object(args.clone()),
                    description: (!desc.is_empty()).then_some(desc),
                });
            }
            ToolType::WebSearch => {
                let Some(ws) = &tc.web_search_arguments else { continue };
                if web_search_added {
                    continue;
                }
                let size = match ws.search_context_size.trim().to_lowercase().as_str() {
                    "low" => "low",
                    "high" => "high",
                    _ => "medium",
                };
                let user_location = ws.user_location.as_ref().map(|ul| {
                    serde_json::json!({
                        "type": "approximate",
                        "city": ul.city,
                        "country": ul.country,
                        "region": ul.region,
                        "timezone": ul.timezone,
                    })
                });
                out.push(ToolDefParam::WebSearch {
                    tool_type: "web_search",
                    search_context_size: size.to_string(),
                    filters: (!ws.allowed_domains.is_empty()).then(|| WebSearchFiltersParam {
                        allowed_domains: ws.allowed_domains.clone(),
                    }),
                    user_location,
                });
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

fn outputs_from_response(
    resp: &ResponsesResponse,
    name_map: &HashMap<String, ToolChoice>,
) -> Vec<OutputUnion> {
    let mut outs = Vec::new();

    for item in &resp.output {
        match item {
            OutputItemWire::Message { id, status, content } => {
                let mut msg = InputOutputContent {
                    id: id.clone(),
                    role: Role::Assistant,
                    status: Status::from_wire(status.as_deref().unwrap_or_default()),
                    contents: vec![],
                };
                for c in content {
                    match c {
                        OutputContentWire::OutputText { text, annotations } => {
                            if text.trim().is_empty() {
                                continue;
                            }
                            msg.contents.push(ContentItemUnion::text_with_citations(
                                text.clone(),
                                annotations_to_citations(annotations),
                            ));
                        }
                        OutputContentWire::Refusal { refusal } => {
                            let r = refusal.trim();
                            if !r.is_empty() {
                                msg.contents.push(ContentItemUnion::refusal(r));
                            }
                        }
                        OutputContentWire::Unknown => {
                            debug!("skipping unknown output content part");
                        }
                    }
                }
                if !msg.contents.is_empty() {
                    outs.push(OutputUnion::output_message(msg));
                }
            }
            OutputItemWire::Reasoning {
                id,
                status,
                summary,
                content,
                encrypted_content,
            } => {
                let mut r = ReasoningContent {
                    id: id.clone(),
                    role: Role::Assistant,
                    status: Status::from_wire(status.as_deref().unwrap_or_default()),
                    ..ReasoningContent::default()
                };
                if let Some(enc) = encrypted_content {
                    if !enc.is_empty() {
                        r.encrypted_content = vec![enc.clone()];
                    }
                }
                r.summary = summary
                    .iter()
                    .map(|s| s.text.trim())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                r.thinking = content
                    .iter()
                    .map(|c| c.text.trim())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                outs.push(OutputUnion::reasoning_message(r));
            }
            OutputItemWire::FunctionCall {
                id,
                call_id,
                name,
                arguments,
                status,
            } => {
                if call_id.is_empty() || name.trim().is_empty() {
                    continue;
                }
                let Some(tc) = name_map.get(name) else {
                    debug!(name, "dropping function call without a matching tool choice");
                    continue;
                };
                outs.push(OutputUnion::tool_call(ToolCall {
                    choice_id: tc.id.clone(),
                    tool_type: ToolType::Function,
                    role: Role::Assistant,
                    id: id.clone(),
                    call_id: call_id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                    status: Status::from_wire(status.as_deref().unwrap_or_default()),
                    web_search_tool_call_items: vec![],
                }));
            }
            OutputItemWire::CustomToolCall {
                id,
                call_id,
                name,
                input,
            } => {
                if call_id.is_empty() || name.trim().is_empty() {
                    continue;
                }
                let Some(tc) = name_map.get(name) else {
                    debug!(name, "dropping custom tool call without a matching tool choice");
                    continue;
                };
                outs.push(OutputUnion::tool_call(ToolCall {
                    choice_id: tc.id.clone(),
                    tool_type: ToolType::Custom,
                    role: Role::Assistant,
                    id: id.clone(),
                    call_id: call_id.clone(),
                    name: name.clone(),
                    arguments: input.clone(),
                    // No status on custom tool calls; consider them complete.
                    status: Status::Completed,
                    web_search_tool_call_items: vec![],
                }));
            }
            OutputItemWire::WebSearchCall { id, status, action } => {
                if id.is_empty() {
                    continue;
                }
                // Web-search calls carry no tool name; resolve the single
                // web_search tool choice by type.
                let Some(choice_id) = name_map
                    .values()
                    .find(|tc| tc.tool_type == ToolType::WebSearch)
                    .map(|tc| tc.id.clone())
                else {
                    debug!("dropping web search call without a web_search tool choice");
                    continue;
                };

                let mut call = ToolCall {
                    choice_id,
                    tool_type: ToolType::WebSearch,
                    role: Role::Assistant,
                    id: id.clone(),
                    call_id: id.clone(),
                    name: DEFAULT_WEB_SEARCH_TOOL_NAME.to_string(),
                    arguments: String::new(),
                    status: Status::from_wire(status.as_deref().unwrap_or_default()),
                    web_search_tool_call_items: vec![],
                };
                if let Some(action) = action {
                    match action.action_type.as_str() {
                        "search" => {
                            call.web_search_tool_call_items =
                                vec![WebSearchToolCallItemUnion::search(WebSearchToolCallSearch {
                                    query: action.query.clone(),
                                    input: None,
                                    sources: action
                                        .sources
                                        .iter()
                                        .map(|s| WebSearchToolCallSearchSource {
                                            url: s.url.clone(),
                                        })
                                        .collect(),
                                })];
                        }
                        "open_page" => {
                            call.web_search_tool_call_items =
                                vec![WebSearchToolCallItemUnion::open_page(action.url.clone())];
                        }
                        "find" => {
                            call.web_search_tool_call_items = vec![WebSearchToolCallItemUnion::find(
                                action.pattern.clone(),
                                action.url.clone(),
                            )];
                        }
                        _ => {}
                    }
                }
                outs.push(OutputUnion::tool_call(call));
            }
            OutputItemWire::Unknown => {
                debug!("skipping unknown output item");
            }
        }
    }

    outs
}

fn annotations_to_citations(anns: &[AnnotationWire]) -> Vec<Citation> {
    anns.iter()
        .filter(|a| a.ann_type == "url_citation")
        .map(|a| {
            Citation::url(UrlCitation {
                url: a.url.clone(),
                title: a.title.clone(),
                start_index: a.start_index,
                end_index: a.end_index,
                cited_text: String::new(),
                encrypted_index: String::new(),
            })
        })
        .collect()
}

fn usage_from_response(resp: &ResponsesResponse) -> Usage {
    let Some(u) = &resp.usage else {
        return Usage::default();
    };
    let cached = u
        .input_tokens_details
        .as_ref()
        .map(|d| d.cached_tokens)
        .unwrap_or(0);
    Usage {
        input_tokens_total: u.input_tokens,
        input_tokens_cached: cached,
        input_tokens_uncached: (u.input_tokens - cached).max(0),
        output_tokens: u.output_tokens,
        reasoning_tokens: u
            .output_tokens_details
            .as_ref()
            .map(|d| d.reasoning_tokens)
            .unwrap_or(0),
    }
}
