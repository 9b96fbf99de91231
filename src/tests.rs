//! End-to-end tests against local mock vendor endpoints.
//!
//! Each test spins up an axum server playing one vendor, registers a
//! provider pointed at it, and drives the full fetch path: request build,
//! HTTP, streaming demux, decoding, and debug capture.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::http::header;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::debug::{DebugConfig, HttpDebugger};
use crate::types::*;
use crate::{AddProviderConfig, DebuggerBuilder, ProviderSetApi};

async fn spawn_server(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn debugger_builder() -> DebuggerBuilder {
    Arc::new(|_param| Some(Arc::new(HttpDebugger::new(DebugConfig::default()))))
}

fn model(name: &str, stream: bool) -> ModelParam {
    ModelParam {
        name: name.into(),
        stream,
        max_prompt_length: 0,
        max_output_length: 512,
        temperature: Some(0.4),
        reasoning: None,
        system_prompt: "be helpful".into(),
        timeout: 10,
        additional_parameters_raw_json: None,
    }
}

async fn provider_set(
    name: &str,
    sdk_type: ProviderSdkType,
    origin: String,
) -> ProviderSetApi {
    let set = ProviderSetApi::new().with_debugger_builder(debugger_builder());
    set.add_provider(
        name,
        &AddProviderConfig {
            sdk_type: Some(sdk_type),
            origin,
            ..AddProviderConfig::default()
        },
    )
    .unwrap();
    set.set_provider_api_key(name, "sk-test-secret").await.unwrap();
    set
}

#[tokio::test(flavor = "multi_thread")]
async fn responses_basic_text_round_trip() {
    let router = Router::new().route(
        "/v1/responses",
        post(|| async {
            Json(json!({
                "id": "resp_1",
                "output": [{
                    "type": "message", "id": "msg_1", "role": "assistant", "status": "completed",
                    "content": [{"type": "output_text", "text": "Hello there!"}]
                }],
                "usage": {
                    "input_tokens": 12, "output_tokens": 4,
                    "input_tokens_details": {"cached_tokens": 3}
                }
            }))
        }),
    );
    let addr = spawn_server(router).await;

    let set = provider_set(
        "openai",
        ProviderSdkType::OpenAiResponses,
        format!("http://{addr}/v1"),
    )
    .await;

    let resp = set
        .fetch_completion(
            "openai",
            FetchCompletionRequest {
                model_param: model("gpt-5", false),
                inputs: vec![InputUnion::user_text("Hello")],
                tool_choices: vec![],
            },
            FetchCompletionOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(resp.outputs.len(), 1);
    let msg = resp.outputs[0].output_message.as_ref().unwrap();
    assert_eq!(msg.status, Status::Completed);
    assert_eq!(
        msg.contents[0].text_item.as_ref().unwrap().text,
        "Hello there!"
    );

    let usage = resp.usage.unwrap();
    assert_eq!(usage.input_tokens_total, 12);
    assert_eq!(
        usage.input_tokens_uncached,
        (usage.input_tokens_total - usage.input_tokens_cached).max(0)
    );

    let debug = resp.debug_details.unwrap();
    assert!(debug.get("requestDetails").is_some());
    assert_eq!(debug["responseDetails"]["status"], 200);
}

#[tokio::test(flavor = "multi_thread")]
async fn debug_blob_redacts_secrets_and_content() {
    let router = Router::new().route(
        "/v1/responses",
        post(|| async { Json(json!({"id": "resp_d", "output": [], "usage": {"input_tokens": 1, "output_tokens": 0}})) }),
    );
    let addr = spawn_server(router).await;

    let set = provider_set(
        "openai",
        ProviderSdkType::OpenAiResponses,
        format!("http://{addr}/v1"),
    )
    .await;

    let resp = set
        .fetch_completion(
            "openai",
            FetchCompletionRequest {
                model_param: model("gpt-5", false),
                inputs: vec![InputUnion::user_text("top secret question")],
                tool_choices: vec![],
            },
            FetchCompletionOptions::default(),
        )
        .await
        .unwrap();

    let debug = resp.debug_details.unwrap();
    let req_details = &debug["requestDetails"];

    // The bearer token never appears anywhere in the blob.
    let rendered = serde_json::to_string(&debug).unwrap();
    assert!(!rendered.contains("sk-test-secret"));
    assert_eq!(req_details["headers"]["authorization"], "***");

    // Prompt text is stripped from the captured body, metadata kept.
    assert_eq!(
        req_details["data"]["input"][0]["content"][0]["text"],
        "[omitted: llm text content]"
    );
    assert_eq!(req_details["data"]["model"], "gpt-5");
    assert_eq!(req_details["data"]["store"], false);

    let curl = req_details["curlCommand"].as_str().unwrap();
    assert!(curl.starts_with("curl -X POST"));
    assert!(!curl.contains("sk-test-secret"));
}

#[tokio::test(flavor = "multi_thread")]
async fn anthropic_thinking_disabled_on_tool_result_turn() {
    let captured: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
    let captured2 = Arc::clone(&captured);

    let router = Router::new().route(
        "/v1/messages",
        post(move |Json(body): Json<Value>| {
            let captured = Arc::clone(&captured2);
            async move {
                *captured.lock().unwrap() = Some(body);
                Json(json!({
                    "id": "msg_t",
                    "content": [{"type": "text", "text": "done"}],
                    "stop_reason": "end_turn",
                    "usage": {"input_tokens": 5, "output_tokens": 2}
                }))
            }
        }),
    );
    let addr = spawn_server(router).await;

    let set = provider_set(
        "anthropic",
        ProviderSdkType::Anthropic,
        format!("http://{addr}"),
    )
    .await;

    let mut mp = model("claude-sonnet-4-5", false);
    mp.reasoning = Some(ReasoningParam {
        reasoning_type: ReasoningType::SingleWithLevels,
        level: Some(ReasoningLevel::High),
        tokens: 0,
    });

    let call = ToolCall {
        choice_id: "c1".into(),
        tool_type: ToolType::Function,
        role: Role::Assistant,
        id: "t1".into(),
        call_id: "t1".into(),
        name: "lookup".into(),
        arguments: "{}".into(),
        status: Status::Completed,
        web_search_tool_call_items: vec![],
    };
    let output = ToolOutput {
        choice_id: "c1".into(),
        tool_type: ToolType::Function,
        role: Role::User,
        id: String::new(),
        call_id: "t1".into(),
        name: "lookup".into(),
        status: Status::Completed,
        is_error: false,
        contents: vec![ContentItemUnion::text("result")],
        web_search_tool_output_items: vec![],
    };

    set.fetch_completion(
        "anthropic",
        FetchCompletionRequest {
            model_param: mp,
            inputs: vec![
                InputUnion::user_text("ping"),
                InputUnion::tool_call(call),
                InputUnion::tool_output(output),
            ],
            tool_choices: vec![ToolChoice {
                id: "c1".into(),
                tool_type: ToolType::Function,
                name: "lookup".into(),
                description: String::new(),
                arguments: Some(serde_json::Map::new()),
                web_search_arguments: None,
            }],
        },
        FetchCompletionOptions::default(),
    )
    .await
    .unwrap();

    let body = captured.lock().unwrap().take().unwrap();
    // No reasoning history + tool-result turn: thinking off, temperature kept.
    assert!(body.get("thinking").is_none());
    assert_eq!(body["temperature"], 0.4);
    assert_eq!(body["messages"].as_array().unwrap().len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn anthropic_signed_history_forces_thinking_on() {
    let captured: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
    let captured2 = Arc::clone(&captured);

    let router = Router::new().route(
        "/v1/messages",
        post(move |Json(body): Json<Value>| {
            let captured = Arc::clone(&captured2);
            async move {
                *captured.lock().unwrap() = Some(body);
                Json(json!({
                    "id": "msg_s",
                    "content": [{"type": "text", "text": "ok"}],
                    "stop_reason": "end_turn",
                    "usage": {"input_tokens": 4, "output_tokens": 1}
                }))
            }
        }),
    );
    let addr = spawn_server(router).await;

    let set = provider_set(
        "anthropic",
        ProviderSdkType::Anthropic,
        format!("http://{addr}"),
    )
    .await;

    let inputs = vec![
        InputUnion::user_text("question"),
        InputUnion::reasoning_message(ReasoningContent {
            id: "r1".into(),
            role: Role::Assistant,
            status: Status::Completed,
            signature: "sig".into(),
            thinking: vec!["chain".into()],
            ..ReasoningContent::default()
        }),
        InputUnion::output_message(InputOutputContent {
            id: "a1".into(),
            role: Role::Assistant,
            status: Status::Completed,
            contents: vec![ContentItemUnion::text("answer")],
        }),
        InputUnion::tool_call(ToolCall {
            choice_id: "c1".into(),
            tool_type: ToolType::Function,
            role: Role::Assistant,
            id: "t1".into(),
            call_id: "t1".into(),
            name: "lookup".into(),
            arguments: "{}".into(),
            status: Status::Completed,
            web_search_tool_call_items: vec![],
        }),
        InputUnion::tool_output(ToolOutput {
            choice_id: "c1".into(),
            tool_type: ToolType::Function,
            role: Role::User,
            id: String::new(),
            call_id: "t1".into(),
            name: "lookup".into(),
            status: Status::Completed,
            is_error: false,
            contents: vec![ContentItemUnion::text("found")],
            web_search_tool_output_items: vec![],
        }),
    ];

    set.fetch_completion(
        "anthropic",
        FetchCompletionRequest {
            model_param: model("claude-sonnet-4-5", false),
            inputs,
            tool_choices: vec![ToolChoice {
                id: "c1".into(),
                tool_type: ToolType::Function,
                name: "lookup".into(),
                description: String::new(),
                arguments: Some(serde_json::Map::new()),
                web_search_arguments: None,
            }],
        },
        FetchCompletionOptions::default(),
    )
    .await
    .unwrap();

    let body = captured.lock().unwrap().take().unwrap();
    assert_eq!(body["thinking"]["type"], "enabled");
    assert!(body["thinking"]["budget_tokens"].as_i64().unwrap() >= 1024);
    // Temperature must be omitted while thinking is enabled.
    assert!(body.get("temperature").is_none());
    // The signed thinking block is replayed.
    let blocks: Vec<&str> = body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .flat_map(|m| m["content"].as_array().unwrap())
        .map(|b| b["type"].as_str().unwrap())
        .collect();
    assert!(blocks.contains(&"thinking"));
}

#[tokio::test(flavor = "multi_thread")]
async fn anthropic_streaming_delivers_text_and_thinking() {
    let sse_body = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_x\",\"content\":[],\"usage\":{\"input_tokens\":6,\"output_tokens\":0}}}\n",
        "\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"thinking\",\"thinking\":\"\",\"signature\":\"\"}}\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"thinking_delta\",\"thinking\":\"pondering\"}}\n",
        "data: {\"type\":\"content_block_stop\",\"index\":0}\n",
        "data: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n",
        "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello \"}}\n",
        "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"text_delta\",\"text\":\"world\"}}\n",
        "data: {\"type\":\"content_block_stop\",\"index\":1}\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":5}}\n",
        "data: {\"type\":\"message_stop\"}\n",
    );

    let router = Router::new().route(
        "/v1/messages",
        post(move || async move {
            ([(header::CONTENT_TYPE, "text/event-stream")], sse_body)
        }),
    );
    let addr = spawn_server(router).await;

    let set = provider_set(
        "anthropic",
        ProviderSdkType::Anthropic,
        format!("http://{addr}"),
    )
    .await;

    let events: Arc<Mutex<Vec<StreamEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let events2 = Arc::clone(&events);
    let handler: StreamHandler = Arc::new(move |event| {
        events2.lock().unwrap().push(event);
        Ok(())
    });

    let resp = set
        .fetch_completion(
            "anthropic",
            FetchCompletionRequest {
                model_param: model("claude-sonnet-4-5", true),
                inputs: vec![InputUnion::user_text("hi")],
                tool_choices: vec![],
            },
            FetchCompletionOptions {
                stream_handler: Some(handler),
                stream_config: Some(StreamConfig {
                    flush_interval_millis: 5,
                    flush_chunk_size: 4096,
                }),
            },
        )
        .await
        .unwrap();

    // Streamed bytes reassemble to the final text, per kind.
    let events = events.lock().unwrap();
    let text: String = events
        .iter()
        .filter_map(|e| e.text.as_ref())
        .map(|t| t.text.as_str())
        .collect();
    assert_eq!(text, "Hello world");
    let thinking: String = events
        .iter()
        .filter_map(|e| e.thinking.as_ref())
        .map(|t| t.text.as_str())
        .collect();
    assert_eq!(thinking, "pondering");
    assert!(events.iter().all(|e| e.provider == "anthropic"));

    assert_eq!(resp.outputs.len(), 2);
    assert_eq!(resp.usage.unwrap().output_tokens, 5);
    assert!(resp.error.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn chat_completions_tool_call_round_trip() {
    let router = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            Json(json!({
                "id": "chatcmpl_1",
                "choices": [{
                    "finish_reason": "tool_calls",
                    "message": {
                        "content": null,
                        "tool_calls": [{
                            "id": "call_7",
                            "type": "function",
                            "function": {"name": "lookup", "arguments": "{\"q\":\"x\"}"}
                        }]
                    }
                }],
                "usage": {"prompt_tokens": 9, "completion_tokens": 3,
                          "prompt_tokens_details": {"cached_tokens": 2}}
            }))
        }),
    );
    let addr = spawn_server(router).await;

    let set = provider_set(
        "openai-chat",
        ProviderSdkType::OpenAiChatCompletions,
        format!("http://{addr}/v1"),
    )
    .await;

    let resp = set
        .fetch_completion(
            "openai-chat",
            FetchCompletionRequest {
                model_param: model("gpt-4.1", false),
                inputs: vec![InputUnion::user_text("use the tool")],
                tool_choices: vec![ToolChoice {
                    id: "choice-lookup".into(),
                    tool_type: ToolType::Function,
                    name: "lookup".into(),
                    description: "find things".into(),
                    arguments: Some(serde_json::Map::new()),
                    web_search_arguments: None,
                }],
            },
            FetchCompletionOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(resp.outputs.len(), 1);
    let call = resp.outputs[0].as_tool_call().unwrap();
    assert_eq!(call.choice_id, "choice-lookup");
    assert_eq!(call.call_id, "call_7");

    let usage = resp.usage.unwrap();
    assert_eq!(usage.input_tokens_uncached, 7);
}

#[tokio::test(flavor = "multi_thread")]
async fn transport_failure_returns_partial_response() {
    let router = Router::new().route(
        "/v1/responses",
        post(|| async {
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": {"message": "upstream exploded"}})),
            )
        }),
    );
    let addr = spawn_server(router).await;

    let set = provider_set(
        "openai",
        ProviderSdkType::OpenAiResponses,
        format!("http://{addr}/v1"),
    )
    .await;

    let err = set
        .fetch_completion(
            "openai",
            FetchCompletionRequest {
                model_param: model("gpt-5", false),
                inputs: vec![InputUnion::user_text("boom")],
                tool_choices: vec![],
            },
            FetchCompletionOptions::default(),
        )
        .await
        .unwrap_err();

    assert!(err.message.starts_with("fetch completion failed for provider openai:"));
    let partial = err.response.as_ref().unwrap();
    assert!(partial.error.is_some());
    assert!(partial.usage.is_some());
    let debug = partial.debug_details.as_ref().unwrap();
    let message = debug["errorDetails"]["message"].as_str().unwrap();
    assert!(message.contains("500"));
}

#[tokio::test(flavor = "multi_thread")]
async fn prompt_filter_trims_history_before_dispatch() {
    let captured: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
    let captured2 = Arc::clone(&captured);

    let router = Router::new().route(
        "/v1/responses",
        post(move |Json(body): Json<Value>| {
            let captured = Arc::clone(&captured2);
            async move {
                *captured.lock().unwrap() = Some(body);
                Json(json!({"id": "resp_f", "output": [
                    {"type": "message", "id": "m", "role": "assistant", "status": "completed",
                     "content": [{"type": "output_text", "text": "ok"}]}
                ]}))
            }
        }),
    );
    let addr = spawn_server(router).await;

    let set = provider_set(
        "openai",
        ProviderSdkType::OpenAiResponses,
        format!("http://{addr}/v1"),
    )
    .await;

    let mut mp = model("gpt-5", false);
    mp.max_prompt_length = 3;

    set.fetch_completion(
        "openai",
        FetchCompletionRequest {
            model_param: mp,
            inputs: vec![
                InputUnion::user_text("a very old message that is quite long indeed"),
                InputUnion::user_text("recent"),
            ],
            tool_choices: vec![],
        },
        FetchCompletionOptions::default(),
    )
    .await
    .unwrap();

    let body = captured.lock().unwrap().take().unwrap();
    let input = body["input"].as_array().unwrap();
    assert_eq!(input.len(), 1);
}
