//! Normalized, stateless facade for chat-style LLM inference across multiple
//! provider APIs (Anthropic Messages, OpenAI Chat Completions, OpenAI
//! Responses).
//!
//! The main entry point is [`ProviderSetApi`], which lets you:
//!
//! - register one or more providers and rotate their API keys,
//! - send normalized completion requests and receive normalized outputs,
//! - optionally stream partial text / reasoning via a callback,
//! - capture scrubbed HTTP-level debug information per request.
//!
//! Each vendor integration translates the canonical request/response model
//! (see [`types`]) to and from its wire protocol, drives the provider's SSE
//! stream, and normalizes token accounting and error reporting. Responses
//! may carry both outputs and an error: transport failures return the
//! partial response inside [`types::CompletionError`].

#[cfg(test)]
mod tests;

mod anthropic;
mod client;
pub mod contract;
pub mod debug;
mod openai_chat;
mod openai_responses;
mod provider_set;
pub mod streaming;
pub mod token_filter;
pub mod tool_mapping;
pub mod types;

use anyhow::Result;
use async_trait::async_trait;

pub use anthropic::AnthropicMessagesApi;
pub use contract::{
    compute_data_contract_hash, data_contract_info, validate_data_contract, DataContractInfo,
    DATA_CONTRACT_HASH, DATA_CONTRACT_VERSION,
};
pub use debug::{DebugConfig, DebuggerBuilder, HttpDebugger};
pub use openai_chat::OpenAiChatCompletionsApi;
pub use openai_responses::OpenAiResponsesApi;
pub use provider_set::{AddProviderConfig, ProviderSetApi};
pub use types::*;

/// A single configured vendor integration.
///
/// Implementations hold their mutable `{param, client}` pair behind a lock;
/// fetches snapshot the client so concurrent key rotation never affects
/// in-flight requests.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Builds the vendor client from the current configuration. A missing
    /// API key is not an error; the provider simply stays uninitialized.
    async fn init_llm(&self) -> Result<()>;

    /// Drops the vendor client.
    async fn deinit_llm(&self) -> Result<()>;

    /// Snapshot copy of the provider configuration.
    fn provider_info(&self) -> ProviderParam;

    /// Whether an API key is currently set.
    fn is_configured(&self) -> bool;

    /// Stores a new API key; does not touch the client (see
    /// [`CompletionProvider::init_llm`] / [`CompletionProvider::deinit_llm`]).
    fn set_api_key(&self, api_key: &str) -> Result<()>;

    /// Sends a normalized completion request. On transport or stream
    /// failure, the partial response (usage, debug details) travels inside
    /// the returned [`CompletionError`].
    async fn fetch_completion(
        &self,
        request: FetchCompletionRequest,
        opts: FetchCompletionOptions,
    ) -> std::result::Result<FetchCompletionResponse, CompletionError>;
}
