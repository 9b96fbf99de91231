//! Name-keyed registry of configured providers.
//!
//! Adds, deletes, and key rotation take the write lock; fetches snapshot the
//! provider under the read lock and run outside it, so in-flight requests
//! keep the client they started with.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use tracing::info;

use crate::anthropic::AnthropicMessagesApi;
use crate::debug::DebuggerBuilder;
use crate::openai_chat::OpenAiChatCompletionsApi;
use crate::openai_responses::OpenAiResponsesApi;
use crate::token_filter::filter_messages_by_token_count;
use crate::types::{
    CompletionError, FetchCompletionOptions, FetchCompletionRequest, FetchCompletionResponse,
    ProviderParam, ProviderSdkType,
};
use crate::CompletionProvider;

/// Configuration for registering a provider. The API key is set separately
/// via [`ProviderSetApi::set_provider_api_key`].
#[derive(Debug, Clone, Default)]
pub struct AddProviderConfig {
    pub sdk_type: Option<ProviderSdkType>,
    pub origin: String,
    pub chat_completion_path_prefix: String,
    pub api_key_header_key: String,
    pub default_headers: HashMap<String, String>,
}

/// The single, normalized entry point for completions across providers.
pub struct ProviderSetApi {
    providers: RwLock<HashMap<String, Arc<dyn CompletionProvider>>>,
    debugger_builder: Option<DebuggerBuilder>,
}

impl Default for ProviderSetApi {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderSetApi {
    pub fn new() -> ProviderSetApi {
        ProviderSetApi {
            providers: RwLock::new(HashMap::new()),
            debugger_builder: None,
        }
    }

    /// Installs a debugger factory, invoked once per provider when it is
    /// added. Returning `None` disables debugging for that provider.
    pub fn with_debugger_builder(mut self, builder: DebuggerBuilder) -> ProviderSetApi {
        self.debugger_builder = Some(builder);
        self
    }

    /// Registers a provider with no API key set. Fails on duplicate names,
    /// missing parameters, or an unspecified SDK type. Construction is a
    /// pure factory call; no network I/O happens here.
    pub fn add_provider(&self, name: &str, config: &AddProviderConfig) -> Result<ProviderParam> {
        if name.is_empty() || config.origin.is_empty() {
            anyhow::bail!("invalid params");
        }
        let Some(sdk_type) = config.sdk_type else {
            anyhow::bail!("unsupported provider api type");
        };

        let mut providers = self.providers.write().unwrap();
        if providers.contains_key(name) {
            anyhow::bail!(
                "invalid provider: cannot add a provider with same name as an existing provider, delete first"
            );
        }

        let param = ProviderParam {
            name: name.to_string(),
            sdk_type,
            origin: config.origin.clone(),
            chat_completion_path_prefix: config.chat_completion_path_prefix.clone(),
            api_key: String::new(),
            api_key_header_key: config.api_key_header_key.clone(),
            // Cloned so later caller mutation cannot leak into the registry.
            default_headers: config.default_headers.clone(),
        };

        let debugger = self
            .debugger_builder
            .as_ref()
            .and_then(|builder| builder(&param));

        let provider = build_provider(param, debugger)?;
        let info = provider.provider_info();
        providers.insert(name.to_string(), provider);

        info!(name, "add provider");
        Ok(info)
    }

    /// Removes a provider and best-effort deinitializes it outside the lock.
    pub async fn delete_provider(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            anyhow::bail!("got empty provider input");
        }
        let removed = {
            let mut providers = self.providers.write().unwrap();
            providers.remove(name)
        };
        let Some(provider) = removed else {
            anyhow::bail!("invalid provider: provider does not exist");
        };

        let _ = provider.deinit_llm().await;
        info!(name, "delete provider");
        Ok(())
    }

    /// Sets (or clears) a provider's API key. A non-empty key initializes
    /// the vendor client; an empty key tears it down.
    pub async fn set_provider_api_key(&self, name: &str, api_key: &str) -> Result<()> {
        let provider = self.lookup(name)?;

        let api_key = api_key.trim();
        provider.set_api_key(api_key)?;
        if api_key.is_empty() {
            provider.deinit_llm().await
        } else {
            provider.init_llm().await
        }
    }

    /// Dispatches a completion request to a provider, applying heuristic
    /// prompt filtering when a max prompt length is configured. Failures are
    /// wrapped with provider context; any partial response travels inside
    /// the error.
    pub async fn fetch_completion(
        &self,
        name: &str,
        mut request: FetchCompletionRequest,
        opts: FetchCompletionOptions,
    ) -> Result<FetchCompletionResponse, CompletionError> {
        if name.is_empty() || request.inputs.is_empty() || request.model_param.name.is_empty() {
            return Err(CompletionError::new("got empty fetch completion input"));
        }

        let provider = self
            .lookup(name)
            .map_err(|e| CompletionError::new(e.to_string()))?;

        if request.model_param.max_prompt_length > 0 {
            request.inputs = filter_messages_by_token_count(
                request.inputs,
                request.model_param.max_prompt_length,
            );
        }

        provider
            .fetch_completion(request, opts)
            .await
            .map_err(|e| CompletionError {
                message: format!("fetch completion failed for provider {name}: {}", e.message),
                response: e.response,
            })
    }

    /// Returns a snapshot of a provider's configuration.
    pub fn provider_info(&self, name: &str) -> Result<ProviderParam> {
        Ok(self.lookup(name)?.provider_info())
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn CompletionProvider>> {
        let providers = self.providers.read().unwrap();
        providers
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("invalid provider"))
    }
}

fn build_provider(
    param: ProviderParam,
    debugger: Option<Arc<crate::debug::HttpDebugger>>,
) -> Result<Arc<dyn CompletionProvider>> {
    Ok(match param.sdk_type {
        ProviderSdkType::Anthropic => Arc::new(AnthropicMessagesApi::new(param, debugger)?),
        ProviderSdkType::OpenAiChatCompletions => {
            Arc::new(OpenAiChatCompletionsApi::new(param, debugger)?)
        }
        ProviderSdkType::OpenAiResponses => Arc::new(OpenAiResponsesApi::new(param, debugger)?),
    })
}
