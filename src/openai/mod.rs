pub mod fake;
pub mod real;

use crate::error::ModelError;
use anyhow::Result;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionResponse,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Sampling controls passed with every generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_tokens: u32,
    /// JSON schema the response must satisfy, sent as a structured
    /// response format when present.
    pub response_schema: Option<Value>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
            max_tokens: 2048,
            response_schema: None,
        }
    }
}

impl GenerationParams {
    pub fn with_response_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }
}

/// What the client was asked, recorded by the fake for assertions.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model_name: String,
    pub prompt: String,
    pub params: GenerationParams,
}

/// A trait that abstracts the chat-completions transport so the real
/// client can be swapped for a scripted fake in tests.
#[async_trait]
pub trait OpenAIClientTrait: Send + Sync {
    /// Sends `messages` to `model` with the given sampling parameters and
    /// returns the raw completion.
    async fn chat_completion(
        &self,
        model: String,
        messages: Vec<ChatCompletionRequestMessage>,
        params: &GenerationParams,
    ) -> Result<CreateChatCompletionResponse, anyhow::Error>;
}

/// Prompt-in, text-out view of the model used by the pipeline stages.
#[derive(Clone)]
pub struct TextGenerator {
    client: Arc<dyn OpenAIClientTrait>,
    model: String,
    timeout: Duration,
}

impl TextGenerator {
    pub fn new(
        client: Arc<dyn OpenAIClientTrait>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            timeout,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, prompt, params), fields(model = %self.model, prompt_len = prompt.len()))]
    pub async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, ModelError> {
        let user_message = ChatCompletionRequestUserMessageArgs::default()
            .content(prompt)
            .build()
            .map_err(|e| {
                ModelError::Transport(format!(
                    "failed to build user message: {}",
                    e
                ))
            })?;

        let call = self.client.chat_completion(
            self.model.clone(),
            vec![ChatCompletionRequestMessage::User(user_message)],
            params,
        );

        let response = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| ModelError::Timeout(self.timeout))?
            .map_err(|e| ModelError::Transport(format!("{:#}", e)))?;

        let text = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_deref())
            .map(str::trim)
            .unwrap_or_default();

        if text.is_empty() {
            return Err(ModelError::EmptyResponse);
        }

        debug!("Model returned {} bytes", text.len());
        Ok(text.to_string())
    }
}
