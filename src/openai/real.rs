use crate::openai::{GenerationParams, OpenAIClientTrait};
use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestMessage, CreateChatCompletionRequestArgs,
    CreateChatCompletionResponse, ResponseFormat, ResponseFormatJsonSchema,
};
use async_openai::Client;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

pub const DEFAULT_API_BASE: &str =
    "https://generativelanguage.googleapis.com/v1beta/openai";

// A real implementation of the OpenAI-compatible client
pub struct RealOpenAIClient {
    client: Client<OpenAIConfig>,
}

impl RealOpenAIClient {
    pub fn new(client: Client<OpenAIConfig>) -> Self {
        Self { client }
    }
}

pub fn create_openai_client(
    api_key: &str,
    api_base: Option<&str>,
) -> Arc<dyn OpenAIClientTrait> {
    let api_base = api_base.unwrap_or(DEFAULT_API_BASE);
    info!("Using model API base {}", api_base);
    let config = OpenAIConfig::new()
        .with_api_base(api_base)
        .with_api_key(api_key);
    Arc::new(RealOpenAIClient::new(Client::with_config(config)))
}

#[async_trait]
impl OpenAIClientTrait for RealOpenAIClient {
    async fn chat_completion(
        &self,
        model: String,
        messages: Vec<ChatCompletionRequestMessage>,
        params: &GenerationParams,
    ) -> Result<CreateChatCompletionResponse, anyhow::Error> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(model)
            .messages(messages)
            .temperature(params.temperature)
            .top_p(params.top_p)
            .max_completion_tokens(params.max_tokens);

        if let Some(schema) = &params.response_schema {
            args.response_format(ResponseFormat::JsonSchema {
                json_schema: ResponseFormatJsonSchema {
                    description: None,
                    name: "structured_response".to_string(),
                    schema: Some(schema.clone()),
                    strict: Some(true),
                },
            });
        }

        // The chat-completions wire format has no top_k field.
        debug!(top_k = params.top_k, "top_k not sent over chat completions");

        let request = args.build()?;
        let response = self.client.chat().create(request).await?;

        Ok(response)
    }
}
