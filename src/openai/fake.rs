use anyhow::Result;
use async_openai::types::{
    ChatChoice, ChatCompletionRequestMessage,
    ChatCompletionRequestUserMessageContent, ChatCompletionResponseMessage,
    CompletionUsage, CreateChatCompletionResponse, FinishReason, Role,
};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

use crate::openai::{GenerationParams, ModelRequest, OpenAIClientTrait};

enum FakeReply {
    Content(Option<String>),
    Error(String),
}

/// A fake implementation of the OpenAI client for testing
///
/// Replies are served in the order they were queued; once the queue is
/// drained every call returns the fallback reply. Every request is
/// recorded, including the rendered prompt and sampling parameters, so
/// tests can assert on exactly what the pipeline asked for.
///
/// # Example
///
/// ```
/// use eva_markov::openai::fake::FakeOpenAIClient;
/// use eva_markov::openai::{GenerationParams, TextGenerator};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let client = Arc::new(FakeOpenAIClient::new().with_response("First"));
///     let generator = TextGenerator::new(
///         client.clone(),
///         "gemini-test",
///         Duration::from_secs(1),
///     );
///
///     let text = generator
///         .generate("Hello", &GenerationParams::default())
///         .await?;
///
///     assert_eq!(text, "First");
///     assert_eq!(client.request_count(), 1);
///     Ok(())
/// }
/// ```
pub struct FakeOpenAIClient {
    replies: Mutex<Vec<FakeReply>>,
    fallback: Option<String>,
    delay: Option<Duration>,
    // Track requests for verification in tests
    pub requests: Mutex<Vec<ModelRequest>>,
}

impl Default for FakeOpenAIClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeOpenAIClient {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(vec![]),
            fallback: Some("Fake default response".to_string()),
            delay: None,
            requests: Mutex::new(vec![]),
        }
    }

    /// Add a response to be returned by the fake client
    pub fn with_response(self, response: &str) -> Self {
        self.replies
            .lock()
            .unwrap()
            .push(FakeReply::Content(Some(response.to_string())));
        self
    }

    /// Add multiple responses to be returned by the fake client in sequence
    pub fn with_responses(self, responses: Vec<&str>) -> Self {
        for response in responses {
            self.replies
                .lock()
                .unwrap()
                .push(FakeReply::Content(Some(response.to_string())));
        }
        self
    }

    /// Configure the client to return a response with None content
    pub fn with_none_content_response(self) -> Self {
        self.replies.lock().unwrap().push(FakeReply::Content(None));
        self
    }

    /// Queue a transport failure
    pub fn with_error_response(self, message: &str) -> Self {
        self.replies
            .lock()
            .unwrap()
            .push(FakeReply::Error(message.to_string()));
        self
    }

    /// Reply returned once the queue is empty. Lets concurrent tests hand
    /// the same answer to every caller regardless of ordering.
    pub fn with_fallback_response(mut self, response: &str) -> Self {
        self.fallback = Some(response.to_string());
        self
    }

    /// Sleep before replying, for timeout tests
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|request| request.prompt.clone())
            .collect()
    }
}

fn user_text(messages: &[ChatCompletionRequestMessage]) -> String {
    messages
        .iter()
        .filter_map(|message| match message {
            ChatCompletionRequestMessage::User(user) => match &user.content {
                ChatCompletionRequestUserMessageContent::Text(text) => {
                    Some(text.clone())
                }
                _ => None,
            },
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl OpenAIClientTrait for FakeOpenAIClient {
    #[allow(deprecated)]
    async fn chat_completion(
        &self,
        model: String,
        messages: Vec<ChatCompletionRequestMessage>,
        params: &GenerationParams,
    ) -> Result<CreateChatCompletionResponse, anyhow::Error> {
        // Store the request for later verification
        self.requests.lock().unwrap().push(ModelRequest {
            model_name: model.clone(),
            prompt: user_text(&messages),
            params: params.clone(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let reply = {
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                FakeReply::Content(self.fallback.clone())
            } else {
                replies.remove(0)
            }
        };

        let content_option = match reply {
            FakeReply::Content(content) => content,
            FakeReply::Error(message) => {
                return Err(anyhow::anyhow!(message));
            }
        };

        // Create the response message
        let message = ChatCompletionResponseMessage {
            role: Role::Assistant,
            content: content_option,
            #[allow(deprecated)]
            function_call: None,
            tool_calls: None,
            #[allow(deprecated)]
            refusal: None,
            audio: None,
        };

        let chat_choice = ChatChoice {
            index: 0,
            message,
            finish_reason: Some(FinishReason::Stop),
            logprobs: None,
        };

        let usage = CompletionUsage {
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            prompt_tokens_details: None,
            completion_tokens_details: None,
        };

        Ok(CreateChatCompletionResponse {
            id: "fake_id".to_string(),
            object: "chat.completion".to_string(),
            created: 0,
            model,
            system_fingerprint: Some("fake-fingerprint".to_string()),
            service_tier: None,
            choices: vec![chat_choice],
            usage: Some(usage),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_openai::types::ChatCompletionRequestUserMessageArgs;

    fn user(content: &str) -> ChatCompletionRequestMessage {
        ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(content)
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_fake_openai_client_responses() -> Result<(), anyhow::Error> {
        let client = FakeOpenAIClient::new()
            .with_response("First response")
            .with_response("Second response");
        let params = GenerationParams::default();

        let response1 = client
            .chat_completion("gpt-4".to_string(), vec![user("hi")], &params)
            .await?;
        assert_eq!(
            response1.choices[0].message.content,
            Some("First response".to_string())
        );

        let response2 = client
            .chat_completion("gpt-4".to_string(), vec![], &params)
            .await?;
        assert_eq!(
            response2.choices[0].message.content,
            Some("Second response".to_string())
        );

        // Third call should return the fallback response
        let response3 = client
            .chat_completion("gpt-4".to_string(), vec![], &params)
            .await?;
        assert_eq!(
            response3.choices[0].message.content,
            Some("Fake default response".to_string())
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_request_tracking() {
        let client = FakeOpenAIClient::new().with_response("Test response");
        let params = GenerationParams::default()
            .with_response_schema(serde_json::json!({"type": "object"}));

        client
            .chat_completion(
                "gemini".to_string(),
                vec![user("first line"), user("second line")],
                &params,
            )
            .await
            .unwrap();

        let requests = client.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model_name, "gemini");
        assert_eq!(requests[0].prompt, "first line\nsecond line");
        assert!(requests[0].params.response_schema.is_some());
    }

    #[tokio::test]
    async fn test_error_response() {
        let client = FakeOpenAIClient::new()
            .with_error_response("boom")
            .with_response("recovered");
        let params = GenerationParams::default();

        let first = client
            .chat_completion("m".to_string(), vec![], &params)
            .await;
        assert_eq!(first.unwrap_err().to_string(), "boom");

        let second = client
            .chat_completion("m".to_string(), vec![], &params)
            .await
            .unwrap();
        assert_eq!(
            second.choices[0].message.content.as_deref(),
            Some("recovered")
        );
        assert_eq!(client.request_count(), 2);
    }
}
