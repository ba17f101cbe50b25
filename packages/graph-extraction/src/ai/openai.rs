//! OpenAI-compatible implementation of [`InferenceClient`].
//!
//! Sends one chat completion per window with the extraction schema as a
//! `json_schema` response format. Items of a batch are sent concurrently and
//! answered in request order.
//!
//! # Example
//!
//! ```rust,ignore
//! use graph_extraction::ai::{OpenAiInference, RateLimitedInference};
//!
//! let client = OpenAiInference::from_env()?
//!     .with_model("gpt-4o-mini")
//!     .with_config(&config.inference);
//! let client = RateLimitedInference::new(client, 5);
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::{ExtractionError, InferenceError, Result};
use crate::traits::inference::{InferenceClient, InferenceItem, InferenceReply, InferenceRequest};
use crate::types::config::InferenceConfig;
use crate::types::fact::{NodeKind, RelKind};

const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Inference over an OpenAI-compatible chat completions endpoint.
#[derive(Clone)]
pub struct OpenAiInference {
    client: Client,
    api_key: Arc<SecretString>,
    model: String,
    base_url: String,
    call_timeout: Duration,
}

impl OpenAiInference {
    /// Create a client with the given API key and the default model.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: Arc::new(SecretString::from(api_key.into())),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            call_timeout: InferenceConfig::default().call_timeout,
        }
    }

    /// Create from `OPENAI_API_KEY`, plus `OPENAI_MODEL` and `OPENAI_BASE_URL`
    /// when set.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ExtractionError::Config("OPENAI_API_KEY not set".into()))?;
        let mut client = Self::new(api_key);
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            client = client.with_model(model);
        }
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            client = client.with_base_url(url);
        }
        Ok(client)
    }

    /// Set the chat model (default: gpt-4o).
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set a custom base URL (for proxies or self-hosted gateways).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Bound every HTTP call by the pipeline's per-call timeout.
    pub fn with_config(mut self, config: &InferenceConfig) -> Self {
        self.call_timeout = config.call_timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn chat_request(&self, item: &InferenceItem, request: &InferenceRequest) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_prompt(item),
                },
            ],
            temperature: request.temperature,
            response_format: ResponseFormat {
                format_type: "json_schema".to_string(),
                json_schema: JsonSchemaFormat {
                    name: "graph_extraction".to_string(),
                    strict: false,
                    schema: request.schema.clone(),
                },
            },
        }
    }

    async fn complete(&self, item: &InferenceItem, request: &InferenceRequest) -> InferenceReply {
        let body = self.chat_request(item, request);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .timeout(self.call_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Timeout(self.call_timeout)
                } else {
                    InferenceError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(InferenceError::RateLimited);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(InferenceError::Provider {
                status: status.as_u16(),
                message,
            });
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::Transport(format!("unreadable response body: {}", e)))?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| InferenceError::Provider {
                status: status.as_u16(),
                message: "response contained no message content".to_string(),
            })
    }
}

impl fmt::Debug for OpenAiInference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiInference")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl InferenceClient for OpenAiInference {
    async fn infer_batch(&self, request: &InferenceRequest) -> std::result::Result<Vec<InferenceReply>, InferenceError> {
        let replies = join_all(request.items.iter().map(|item| self.complete(item, request))).await;

        tracing::debug!(
            model = %self.model,
            items = request.items.len(),
            failed = replies.iter().filter(|r| r.is_err()).count(),
            "Inference batch complete"
        );

        Ok(replies)
    }
}

fn system_prompt() -> String {
    let entity_types: Vec<&str> = NodeKind::ALL.iter().map(NodeKind::label).collect();
    let relation_types: Vec<&str> = RelKind::ALL.iter().map(RelKind::rel_type).collect();

    format!(
        "Extract infrastructure entities and relations from the passage.\n\
         Entity types: {}.\n\
         Relation types: {}.\n\
         Only report what the passage states. Relation src and dst must name declared entities.\n\
         Put a `confidence` between 0 and 1 in properties when unsure.\n\
         Copy doc_id, section and span from the passage header into provenance.",
        entity_types.join(", "),
        relation_types.join(", ")
    )
}

fn user_prompt(item: &InferenceItem) -> String {
    format!(
        "doc_id: {}\nsection: {}\nspan: [{}, {}]\n\n{}",
        item.doc_id,
        item.section.as_deref().unwrap_or("none"),
        item.span.start,
        item.span.end,
        item.text
    )
}

// Request/Response types

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
    json_schema: JsonSchemaFormat,
}

#[derive(Serialize)]
struct JsonSchemaFormat {
    name: String,
    strict: bool,
    schema: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::schema::output_schema;
    use crate::types::document::Window;
    use uuid::Uuid;

    #[test]
    fn test_builder() {
        let config = InferenceConfig {
            call_timeout: Duration::from_secs(5),
            ..InferenceConfig::default()
        };
        let client = OpenAiInference::new("sk-test")
            .with_model("gpt-4o-mini")
            .with_base_url("https://gateway.internal/v1/")
            .with_config(&config);

        assert_eq!(client.model(), "gpt-4o-mini");
        assert_eq!(client.base_url, "https://gateway.internal/v1");
        assert_eq!(client.call_timeout, Duration::from_secs(5));
        assert_eq!(client.api_key.expose_secret(), "sk-test");
    }

    #[test]
    fn test_debug_never_shows_the_key() {
        let client = OpenAiInference::new("sk-live-abc123");
        let debug = format!("{:?}", client);
        assert!(!debug.contains("sk-live"));
        assert!(debug.contains(DEFAULT_MODEL));
        assert!(debug.contains(DEFAULT_BASE_URL));
    }

    #[test]
    fn test_chat_request_carries_schema_and_provenance() {
        let client = OpenAiInference::new("sk-test");
        let window = Window::new(Uuid::new_v4(), "api depends on cache", 40).with_section("Runtime");
        let request = InferenceRequest {
            items: vec![InferenceItem::from(&window)],
            schema: output_schema(),
            temperature: 0.0,
        };

        let body = serde_json::to_value(client.chat_request(&request.items[0], &request)).unwrap();
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["schema"], output_schema());

        let user = body["messages"][1]["content"].as_str().unwrap();
        assert!(user.contains(&window.doc_id.to_string()));
        assert!(user.contains("section: Runtime"));
        assert!(user.contains(&format!("span: [{}, {}]", window.span.start, window.span.end)));
        assert!(user.ends_with("api depends on cache"));
    }

    #[test]
    fn test_system_prompt_lists_vocabulary() {
        let prompt = system_prompt();
        assert!(prompt.contains("DEPENDS_ON"));
        assert!(prompt.contains(NodeKind::Service.label()));
    }
}
