use crate::protocol::{ConversationTurn, Role};
use anyhow::Result;
use async_openai::{Client, config::OpenAIConfig, error::OpenAIError};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::pin::Pin;
use tracing::warn;

/// Gemini's OpenAI-compatible endpoint.
pub const GEMINI_OPENAI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

/// Request fields the relay owns; metadata cannot override them.
const RESERVED_FIELDS: [&str; 3] = ["model", "messages", "stream"];

/// A single-pass stream of generated text fragments.
///
/// Fragments arrive in generation order and may be empty. Dropping the stream
/// abandons the underlying request.
pub type LLMStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// A generic client for a streaming text-generation backend.
///
/// Implementations are stateless with respect to the conversation: the full
/// history is passed on every call.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Starts a streaming generation for `history`.
    ///
    /// `metadata` holds caller-supplied backend options and is forwarded as-is.
    async fn stream_generate(
        &self,
        history: &[ConversationTurn],
        metadata: &Map<String, Value>,
    ) -> Result<LLMStream>;
}

/// An implementation of `LLMClient` for any OpenAI-compatible API.
pub struct OpenAICompatibleClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAICompatibleClient {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `model` - The model identifier to use for chat completions (e.g., "gemini-2.0-flash").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }

    /// Creates a client pointed at Gemini's OpenAI-compatible endpoint.
    pub fn gemini(api_key: &str, api_base: &str, model: String) -> Self {
        let config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(api_base);
        Self::new(config, model)
    }
}

#[async_trait]
impl LLMClient for OpenAICompatibleClient {
    async fn stream_generate(
        &self,
        history: &[ConversationTurn],
        metadata: &Map<String, Value>,
    ) -> Result<LLMStream> {
        let request = build_chat_request(&self.model, history, metadata);
        let stream: Pin<Box<dyn Stream<Item = Result<ChatChunk, OpenAIError>> + Send>> =
            self.client.chat().create_stream_byot(request).await?;

        Ok(Box::pin(stream.map(|result| {
            result
                .map(ChatChunk::into_text)
                .map_err(anyhow::Error::from)
        })))
    }
}

/// Builds the streaming chat-completions body for `history`.
///
/// Metadata entries are merged into the top level of the request, except for
/// the fields the relay sets itself.
pub fn build_chat_request(
    model: &str,
    history: &[ConversationTurn],
    metadata: &Map<String, Value>,
) -> Value {
    let messages: Vec<Value> = history
        .iter()
        .map(|turn| {
            let role = match turn.role {
                Role::User => "user",
                Role::Model => "assistant",
            };
            json!({ "role": role, "content": turn.text() })
        })
        .collect();

    let mut body = Map::new();
    for (key, value) in metadata {
        if RESERVED_FIELDS.contains(&key.as_str()) {
            warn!(field = %key, "Ignoring metadata field reserved by the relay.");
            continue;
        }
        body.insert(key.clone(), value.clone());
    }
    body.insert("model".into(), Value::String(model.to_string()));
    body.insert("messages".into(), Value::Array(messages));
    body.insert("stream".into(), Value::Bool(true));
    Value::Object(body)
}

/// The subset of a streamed chat-completion chunk the relay reads.
#[derive(Debug, Default, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

impl ChatChunk {
    fn into_text(self) -> String {
        self.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .unwrap_or_default()
    }
}
