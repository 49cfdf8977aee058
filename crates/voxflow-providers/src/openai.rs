//! OpenAI Chat Completions text producer.
//!
//! Streams `/v1/chat/completions` and forwards each content delta to a
//! speech session as it arrives. Works with any OpenAI-compatible endpoint.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, info, trace};

use voxflow_core::config::CompletionConfig;
use voxflow_core::error::{Result, VoxflowError};
use voxflow_core::types::StreamItem;

use crate::sse::parse_sse_stream;

/// One chat message, as sent to and returned from the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<&'a ChatMessage>,
    temperature: f64,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

pub struct CompletionClient {
    base_url: String,
    model: String,
    temperature: f64,
    api_key: Option<String>,
    system: Option<String>,
    client: reqwest::Client,
}

impl CompletionClient {
    pub fn new(config: &CompletionConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            api_key: config.resolve_api_key(),
            system: config.system.clone(),
            client: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Stream a completion into a speech session's producer queue.
    ///
    /// Every non-empty content delta is forwarded and handed to `on_delta`.
    /// The end marker is sent once the response finishes, and also when it
    /// fails, so the session never waits on a dead producer.
    pub async fn stream_to_session<F>(
        &self,
        messages: &[ChatMessage],
        producer_tx: mpsc::UnboundedSender<StreamItem<String>>,
        on_delta: F,
    ) -> Result<ChatMessage>
    where
        F: FnMut(&str),
    {
        let result = self.stream_deltas(messages, &producer_tx, on_delta).await;
        let _ = producer_tx.send(StreamItem::End);
        result
    }

    async fn stream_deltas<F>(
        &self,
        messages: &[ChatMessage],
        producer_tx: &mpsc::UnboundedSender<StreamItem<String>>,
        mut on_delta: F,
    ) -> Result<ChatMessage>
    where
        F: FnMut(&str),
    {
        let system = self.system.as_ref().map(|s| ChatMessage::system(s.clone()));
        let body = ChatRequest {
            model: &self.model,
            messages: system.iter().chain(messages.iter()).collect(),
            temperature: self.temperature,
            stream: true,
        };

        if let Some(last) = messages.last() {
            info!(model = %self.model, role = %last.role, content = %last.content, "Sending chat completion");
        }

        let mut req_builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json");
        if let Some(api_key) = &self.api_key {
            req_builder = req_builder.header("authorization", format!("Bearer {api_key}"));
        }

        let response = req_builder
            .json(&body)
            .send()
            .await
            .map_err(|e| VoxflowError::Completion(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VoxflowError::Completion(format!(
                "OpenAI API error {status}: {body}"
            )));
        }

        let mut events = std::pin::pin!(parse_sse_stream(response));
        let mut role = None;
        let mut content = String::new();

        while let Some(event) = events.next().await {
            let event = event?;
            let data = event.data.trim();

            // OpenAI terminates with "data: [DONE]"
            if data == "[DONE]" {
                break;
            }

            let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
                Ok(c) => c,
                Err(e) => {
                    trace!(%e, data, "Failed to parse OpenAI chunk");
                    continue;
                }
            };
            let Some(choice) = chunk.choices.into_iter().next() else {
                continue;
            };

            if let Some(r) = choice.delta.role {
                debug!(role = %r, "Completion role");
                role.get_or_insert(r);
            }

            match choice.delta.content {
                Some(delta) if !delta.is_empty() => {
                    trace!(delta = ?delta, "Received content");
                    on_delta(&delta);
                    content.push_str(&delta);
                    if producer_tx.send(StreamItem::Item(delta)).is_err() {
                        return Err(VoxflowError::Completion("speech session stopped".into()));
                    }
                }
                _ => {}
            }

            if let Some(reason) = choice.finish_reason {
                debug!(%reason, "Completion finished");
            }
        }

        info!(chars = content.chars().count(), "Received end of completion");
        Ok(ChatMessage {
            role: role.unwrap_or_else(|| "assistant".into()),
            content,
        })
    }
}

/// Conversation history bounded to the most recent messages.
#[derive(Debug, Clone)]
pub struct ChatHistory {
    messages: Vec<ChatMessage>,
    max_len: usize,
}

impl ChatHistory {
    pub fn new(max_len: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_len: max_len.max(1),
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
        if self.messages.len() > self.max_len {
            let excess = self.messages.len() - self.max_len;
            self.messages.drain(..excess);
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
