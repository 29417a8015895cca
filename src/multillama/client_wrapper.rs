//! The backend seam: message types shared by every layer plus the [`ClientWrapper`] trait
//! that talks to an inference host.
//!
//! A `ClientWrapper` does not keep track of conversations. Histories live in the
//! [`SessionStore`](crate::session_store::SessionStore); the orchestrator assembles the
//! outgoing message list for each call and hands it to the wrapper together with the
//! base URL of the host that serves the participant's model. One wrapper instance can
//! therefore serve every configured host.

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::pin::Pin;

/// Represents the possible roles for a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions injected by the orchestrator (role preamble).
    System,
    /// A message typed by the human user, or a constructed turn prompt.
    User,
    /// A message produced by a model, or a synthesized error reply.
    Assistant,
}

impl Role {
    /// Wire name used by the chat API.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single chat message. Immutable once appended to a history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// Plain-text content. Text attachments are already flattened into it.
    pub content: String,
    /// Base64 encoded images that accompany the message on the wire.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl Message {
    /// Create a message without images.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: Vec::new(),
        }
    }

    /// Shorthand for a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Shorthand for an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Shorthand for a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Attach base64 images to the message (builder pattern).
    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }
}

/// Optional metadata the model-listing endpoint reports for a model.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// One entry of a host's model catalog.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<ModelDetails>,
}

/// Represents a chunk of a streaming chat response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageChunk {
    /// Content carried by this chunk, interpreted according to the wrapper's
    /// [`ChunkMode`].
    pub content: String,
    /// Whether the backend flagged this chunk as the last one.
    pub is_final: bool,
}

/// How a wrapper's streamed chunks relate to each other.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChunkMode {
    /// Each chunk carries only the new text.
    #[default]
    Incremental,
    /// Each chunk carries the whole reply so far.
    Cumulative,
}

impl ChunkMode {
    /// Merge a streamed chunk into the text received so far.
    pub fn accumulate(self, accumulated: &mut String, chunk: &str) {
        if self == ChunkMode::Cumulative {
            accumulated.clear();
        }
        accumulated.push_str(chunk);
    }
}

/// Failures raised while talking to an inference host.
///
/// Every variant carries the host base URL so the synthesized error reply shown to the
/// user names the host that failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientError {
    /// The host could not be reached or the connection broke mid-request.
    Network { host: String, detail: String },
    /// The host answered with a non-2xx status.
    Status {
        host: String,
        status: u16,
        detail: String,
    },
    /// The host answered 2xx but the body carried an explicit `error` field.
    Backend { host: String, detail: String },
    /// The wrapper does not implement the requested operation.
    Unsupported(String),
}

impl ClientError {
    /// Base URL of the host that produced the failure, when known.
    pub fn host(&self) -> Option<&str> {
        match self {
            ClientError::Network { host, .. }
            | ClientError::Status { host, .. }
            | ClientError::Backend { host, .. } => Some(host),
            ClientError::Unsupported(_) => None,
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Network { host, detail } => write!(f, "{} (host: {})", detail, host),
            ClientError::Status {
                host,
                status,
                detail,
            } => write!(f, "HTTP {}: {} (host: {})", status, detail, host),
            ClientError::Backend { host, detail } => write!(f, "{} (host: {})", detail, host),
            ClientError::Unsupported(what) => write!(f, "Unsupported operation: {}", what),
        }
    }
}

impl Error for ClientError {}

/// A boxed stream of chat chunks.
pub type MessageChunkStream =
    Pin<Box<dyn Stream<Item = Result<MessageChunk, ClientError>> + Send + 'static>>;

/// Trait defining the interface to an inference backend.
#[async_trait]
pub trait ClientWrapper: Send + Sync {
    /// List the models a host serves (`GET {host}/api/tags`).
    async fn list_models(&self, base_url: &str) -> Result<Vec<ModelInfo>, ClientError>;

    /// Send a non-streaming chat request and return the assistant reply.
    async fn send_message(
        &self,
        base_url: &str,
        model: &str,
        messages: &[Message],
    ) -> Result<Message, ClientError>;

    /// Send a streaming chat request.
    ///
    /// The default implementation reports the operation as unsupported so wrappers that
    /// only speak the batch API still compile; the orchestrator falls back to
    /// [`send_message`](ClientWrapper::send_message) in that case.
    async fn send_message_stream(
        &self,
        _base_url: &str,
        _model: &str,
        _messages: &[Message],
    ) -> Result<MessageChunkStream, ClientError> {
        Err(ClientError::Unsupported("streaming".to_string()))
    }

    /// How chunks from [`send_message_stream`](ClientWrapper::send_message_stream) combine.
    fn chunk_mode(&self) -> ChunkMode {
        ChunkMode::Incremental
    }

    /// Ask the host to download a model.
    async fn pull_model(&self, _base_url: &str, _model: &str) -> Result<(), ClientError> {
        Err(ClientError::Unsupported("pull".to_string()))
    }

    /// Ask the host to delete a model.
    async fn delete_model(&self, _base_url: &str, _model: &str) -> Result<(), ClientError> {
        Err(ClientError::Unsupported("delete".to_string()))
    }
}
