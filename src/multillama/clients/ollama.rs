//! `OllamaClient` implements [`ClientWrapper`] for the Ollama HTTP API.
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | model listing | `GET {host}/api/tags` |
//! | chat (batch and NDJSON stream) | `POST {host}/api/chat` |
//! | pull | `POST {host}/api/pull` |
//! | delete | `DELETE {host}/api/delete` |
//!
//! # Example
//!
//! ```rust,no_run
//! use multillama::clients::ollama::OllamaClient;
//! use multillama::client_wrapper::{ClientWrapper, Message};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = OllamaClient::new();
//!     let models = client.list_models("http://127.0.0.1:11434").await?;
//!     println!("{} models available", models.len());
//!
//!     let reply = client
//!         .send_message("http://127.0.0.1:11434", "llama3", &[Message::user("Hello!")])
//!         .await?;
//!     println!("{}", reply.content);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use crate::client_wrapper::{
    ClientError, ClientWrapper, Message, MessageChunk, MessageChunkStream, ModelInfo, Role,
};
use crate::clients::common::{api_url, error_detail_from_body, get_shared_http_client, NdjsonBuffer};

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<&'a [String]>,
}

#[derive(Deserialize, Default)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ChatResponseMessage>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize, Default)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize, Default)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

#[derive(Serialize)]
struct ModelNameRequest<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

/// Client wrapper for Ollama-compatible hosts. Stateless apart from the shared HTTP pool.
#[derive(Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new()
    }
}

impl OllamaClient {
    /// Construct a client backed by the process-wide HTTP pool.
    pub fn new() -> Self {
        Self {
            http: get_shared_http_client().clone(),
        }
    }

    /// Construct a client around a caller-provided `reqwest::Client`.
    pub fn with_http_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn to_wire(messages: &[Message]) -> Vec<WireMessage<'_>> {
        messages
            .iter()
            .map(|msg| WireMessage {
                role: msg.role.as_str(),
                content: &msg.content,
                images: if msg.images.is_empty() {
                    None
                } else {
                    Some(msg.images.as_slice())
                },
            })
            .collect()
    }

    async fn post_chat(
        &self,
        base_url: &str,
        model: &str,
        messages: &[Message],
        stream: bool,
    ) -> Result<reqwest::Response, ClientError> {
        let body = ChatRequest {
            model,
            messages: Self::to_wire(messages),
            stream,
        };
        let response = self
            .http
            .post(api_url(base_url, "api/chat"))
            .json(&body)
            .send()
            .await
            .map_err(|err| network_error(base_url, err))?;
        ensure_success(base_url, response).await
    }
}

fn network_error(base_url: &str, err: reqwest::Error) -> ClientError {
    ClientError::Network {
        host: base_url.to_string(),
        detail: err.to_string(),
    }
}

async fn ensure_success(
    base_url: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        host: base_url.to_string(),
        status: status.as_u16(),
        detail: error_detail_from_body(&body),
    })
}

/// Decode one NDJSON line of a chat stream. Malformed lines decode to nothing.
fn decode_stream_line(base_url: &str, line: &str) -> Option<Result<MessageChunk, ClientError>> {
    let parsed: ChatResponse = match serde_json::from_str(line) {
        Ok(parsed) => parsed,
        Err(err) => {
            log::debug!("OllamaClient: skipping malformed stream line from {}: {}", base_url, err);
            return None;
        }
    };
    if let Some(error) = parsed.error {
        return Some(Err(ClientError::Backend {
            host: base_url.to_string(),
            detail: error,
        }));
    }
    Some(Ok(MessageChunk {
        content: parsed.message.map(|m| m.content).unwrap_or_default(),
        is_final: parsed.done,
    }))
}

#[async_trait]
impl ClientWrapper for OllamaClient {
    async fn list_models(&self, base_url: &str) -> Result<Vec<ModelInfo>, ClientError> {
        let response = self
            .http
            .get(api_url(base_url, "api/tags"))
            .send()
            .await
            .map_err(|err| network_error(base_url, err))?;
        let response = ensure_success(base_url, response).await?;
        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|err| network_error(base_url, err))?;
        Ok(tags.models)
    }

    async fn send_message(
        &self,
        base_url: &str,
        model: &str,
        messages: &[Message],
    ) -> Result<Message, ClientError> {
        let response = self.post_chat(base_url, model, messages, false).await?;
        let body = response
            .text()
            .await
            .map_err(|err| network_error(base_url, err))?;

        // Malformed bodies count as empty content; an explicit error field never does.
        let parsed: ChatResponse = serde_json::from_str(&body).unwrap_or_default();
        if let Some(error) = parsed.error {
            log::error!("OllamaClient::send_message(...): {} answered with error: {}", base_url, error);
            return Err(ClientError::Backend {
                host: base_url.to_string(),
                detail: error,
            });
        }
        let content = parsed.message.map(|m| m.content).unwrap_or_default();
        Ok(Message::new(Role::Assistant, content))
    }

    async fn send_message_stream(
        &self,
        base_url: &str,
        model: &str,
        messages: &[Message],
    ) -> Result<MessageChunkStream, ClientError> {
        let response = self.post_chat(base_url, model, messages, true).await?;
        let host = base_url.to_string();
        let bytes = response.bytes_stream();

        // State: (byte stream, line buffer, decoded-but-unsent chunks, exhausted flag).
        let chunks = stream::unfold(
            (bytes, NdjsonBuffer::new(), Vec::<Result<MessageChunk, ClientError>>::new(), false),
            move |(mut bytes, mut buffer, mut ready, mut exhausted)| {
                let host = host.clone();
                async move {
                    loop {
                        if !ready.is_empty() {
                            let next = ready.remove(0);
                            return Some((next, (bytes, buffer, ready, exhausted)));
                        }
                        if exhausted {
                            return None;
                        }
                        match bytes.next().await {
                            Some(Ok(slice)) => {
                                ready.extend(
                                    buffer
                                        .push(&slice)
                                        .iter()
                                        .filter_map(|line| decode_stream_line(&host, line)),
                                );
                            }
                            Some(Err(err)) => {
                                exhausted = true;
                                ready.push(Err(network_error(&host, err)));
                            }
                            None => {
                                exhausted = true;
                                if let Some(line) = buffer.finish() {
                                    ready.extend(decode_stream_line(&host, &line));
                                }
                            }
                        }
                    }
                }
            },
        );

        Ok(Box::pin(chunks))
    }

    async fn pull_model(&self, base_url: &str, model: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .post(api_url(base_url, "api/pull"))
            .json(&ModelNameRequest {
                name: model,
                stream: Some(false),
            })
            .send()
            .await
            .map_err(|err| network_error(base_url, err))?;
        ensure_success(base_url, response).await?;
        Ok(())
    }

    async fn delete_model(&self, base_url: &str, model: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(api_url(base_url, "api/delete"))
            .json(&ModelNameRequest {
                name: model,
                stream: None,
            })
            .send()
            .await
            .map_err(|err| network_error(base_url, err))?;
        ensure_success(base_url, response).await?;
        Ok(())
    }
}
