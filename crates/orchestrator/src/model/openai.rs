use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{
    DeltaStream, DescribeRequest, FileDelta, FileRequest, ModelClient, ModelError, ReplyRequest,
    TextStream,
};
use crate::config::BackendConfig;

const DEFAULT_MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 1000;
const MAX_BACKOFF_MS: u64 = 30000;
const DONE_SENTINEL: &str = "[DONE]";

const REPLY_PROMPT: &str = "You are a senior engineer discussing a change to the user's project. \
Explain what you will change and why. Do not write the final files yet.";
const DESCRIBE_PROMPT: &str = "Summarize the plan you just described as JSON: \
{\"madePlan\": bool, \"files\": [relative file paths to create or modify]}. \
Respond with the JSON object only.";
const FILE_PROMPT: &str = "You write exactly one file of a planned change. \
Output the complete new content of the file and nothing else.";

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

impl ChatMessage {
    fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }

    fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant",
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
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
    content: Option<String>,
    #[serde(default)]
    role: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

type ChunkStream = BoxStream<'static, Result<ChatCompletionChunk, ModelError>>;

/// Client for OpenAI-compatible chat completion endpoints.
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    max_retries: u32,
}

impl OpenAiClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        let client = Self::new(&config.base_url, &config.model);
        match config.api_key() {
            Some(key) => client.with_api_key(key),
            None => {
                warn!(
                    env = %config.api_key_env,
                    "No API key in environment, sending unauthenticated requests"
                );
                client
            }
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Retries rate limits and server errors while opening a request. Errors
    /// after the response started streaming are never retried here.
    async fn with_retry<T, F, Fut>(&self, operation: F, operation_name: &str) -> Result<T, ModelError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ModelError>>,
    {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e @ ModelError::RateLimited)
                | Err(e @ ModelError::Api { status: 500..=599, .. }) => {
                    if retries >= self.max_retries {
                        error!("{} failed after {} retries: {}", operation_name, retries, e);
                        return Err(e);
                    }

                    warn!(
                        "{} failed ({}), retrying in {}ms (attempt {}/{})",
                        operation_name,
                        e,
                        backoff_ms,
                        retries + 1,
                        self.max_retries
                    );

                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    retries += 1;
                    backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                }
                Err(e) => {
                    if retries > 0 {
                        info!("{} failed after {} retries: {}", operation_name, retries, e);
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn send(&self, body: &ChatCompletionRequest<'_>) -> Result<Response, ModelError> {
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let error_text = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 {
            warn!("Rate limited by model API");
            return Err(ModelError::RateLimited);
        }

        let message = serde_json::from_str::<ApiErrorBody>(&error_text)
            .map(|body| body.error.message)
            .unwrap_or(error_text);
        error!(status = status.as_u16(), "Model API error: {}", message);
        Err(ModelError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn open_stream(
        &self,
        messages: Vec<ChatMessage>,
        operation_name: &str,
    ) -> Result<ChunkStream, ModelError> {
        debug!(
            "Opening {} stream with {} messages, model {}",
            operation_name,
            messages.len(),
            self.model
        );

        let response = self
            .with_retry(
                || async {
                    self.send(&ChatCompletionRequest {
                        model: &self.model,
                        messages: messages.clone(),
                        stream: true,
                        response_format: None,
                    })
                    .await
                },
                operation_name,
            )
            .await?;

        let chunks = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other))
            .eventsource()
            .take_while(|event| {
                future::ready(!matches!(event, Ok(e) if e.data.trim() == DONE_SENTINEL))
            })
            .map(|event| match event {
                Ok(event) => serde_json::from_str::<ChatCompletionChunk>(&event.data)
                    .map_err(|e| ModelError::Decode(format!("invalid stream chunk: {}", e))),
                Err(e) => Err(ModelError::Stream(e.to_string())),
            });

        Ok(chunks.boxed())
    }
}

fn file_deltas(chunk: ChatCompletionChunk) -> Vec<FileDelta> {
    let Some(choice) = chunk.choices.into_iter().next() else {
        return vec![FileDelta::Other("chunk without choices".to_string())];
    };

    let mut deltas = Vec::with_capacity(2);
    match (choice.delta.content, choice.delta.role) {
        (Some(content), _) if !content.is_empty() => deltas.push(FileDelta::Content(content)),
        (_, Some(role)) => deltas.push(FileDelta::Other(format!("role {}", role))),
        _ => {}
    }
    match choice.finish_reason.as_deref() {
        Some("stop") => deltas.push(FileDelta::Complete),
        Some(reason) => deltas.push(FileDelta::Stopped(reason.to_string())),
        None => {}
    }
    deltas
}

fn fenced(label: &str, path: &str, body: &str) -> String {
    format!("{} {}:\n```\n{}\n```", label, path, body)
}

/// Edits apply to the in-plan state when a revision exists, so they compound.
fn file_instruction(request: &FileRequest) -> String {
    if request.base().is_none() {
        return format!("Write the complete content of the new file {}.", request.path);
    }
    let target = if request.current.is_some() {
        "the current state in the plan of"
    } else {
        "the original"
    };
    format!(
        "Apply the edits to {} {} and write its complete new content.",
        target, request.path
    )
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn stream_reply(&self, request: ReplyRequest) -> Result<TextStream, ModelError> {
        let mut messages = vec![ChatMessage::system(REPLY_PROMPT)];
        for file in &request.context {
            if !request.current_plan.contains_key(&file.path) {
                messages.push(ChatMessage::user(fenced("File", &file.path, &file.body)));
            }
        }
        for (path, body) in &request.current_plan {
            messages.push(ChatMessage::user(fenced("Current draft of", path, body)));
        }
        messages.push(ChatMessage::user(request.prompt));

        let chunks = self.open_stream(messages, "stream_reply").await?;
        let text = chunks.filter_map(|chunk| {
            future::ready(match chunk {
                Ok(chunk) => chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta.content)
                    .filter(|c| !c.is_empty())
                    .map(Ok),
                Err(e) => Some(Err(e)),
            })
        });
        Ok(text.boxed())
    }

    async fn describe_plan(&self, request: DescribeRequest) -> Result<String, ModelError> {
        let messages = vec![
            ChatMessage::user(request.prompt),
            ChatMessage::assistant(request.reply),
            ChatMessage::user(DESCRIBE_PROMPT),
        ];

        let response = self
            .with_retry(
                || async {
                    self.send(&ChatCompletionRequest {
                        model: &self.model,
                        messages: messages.clone(),
                        stream: false,
                        response_format: Some(ResponseFormat {
                            kind: "json_object",
                        }),
                    })
                    .await
                },
                "describe_plan",
            )
            .await?;

        let body: ChatCompletionResponse = response.json().await?;
        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ModelError::Decode("no completion returned".to_string()))
    }

    async fn stream_file(&self, request: FileRequest) -> Result<DeltaStream, ModelError> {
        let mut messages = vec![ChatMessage::system(FILE_PROMPT)];
        if let Some(original) = &request.original {
            messages.push(ChatMessage::user(fenced("Original", &request.path, original)));
        }
        if let Some(current) = &request.current {
            messages.push(ChatMessage::user(fenced(
                "Current state in the plan of",
                &request.path,
                current,
            )));
        }
        messages.push(ChatMessage::user(request.prompt.clone()));
        messages.push(ChatMessage::assistant(request.reply.clone()));
        messages.push(ChatMessage::user(file_instruction(&request)));

        let chunks = self.open_stream(messages, "stream_file").await?;
        let deltas = chunks.flat_map(|chunk| {
            let items: Vec<Result<FileDelta, ModelError>> = match chunk {
                Ok(chunk) => file_deltas(chunk).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            };
            stream::iter(items)
        });
        Ok(deltas.boxed())
    }
}
