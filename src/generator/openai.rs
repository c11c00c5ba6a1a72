use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ChatMessage, Generator, TokenStream};
use crate::config::GenerationConfig;
use crate::error::{Error, FailureKind, Result, ServiceError};

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// One logical line of a server-sent-event body.
#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    Data(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let line = line.trim_end_matches('\r');
    match line.strip_prefix("data:") {
        Some(payload) => {
            let payload = payload.trim();
            if payload == "[DONE]" {
                SseLine::Done
            } else if payload.is_empty() {
                SseLine::Skip
            } else {
                SseLine::Data(payload.to_string())
            }
        }
        // comments (": keep-alive"), event names, blank separators
        None => SseLine::Skip,
    }
}

/// Accumulates raw bytes and hands out complete lines. Lines are only
/// decoded once whole, so multi-byte characters split across network
/// chunks survive.
#[derive(Debug, Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned())
    }
}

/// Text carried by one `data:` payload, if any.
fn decode_delta(payload: &str) -> std::result::Result<Option<String>, ServiceError> {
    let chunk: StreamChunk = serde_json::from_str(payload)
        .map_err(|e| ServiceError::malformed(format!("unreadable stream chunk: {e}")))?;

    if let Some(err) = chunk.error {
        return Err(ServiceError::new(
            FailureKind::Unavailable,
            format!("provider reported an error mid-stream: {err}"),
        ));
    }

    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect();
    Ok(if text.is_empty() { None } else { Some(text) })
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint
/// (OpenAI, OpenRouter, Ollama, vLLM and friends).
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    timeout: Duration,
    idle_timeout: Duration,
}

impl OpenAiGenerator {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        api_key: Option<String>,
        temperature: f32,
        timeout: Duration,
        idle_timeout: Duration,
    ) -> Result<Self> {
        // No client-wide timeout: it would also cap how long a stream may run.
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .user_agent(concat!("askbase/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Generation(ServiceError::from_transport(&e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.into(),
            api_key,
            temperature,
            timeout,
            idle_timeout,
        })
    }

    pub fn from_config(config: &GenerationConfig) -> Result<Self> {
        let api_key = config.api_key();
        if api_key.is_none() {
            warn!(
                "{} is not set; generation requests will be sent without credentials",
                config.api_key_env
            );
        }
        Self::new(
            &config.base_url,
            config.model.clone(),
            api_key,
            config.temperature,
            config.timeout(),
            config.stream_idle_timeout(),
        )
    }

    fn request<'a>(
        &'a self,
        system_prompt: &'a str,
        messages: &'a [ChatMessage],
        stream: bool,
    ) -> reqwest::RequestBuilder {
        let mut wire = Vec::with_capacity(messages.len() + 1);
        wire.push(WireMessage {
            role: "system",
            content: system_prompt,
        });
        wire.extend(messages.iter().map(|m| WireMessage {
            role: m.role.as_str(),
            content: &m.content,
        }));

        let mut req = self.client.post(&self.endpoint).json(&CompletionRequest {
            model: &self.model,
            messages: wire,
            temperature: self.temperature,
            stream,
        });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    async fn complete(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
    ) -> std::result::Result<String, ServiceError> {
        let resp = self
            .request(system_prompt, messages, false)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ServiceError::from_transport(&e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ServiceError::from_transport(&e))?;
        if !status.is_success() {
            return Err(ServiceError::from_status(status, &body));
        }

        let parsed: CompletionResponse = serde_json::from_str(&body)
            .map_err(|e| ServiceError::malformed(format!("unreadable completion: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ServiceError::malformed("completion has no message content"))
    }

    async fn open_stream(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
    ) -> std::result::Result<reqwest::Response, ServiceError> {
        let send = self.request(system_prompt, messages, true).send();
        let resp = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| {
                ServiceError::timeout(format!("no response within {:?}", self.timeout))
            })?
            .map_err(|e| ServiceError::from_transport(&e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = match tokio::time::timeout(self.timeout, resp.text()).await {
                Ok(Ok(body)) => body,
                Ok(Err(e)) => {
                    debug!("Could not read {status} error body: {e}");
                    String::new()
                }
                Err(_) => {
                    debug!("{status} error body not received within {:?}", self.timeout);
                    String::new()
                }
            };
            return Err(ServiceError::from_status(status, &body));
        }
        Ok(resp)
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    async fn generate(&self, system_prompt: &str, messages: &[ChatMessage]) -> Result<String> {
        let started = Instant::now();
        let result = self.complete(system_prompt, messages).await;
        debug!(
            "Completion from {} ({} messages) finished in {:?}",
            self.model,
            messages.len(),
            started.elapsed()
        );
        result.map_err(|e| {
            warn!("Generation failed: {e}");
            Error::Generation(e)
        })
    }

    async fn generate_stream(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
    ) -> Result<TokenStream> {
        let resp = self
            .open_stream(system_prompt, messages)
            .await
            .map_err(|e| {
                warn!("Opening generation stream failed: {e}");
                Error::Generation(e)
            })?;
        debug!("Generation stream opened for {}", self.model);

        let idle = self.idle_timeout;
        let stream = async_stream::stream! {
            let mut bytes = resp.bytes_stream();
            let mut lines = LineBuffer::default();
            let mut finished = false;
            let mut failed = false;

            'read: loop {
                let next = match tokio::time::timeout(idle, bytes.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        failed = true;
                        yield Err(Error::Generation(ServiceError::timeout(format!(
                            "no stream data for {idle:?}"
                        ))));
                        break 'read;
                    }
                };
                let Some(chunk) = next else {
                    break 'read;
                };
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        failed = true;
                        yield Err(Error::Generation(ServiceError::from_transport(&e)));
                        break 'read;
                    }
                };

                lines.push(&chunk);
                while let Some(line) = lines.next_line() {
                    match parse_sse_line(&line) {
                        SseLine::Done => {
                            finished = true;
                            break 'read;
                        }
                        SseLine::Data(payload) => match decode_delta(&payload) {
                            Ok(Some(text)) => yield Ok(text),
                            Ok(None) => {}
                            Err(e) => {
                                failed = true;
                                yield Err(Error::Generation(e));
                                break 'read;
                            }
                        },
                        SseLine::Skip => {}
                    }
                }
            }

            if !finished && !failed {
                yield Err(Error::Generation(ServiceError::new(
                    FailureKind::Unavailable,
                    "stream ended before completion marker",
                )));
            }
        };

        Ok(stream.boxed())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
