//! The LLM provider seam. The pipeline consumes an [`LlmStream`] (a channel
//! of token chunks plus a one-shot usage report) and never touches HTTP
//! directly, so tests swap in [`MockEchoStreamer`].
//!
//! Plaintext goes to the provider; that is the accepted E2EE exception for
//! the inference hop.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use veil_billing::TokenUsage;
use veil_core::VeilError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn of the inference context, plaintext.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub model: String,
    pub context: Vec<ChatTurn>,
}

/// A live completion stream: token chunks as they arrive, then the provider's
/// authoritative usage report (None when the provider sent none).
pub struct LlmStream {
    pub tokens: mpsc::Receiver<Result<String, VeilError>>,
    pub usage: oneshot::Receiver<Option<TokenUsage>>,
}

pub trait LlmStreamer: Send + Sync {
    /// Begin a completion. Runs on the caller's runtime; the returned stream
    /// is fed by a spawned task.
    fn start(&self, request: CompletionRequest) -> LlmStream;
}

// ── Mock streamer ────────────────────────────────────────────────────────────

/// Test double: echoes the last user turn word by word.
pub struct MockEchoStreamer {
    /// Fail mid-stream with this message instead of completing.
    pub fail_with: Option<String>,
    /// Suppress the usage report to exercise the estimation paths.
    pub report_usage: bool,
}

impl Default for MockEchoStreamer {
    fn default() -> Self {
        Self { fail_with: None, report_usage: true }
    }
}

impl LlmStreamer for MockEchoStreamer {
    fn start(&self, request: CompletionRequest) -> LlmStream {
        let (token_tx, token_rx) = mpsc::channel(64);
        let (usage_tx, usage_rx) = oneshot::channel();

        let last_user = request
            .context
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.content.clone())
            .unwrap_or_default();
        let prompt_chars: usize = request.context.iter().map(|t| t.content.len()).sum();
        let fail_with = self.fail_with.clone();
        let report_usage = self.report_usage;

        tokio::spawn(async move {
            let reply = format!("Echo: {last_user}");
            let mut sent = 0usize;
            for (i, word) in reply.split_inclusive(' ').enumerate() {
                if let Some(msg) = &fail_with {
                    if i == 1 {
                        let _ = token_tx.send(Err(VeilError::StreamError(msg.clone()))).await;
                        let _ = usage_tx.send(None);
                        return;
                    }
                }
                sent += word.len();
                if token_tx.send(Ok(word.to_string())).await.is_err() {
                    return;
                }
            }
            let usage = report_usage.then_some(TokenUsage {
                input_tokens: (prompt_chars as u64 / 4).max(1),
                output_tokens: (sent as u64 / 4).max(1),
                cached_tokens: 0,
            });
            let _ = usage_tx.send(usage);
        });

        LlmStream { tokens: token_rx, usage: usage_rx }
    }
}

// ── HTTP provider client ─────────────────────────────────────────────────────

/// Streaming client for an OpenAI-compatible chat-completions endpoint.
pub struct HttpLlmStreamer {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    pub provider: String,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct WireDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireChoice {
    delta: Option<WireDelta>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    #[serde(default)]
    cached_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireErrorBody {
    error: WireError,
}

#[derive(Deserialize)]
struct WireError {
    message: String,
    #[serde(default)]
    code: Option<String>,
}

impl HttpLlmStreamer {
    pub fn new(base_url: String, api_key: String, provider: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
            provider,
        }
    }

    fn role_str(role: Role) -> &'static str {
        match role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    fn classify_error(message: &str, code: Option<&str>) -> VeilError {
        let needle = code.unwrap_or(message);
        if needle.contains("context_length") || message.contains("maximum context length") {
            VeilError::ContextLengthExceeded
        } else {
            VeilError::StreamError(message.to_string())
        }
    }
}

impl LlmStreamer for HttpLlmStreamer {
    fn start(&self, request: CompletionRequest) -> LlmStream {
        let (token_tx, token_rx) = mpsc::channel(256);
        let (usage_tx, usage_rx) = oneshot::channel();

        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": request.model,
            "messages": request
                .context
                .iter()
                .map(|t| WireMessage { role: Self::role_str(t.role), content: &t.content })
                .collect::<Vec<_>>(),
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        let client = self.client.clone();
        let api_key = self.api_key.clone();

        tokio::spawn(async move {
            let response = client
                .post(&url)
                .bearer_auth(&api_key)
                .json(&body)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    let _ = token_tx.send(Err(VeilError::StreamError(e.to_string()))).await;
                    let _ = usage_tx.send(None);
                    return;
                }
            };

            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                let err = serde_json::from_str::<WireErrorBody>(&text)
                    .map(|b| Self::classify_error(&b.error.message, b.error.code.as_deref()))
                    .unwrap_or_else(|_| {
                        VeilError::StreamError(format!("provider returned {status}"))
                    });
                let _ = token_tx.send(Err(err)).await;
                let _ = usage_tx.send(None);
                return;
            }

            use futures::StreamExt;
            let mut usage: Option<TokenUsage> = None;
            let mut pending = String::new();
            let mut bytes = response.bytes_stream();

            'outer: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = token_tx.send(Err(VeilError::StreamError(e.to_string()))).await;
                        let _ = usage_tx.send(None);
                        return;
                    }
                };
                pending.push_str(&String::from_utf8_lossy(&chunk));

                // SSE framing: one `data: {json}` payload per line.
                while let Some(newline) = pending.find('\n') {
                    let line = pending[..newline].trim().to_string();
                    pending.drain(..=newline);
                    let Some(payload) = line.strip_prefix("data:").map(str::trim) else {
                        continue;
                    };
                    if payload == "[DONE]" {
                        break 'outer;
                    }
                    match serde_json::from_str::<WireChunk>(payload) {
                        Ok(parsed) => {
                            if let Some(u) = parsed.usage {
                                usage = Some(TokenUsage {
                                    input_tokens: u.prompt_tokens.unwrap_or(0),
                                    output_tokens: u.completion_tokens.unwrap_or(0),
                                    cached_tokens: u.cached_tokens.unwrap_or(0),
                                });
                            }
                            for choice in parsed.choices {
                                if let Some(text) = choice.delta.and_then(|d| d.content) {
                                    if !text.is_empty()
                                        && token_tx.send(Ok(text)).await.is_err()
                                    {
                                        return;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "unparseable stream chunk skipped");
                            debug!(payload = %payload, "offending chunk");
                        }
                    }
                }
            }
            let _ = usage_tx.send(usage);
        });

        LlmStream { tokens: token_rx, usage: usage_rx }
    }
}
