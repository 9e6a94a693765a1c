//! Language-model provider interface and streaming plumbing.
//!
//! Providers implement [`LanguageModel`] plus an [`LlmSession`] that runs one
//! completion attempt; [`LlmStream`] owns the retry loop, function-call
//! collection, and metrics emission so every provider behaves identically.

pub mod chat_context;
pub mod function_context;

pub use chat_context::{ChatContext, ChatMessage, ChatRole};
pub use function_context::{
    AiFunction, CalledFunction, FunctionCallInfo, FunctionContext, FunctionHandler,
};

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{AgentError, Result};
use crate::metrics::LlmMetrics;
use crate::types::ApiConnectOptions;

/// Incremental change to one completion choice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChoiceDelta {
    /// Author role, present on the first delta of a choice.
    pub role: Option<ChatRole>,
    /// New text content, if any.
    pub content: Option<String>,
    /// Newly requested tool calls, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<FunctionCallInfo>,
}

/// One choice inside a [`ChatChunk`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    /// The incremental update.
    pub delta: ChoiceDelta,
    /// Choice index for `n > 1` requests.
    pub index: u32,
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionUsage {
    /// Tokens generated.
    pub completion_tokens: u32,
    /// Tokens in the prompt.
    pub prompt_tokens: u32,
    /// Total billed tokens.
    pub total_tokens: u32,
}

/// One streamed chunk of a chat completion.
///
/// At most one chunk per stream carries `usage`, on or before termination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatChunk {
    /// Provider request id, constant across one stream.
    pub request_id: String,
    /// Updated choices.
    pub choices: Vec<Choice>,
    /// Usage record, when the provider reports one.
    pub usage: Option<CompletionUsage>,
}

/// Constraint on tool selection for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// The model decides.
    Auto,
    /// The model must call some tool.
    Required,
    /// Tool calls are disabled.
    None,
    /// The model must call the named function.
    Function(String),
}

/// Provider capability flags steering orchestrator behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmCapabilities {
    /// Whether integer enums are accepted as function argument choices.
    pub supports_choices_on_int: bool,
    /// Whether function definitions must be re-sent when prior tool calls
    /// exist in the chat context.
    pub requires_persistent_functions: bool,
}

impl Default for LlmCapabilities {
    fn default() -> Self {
        Self {
            supports_choices_on_int: true,
            requires_persistent_functions: false,
        }
    }
}

/// Parameters for one [`LanguageModel::chat`] call.
#[derive(Clone, Default)]
pub struct ChatRequest {
    /// Conversation history for this completion.
    pub chat_ctx: ChatContext,
    /// Functions the model may call.
    pub fnc_ctx: Option<Arc<FunctionContext>>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Number of choices to generate.
    pub n: Option<u32>,
    /// Whether the model may request several tools at once.
    pub parallel_tool_calls: Option<bool>,
    /// Tool selection constraint.
    pub tool_choice: Option<ToolChoice>,
    /// Connection and retry policy.
    pub conn_options: ApiConnectOptions,
}

impl ChatRequest {
    /// A request over the given history with default options.
    pub fn new(chat_ctx: ChatContext) -> Self {
        Self {
            chat_ctx,
            ..Self::default()
        }
    }

    /// Attach a function context.
    pub fn with_fnc_ctx(mut self, fnc_ctx: Option<Arc<FunctionContext>>) -> Self {
        self.fnc_ctx = fnc_ctx;
        self
    }
}

/// A streaming large language model.
pub trait LanguageModel: Send + Sync {
    /// Provider label used in logs and metrics.
    fn label(&self) -> &str;

    /// Capability flags.
    fn capabilities(&self) -> LlmCapabilities {
        LlmCapabilities::default()
    }

    /// Start a chat completion.
    fn chat(&self, request: ChatRequest) -> LlmStream;
}

/// One completion attempt against a provider.
///
/// The same session is re-invoked on retryable failures, so implementations
/// must be restartable: build the request from owned state, not from
/// consumed inputs.
#[async_trait]
pub trait LlmSession: Send + Sync + 'static {
    /// Run one attempt, sending chunks through `io`.
    async fn attempt(&self, io: &LlmStreamIo) -> Result<()>;
}

/// Chunk sink handed to an [`LlmSession`].
pub struct LlmStreamIo {
    tx: mpsc::UnboundedSender<ChatChunk>,
    stats: Arc<Mutex<StreamStats>>,
    calls: Arc<Mutex<Vec<FunctionCallInfo>>>,
}

impl LlmStreamIo {
    /// Forward one chunk to the consumer.
    ///
    /// # Errors
    ///
    /// Returns an error if the consumer side has been dropped.
    pub fn send(&self, chunk: ChatChunk) -> Result<()> {
        if let Ok(mut stats) = self.stats.lock() {
            if stats.first_chunk.is_none() {
                stats.first_chunk = Some(Instant::now());
            }
            stats.request_id = chunk.request_id.clone();
            if let Some(usage) = chunk.usage {
                stats.usage = Some(usage);
            }
        }
        if let Ok(mut calls) = self.calls.lock() {
            for choice in &chunk.choices {
                calls.extend(choice.delta.tool_calls.iter().cloned());
            }
        }
        self.tx
            .send(chunk)
            .map_err(|_| AgentError::Channel("LLM stream consumer dropped".into()))
    }
}

#[derive(Debug)]
struct StreamStats {
    started: Instant,
    first_chunk: Option<Instant>,
    request_id: String,
    usage: Option<CompletionUsage>,
}

/// A cancellable stream of [`ChatChunk`]s with retry and metrics.
pub struct LlmStream {
    chat_ctx: ChatContext,
    fnc_ctx: Option<Arc<FunctionContext>>,
    rx: mpsc::UnboundedReceiver<ChatChunk>,
    calls: Arc<Mutex<Vec<FunctionCallInfo>>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
    metrics_rx: Option<oneshot::Receiver<LlmMetrics>>,
}

impl LlmStream {
    /// Spawn the stream driver over a provider session.
    pub fn spawn(
        label: &str,
        chat_ctx: ChatContext,
        fnc_ctx: Option<Arc<FunctionContext>>,
        conn_options: ApiConnectOptions,
        session: Arc<dyn LlmSession>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (metrics_tx, metrics_rx) = oneshot::channel();
        let stats = Arc::new(Mutex::new(StreamStats {
            started: Instant::now(),
            first_chunk: None,
            request_id: String::new(),
            usage: None,
        }));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let io = LlmStreamIo {
            tx,
            stats: Arc::clone(&stats),
            calls: Arc::clone(&calls),
        };
        let label = label.to_string();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let run = async {
                let mut attempt = 0u32;
                loop {
                    match session.attempt(&io).await {
                        Ok(()) => break Ok(()),
                        Err(e) => {
                            if !e.retryable() || attempt >= conn_options.max_retry {
                                break Err(e);
                            }
                            let interval = conn_options.interval_for_retry(attempt);
                            warn!(
                                llm = %label,
                                attempt = attempt + 1,
                                "failed to generate LLM completion, retrying in {interval:?}: {e}"
                            );
                            tokio::time::sleep(interval).await;
                            attempt += 1;
                        }
                    }
                }
            };

            let (cancelled, outcome) = tokio::select! {
                () = token.cancelled() => (true, Ok(())),
                res = run => (false, res),
            };
            drop(io);

            let (ttft, request_id, usage, duration) = match stats.lock() {
                Ok(stats) => (
                    stats.first_chunk.map(|at| at - stats.started),
                    stats.request_id.clone(),
                    stats.usage,
                    stats.started.elapsed(),
                ),
                Err(_) => (None, String::new(), None, Duration::ZERO),
            };
            let usage = usage.unwrap_or_default();
            let secs = duration.as_secs_f64();
            let _ = metrics_tx.send(LlmMetrics {
                timestamp: Utc::now(),
                request_id,
                label,
                sequence_id: None,
                ttft,
                duration,
                completion_tokens: usage.completion_tokens,
                prompt_tokens: usage.prompt_tokens,
                total_tokens: usage.total_tokens,
                tokens_per_second: if secs > 0.0 {
                    f64::from(usage.completion_tokens) / secs
                } else {
                    0.0
                },
                cancelled,
                error: outcome.as_ref().err().map(ToString::to_string),
            });
            outcome
        });

        Self {
            chat_ctx,
            fnc_ctx,
            rx,
            calls,
            cancel,
            task: Some(task),
            metrics_rx: Some(metrics_rx),
        }
    }

    /// The chat context this completion was requested with.
    pub fn chat_ctx(&self) -> &ChatContext {
        &self.chat_ctx
    }

    /// The function context this completion was requested with.
    pub fn fnc_ctx(&self) -> Option<&Arc<FunctionContext>> {
        self.fnc_ctx.as_ref()
    }

    /// Tool calls collected from the stream so far.
    pub fn function_calls(&self) -> Vec<FunctionCallInfo> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Shared handle to the collected tool calls, for inspection after the
    /// stream has been consumed elsewhere.
    pub fn function_calls_handle(&self) -> Arc<Mutex<Vec<FunctionCallInfo>>> {
        Arc::clone(&self.calls)
    }

    /// Next chunk; yields a terminal error once, after the channel drains,
    /// when the driver failed.
    pub async fn next(&mut self) -> Option<Result<ChatChunk>> {
        if let Some(chunk) = self.rx.recv().await {
            return Some(Ok(chunk));
        }
        match self.task.take() {
            Some(handle) => match handle.await {
                Ok(Err(e)) => Some(Err(e)),
                Ok(Ok(())) => None,
                Err(e) => Some(Err(AgentError::Pipeline(format!(
                    "LLM stream task panicked: {e}"
                )))),
            },
            None => None,
        }
    }

    /// Metrics for this stream, resolved once the stream finishes. May be
    /// taken once.
    pub fn take_metrics(&mut self) -> Option<oneshot::Receiver<LlmMetrics>> {
        self.metrics_rx.take()
    }

    /// Cancel the stream and wait for the driver to exit.
    pub async fn aclose(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.task.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedSession {
        /// Error to fail with on early attempts, then success.
        failures: Mutex<u32>,
        error: crate::error::ApiError,
        chunks: Vec<ChatChunk>,
    }

    #[async_trait]
    impl LlmSession for ScriptedSession {
        async fn attempt(&self, io: &LlmStreamIo) -> Result<()> {
            {
                let mut failures = match self.failures.lock() {
                    Ok(f) => f,
                    Err(_) => return Err(AgentError::Pipeline("poisoned".into())),
                };
                if *failures > 0 {
                    *failures -= 1;
                    return Err(self.error.clone().into());
                }
            }
            for chunk in &self.chunks {
                io.send(chunk.clone())?;
            }
            Ok(())
        }
    }

    fn text_chunk(request_id: &str, text: &str) -> ChatChunk {
        ChatChunk {
            request_id: request_id.into(),
            choices: vec![Choice {
                delta: ChoiceDelta {
                    role: Some(ChatRole::Assistant),
                    content: Some(text.into()),
                    tool_calls: Vec::new(),
                },
                index: 0,
            }],
            usage: None,
        }
    }

    fn fast_options() -> ApiConnectOptions {
        ApiConnectOptions {
            max_retry: 2,
            retry_interval: Duration::from_millis(1),
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn streams_chunks_in_order() {
        let session = Arc::new(ScriptedSession {
            failures: Mutex::new(0),
            error: crate::error::ApiError::Connection("unused".into()),
            chunks: vec![text_chunk("req_1", "Hello"), text_chunk("req_1", " there")],
        });
        let mut stream = LlmStream::spawn(
            "mock-llm",
            ChatContext::new(),
            None,
            fast_options(),
            session,
        );

        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => unreachable!("unexpected error: {e}"),
            };
            if let Some(content) = &chunk.choices[0].delta.content {
                text.push_str(content);
            }
        }
        assert_eq!(text, "Hello there");
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let session = Arc::new(ScriptedSession {
            failures: Mutex::new(2),
            error: crate::error::ApiError::Connection("reset".into()),
            chunks: vec![text_chunk("req_2", "recovered")],
        });
        let mut stream = LlmStream::spawn(
            "mock-llm",
            ChatContext::new(),
            None,
            fast_options(),
            session,
        );
        let first = stream.next().await;
        match first {
            Some(Ok(chunk)) => {
                assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("recovered"));
            }
            other => unreachable!("expected chunk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn terminal_error_surfaces_after_retries() {
        let session = Arc::new(ScriptedSession {
            failures: Mutex::new(10),
            error: crate::error::ApiError::Connection("down".into()),
            chunks: Vec::new(),
        });
        let mut stream = LlmStream::spawn(
            "mock-llm",
            ChatContext::new(),
            None,
            fast_options(),
            session,
        );
        match stream.next().await {
            Some(Err(AgentError::Api(_))) => {}
            other => unreachable!("expected api error, got {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn non_retryable_error_fails_immediately() {
        let session = Arc::new(ScriptedSession {
            failures: Mutex::new(10),
            error: crate::error::ApiError::Status {
                status_code: 401,
                message: "bad key".into(),
            },
            chunks: Vec::new(),
        });
        let mut stream = LlmStream::spawn(
            "mock-llm",
            ChatContext::new(),
            None,
            fast_options(),
            session,
        );
        match stream.next().await {
            Some(Err(e)) => assert!(!e.retryable()),
            other => unreachable!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn collects_function_calls_and_metrics() {
        let call = FunctionCallInfo {
            tool_call_id: "call_1".into(),
            name: "get_weather".into(),
            raw_arguments: "{}".into(),
            arguments: serde_json::json!({}),
        };
        let mut chunk = text_chunk("req_3", "calling tool");
        chunk.choices[0].delta.tool_calls = vec![call.clone()];
        chunk.usage = Some(CompletionUsage {
            completion_tokens: 5,
            prompt_tokens: 20,
            total_tokens: 25,
        });

        let session = Arc::new(ScriptedSession {
            failures: Mutex::new(0),
            error: crate::error::ApiError::Connection("unused".into()),
            chunks: vec![chunk],
        });
        let mut stream = LlmStream::spawn(
            "mock-llm",
            ChatContext::new(),
            None,
            fast_options(),
            session,
        );
        let metrics_rx = stream.take_metrics();
        while stream.next().await.is_some() {}

        assert_eq!(stream.function_calls(), vec![call]);
        let metrics = match metrics_rx {
            Some(rx) => rx.await,
            None => unreachable!("metrics taken once"),
        };
        let metrics = match metrics {
            Ok(m) => m,
            Err(_) => unreachable!("driver emits metrics"),
        };
        assert_eq!(metrics.request_id, "req_3");
        assert_eq!(metrics.total_tokens, 25);
        assert!(!metrics.cancelled);
    }

    #[tokio::test]
    async fn aclose_marks_cancelled() {
        struct HangingSession;
        #[async_trait]
        impl LlmSession for HangingSession {
            async fn attempt(&self, _io: &LlmStreamIo) -> Result<()> {
                std::future::pending::<()>().await;
                Ok(())
            }
        }

        let mut stream = LlmStream::spawn(
            "mock-llm",
            ChatContext::new(),
            None,
            fast_options(),
            Arc::new(HangingSession),
        );
        let metrics_rx = stream.take_metrics();
        stream.aclose().await;
        if let Some(rx) = metrics_rx {
            match rx.await {
                Ok(m) => assert!(m.cancelled),
                Err(_) => unreachable!("driver emits metrics on cancel"),
            }
        }
    }
}
