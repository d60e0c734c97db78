//! Compute worker
//!
//! Serves LLM requests issued by conversation contexts. Each request is
//! answered by a streaming [`Answerer`]; its chunks are tagged with a
//! per-request message id and pushed back through the RPC bridge as they
//! arrive, the last one marked final.

mod error;
mod registry;
mod retrieval;

pub use error::WorkerError;
pub use registry::ModelRegistry;
pub use retrieval::RetrievalService;

use crate::mml::Stack;
use crate::rpc::{LlmResponseMessage, PartialResult, Reference, RpcBridge, WorkerReply, WorkerRequest};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One piece of generated text
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Chunk {
    pub text: String,
    pub references: Vec<Reference>,
}

#[cfg(test)]
impl Chunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            references: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnswerRequest {
    pub conversation_id: String,
    pub input: String,
    /// Stacks of the conversation's latest turn
    pub last_mml: Option<Vec<Stack>>,
}

pub type ChunkStream = BoxStream<'static, Result<Chunk, WorkerError>>;

/// Common interface for answer generators
#[async_trait]
pub trait Answerer: Send + Sync {
    /// Open a stream of answer chunks
    async fn answer(&self, request: &AnswerRequest) -> Result<ChunkStream, WorkerError>;

    fn model_id(&self) -> &str;
}

/// Logging wrapper for answerers
pub struct LoggingAnswerer {
    inner: Arc<dyn Answerer>,
    model_id: String,
}

impl LoggingAnswerer {
    pub fn new(inner: Arc<dyn Answerer>) -> Self {
        let model_id = inner.model_id().to_string();
        Self { inner, model_id }
    }
}

#[async_trait]
impl Answerer for LoggingAnswerer {
    async fn answer(&self, request: &AnswerRequest) -> Result<ChunkStream, WorkerError> {
        let start = std::time::Instant::now();
        let result = self.inner.answer(request).await;
        let duration = start.elapsed();

        match &result {
            Ok(_) => {
                tracing::info!(
                    model = %self.model_id,
                    conv_id = %request.conversation_id,
                    duration_ms = %duration.as_millis(),
                    "Answer stream opened"
                );
            }
            Err(e) => {
                tracing::error!(
                    model = %self.model_id,
                    conv_id = %request.conversation_id,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    retryable = e.kind.is_retryable(),
                    retry_after_ms = ?e.retry_after.map(|d| d.as_millis()),
                    "Answer request failed"
                );
            }
        }

        result
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// In-process worker serving the `llm` task
pub struct Worker {
    registry: Arc<ModelRegistry>,
    bridge: Arc<RpcBridge>,
}

impl Worker {
    pub fn new(registry: Arc<ModelRegistry>, bridge: Arc<RpcBridge>) -> Self {
        Self { registry, bridge }
    }

    /// Serve requests until the channel closes or `cancel` fires. Every
    /// request runs on its own task so slow answers do not block others.
    pub async fn run(self, mut rx: mpsc::Receiver<WorkerRequest>, cancel: CancellationToken) {
        tracing::info!(models = ?self.registry.available_models(), "Starting worker");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                request = rx.recv() => {
                    let Some(request) = request else { break };
                    let registry = Arc::clone(&self.registry);
                    let bridge = Arc::clone(&self.bridge);
                    tokio::spawn(async move {
                        handle_request(&registry, &bridge, request).await;
                    });
                }
            }
        }
        tracing::info!("Worker stopped");
    }
}

async fn handle_request(registry: &ModelRegistry, bridge: &RpcBridge, request: WorkerRequest) {
    match request {
        WorkerRequest::LlmRequest {
            bot_channel_name,
            model_id,
            input,
            context,
        } => {
            let request = AnswerRequest {
                conversation_id: context.conversation_id,
                input,
                last_mml: context.last_mml,
            };
            stream_answer(registry, bridge, &bot_channel_name, &model_id, &request).await;
        }
        WorkerRequest::SendDataSourceToParse { parser, .. } => {
            tracing::warn!(parser = %parser, "LLM worker cannot parse data sources; dropping request");
        }
    }
}

/// Stream one answer into `channel`. Empty chunks are skipped, every chunk
/// carries the same `lm_msg_id`, and exactly one final result is sent: the
/// last real chunk, or an empty one when the answerer produced nothing. When
/// the answerer fails the final result carries the error. Stops early once
/// nobody listens on the channel.
pub async fn stream_answer(
    registry: &ModelRegistry,
    bridge: &RpcBridge,
    channel: &str,
    model_id: &str,
    request: &AnswerRequest,
) {
    let lm_msg_id = uuid::Uuid::new_v4().to_string();
    let send = |chunk: Chunk, is_final: bool, error: Option<String>| {
        bridge.dispatch(WorkerReply::SendLlmResponse {
            message: LlmResponseMessage {
                bot_channel_name: Some(channel.to_string()),
                result: PartialResult {
                    res: chunk.text,
                    context: chunk.references,
                    is_final,
                    lm_msg_id: Some(lm_msg_id.clone()),
                    error,
                },
            },
        })
    };

    let mut stream = match registry.get(model_id) {
        Some(answerer) => match answerer.answer(request).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "Answerer failed to start");
                let _ = send(Chunk::default(), true, Some(e.to_string()));
                return;
            }
        },
        None => {
            tracing::warn!(channel = %channel, model = %model_id, "Unknown model");
            let error = WorkerError::unknown_model(model_id);
            let _ = send(Chunk::default(), true, Some(error.to_string()));
            return;
        }
    };

    let mut pending: Option<Chunk> = None;
    let mut failure = None;
    let mut sent = 0usize;
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) if chunk.text.is_empty() => continue,
            Ok(chunk) => {
                if let Some(prev) = pending.replace(chunk) {
                    if send(prev, false, None).is_err() {
                        tracing::debug!(channel = %channel, "Consumer gone, abandoning answer");
                        return;
                    }
                    sent += 1;
                }
            }
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "Answer stream failed");
                failure = Some(e.to_string());
                break;
            }
        }
    }

    let last = pending.unwrap_or_default();
    if send(last, true, failure).is_ok() {
        sent += 1;
    }
    tracing::debug!(channel = %channel, lm_msg_id = %lm_msg_id, sent, "Answer streamed");
}
