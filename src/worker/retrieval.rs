//! HTTP retrieval service
//!
//! Posts the question to a remote retrieval/generation endpoint and reads
//! the answer back as newline-delimited JSON, one chunk per line.

use super::{AnswerRequest, Answerer, Chunk, ChunkStream, WorkerError};
use crate::mml::Stack;
use crate::rpc::Reference;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use url::Url;

/// Longest NDJSON line accepted from the endpoint
const MAX_LINE_BYTES: usize = 1024 * 1024;

pub struct RetrievalService {
    client: Client,
    endpoint: Url,
    model_id: String,
}

#[derive(Debug, Serialize)]
struct RetrievalRequest<'a> {
    model: &'a str,
    input: &'a str,
    conversation_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_mml: Option<&'a [Stack]>,
}

/// One NDJSON line of the response body
#[derive(Debug, Deserialize)]
struct RetrievalLine {
    #[serde(alias = "res", default)]
    text: String,
    #[serde(alias = "context", default)]
    references: Vec<Reference>,
}

impl RetrievalService {
    pub fn new(base_url: &str, model_id: impl Into<String>) -> Result<Self, WorkerError> {
        let endpoint = answer_endpoint(base_url)?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| WorkerError::unknown(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            model_id: model_id.into(),
        })
    }
}

/// `{base}/answer`, keeping every segment of the base path
fn answer_endpoint(base_url: &str) -> Result<Url, WorkerError> {
    let mut base = Url::parse(base_url)
        .map_err(|e| WorkerError::invalid_request(format!("bad retrieval URL '{base_url}': {e}")))?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join("answer")
        .map_err(|e| WorkerError::invalid_request(e.to_string()))
}

fn parse_line(line: &str) -> Option<Result<Chunk, WorkerError>> {
    if line.trim().is_empty() {
        return None;
    }
    Some(
        serde_json::from_str::<RetrievalLine>(line)
            .map(|l| Chunk {
                text: l.text,
                references: l.references,
            })
            .map_err(|e| WorkerError::unknown(format!("Failed to parse chunk: {e} - line: {line}"))),
    )
}

#[async_trait]
impl Answerer for RetrievalService {
    async fn answer(&self, request: &AnswerRequest) -> Result<ChunkStream, WorkerError> {
        let body = RetrievalRequest {
            model: &self.model_id,
            input: &request.input,
            conversation_id: &request.conversation_id,
            last_mml: request.last_mml.as_deref(),
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    WorkerError::network(format!("Request timeout: {e}"))
                } else if e.is_connect() {
                    WorkerError::network(format!("Connection failed: {e}"))
                } else {
                    WorkerError::unknown(format!("Request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerError::from_status(status, &body));
        }

        let bytes = response.bytes_stream().map_err(std::io::Error::other);
        let lines = FramedRead::new(StreamReader::new(bytes), LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let chunks = lines.filter_map(|line| async move {
            match line {
                Ok(line) => parse_line(&line),
                Err(e) => Some(Err(WorkerError::network(format!("Stream interrupted: {e}")))),
            }
        });
        Ok(chunks.boxed())
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
