use reqwest::{ Client as HttpClient, Response };
use serde::{ Deserialize, Serialize };
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio::sync::mpsc;
use log::{ debug, info };

use super::lines::{ LineBuffer, LineDecoder, UpstreamLine };
use super::{
    ChatClient,
    ChatRequest,
    ChatResponse,
    ChunkStream,
    LlmError,
    ModelInfo,
    PullStream,
    UpstreamStream,
};
use crate::llm::LlmConfig;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: HttpClient,
    base_url: String,
    max_malformed_lines: usize,
}

#[derive(Serialize)]
struct PullRequest<'a> {
    name: &'a str,
    stream: bool,
}

#[derive(Serialize)]
struct DeleteRequest<'a> {
    name: &'a str,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

impl OllamaClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        max_malformed_lines: usize
    ) -> Result<Self, LlmError> {
        let http = HttpClient::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_malformed_lines,
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        Self::new(&config.base_url, config.timeout, config.max_malformed_lines)
    }

    fn url(&self, route: &str) -> String {
        format!("{}{}", self.base_url, route)
    }

    /// Turns a non-2xx response into `LlmError::Status` carrying the body for diagnostics.
    async fn ensure_success(response: Response) -> Result<Response, LlmError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(LlmError::Status { status: status.as_u16(), body })
    }

    /// Reads `response` line by line on a background task.
    ///
    /// The task stops after the final line, at end of body, on the first error, or as soon as
    /// the receiving side is dropped, in which case the response (and its connection) is
    /// released without reading further.
    fn ndjson_stream<T: UpstreamLine>(
        response: Response,
        max_malformed_lines: usize
    ) -> UpstreamStream<T> {
        let (tx, rx) = mpsc::channel::<Result<T, LlmError>>(32);

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buffer = LineBuffer::default();
            let mut decoder = LineDecoder::<T>::new(max_malformed_lines);

            loop {
                let next = tokio::select! {
                    _ = tx.closed() => {
                        debug!("Upstream consumer went away, dropping connection");
                        return;
                    }
                    next = body.next() => next,
                };

                let finished = next.is_none();
                let lines = match next {
                    Some(Ok(bytes)) => buffer.push(&bytes),
                    Some(Err(e)) => Err(LlmError::Transport(e)),
                    None => buffer.finish().map(|rest| rest.into_iter().collect()),
                };
                let lines = match lines {
                    Ok(lines) => lines,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };

                for line in lines {
                    match decoder.decode(&line) {
                        Ok(Some(item)) => {
                            let last = item.is_final();
                            if tx.send(Ok(item)).await.is_err() || last {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }

                if finished {
                    return;
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}

#[async_trait]
impl ChatClient for OllamaClient {
    async fn stream_chat(&self, mut request: ChatRequest) -> Result<ChunkStream, LlmError> {
        request.stream = true;
        debug!(
            "Opening chat stream: model={}, messages={}",
            request.model,
            request.messages.len()
        );

        let response = self.http.post(self.url("/api/chat")).json(&request).send().await?;
        let response = Self::ensure_success(response).await?;

        Ok(Self::ndjson_stream(response, self.max_malformed_lines))
    }

    async fn chat(&self, mut request: ChatRequest) -> Result<ChatResponse, LlmError> {
        request.stream = false;

        let response = self.http.post(self.url("/api/chat")).json(&request).send().await?;
        let response = Self::ensure_success(response).await?;
        let body = response.text().await?;

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| LlmError::Protocol(format!("invalid chat response: {}", e)))?;
        if let Some(err) = parsed.error {
            return Err(LlmError::Upstream(err));
        }
        Ok(parsed)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError> {
        let response = self.http.get(self.url("/api/tags")).send().await?;
        let response = Self::ensure_success(response).await?;
        let body = response.text().await?;

        let tags: TagsResponse = serde_json::from_str(&body)
            .map_err(|e| LlmError::Protocol(format!("invalid model list: {}", e)))?;
        Ok(tags.models)
    }

    async fn pull_model(&self, name: &str) -> Result<PullStream, LlmError> {
        info!("Pulling model: {}", name);
        let request = PullRequest { name, stream: true };

        let response = self.http.post(self.url("/api/pull")).json(&request).send().await?;
        let response = Self::ensure_success(response).await?;

        Ok(Self::ndjson_stream(response, self.max_malformed_lines))
    }

    async fn delete_model(&self, name: &str) -> Result<(), LlmError> {
        info!("Deleting model: {}", name);
        let request = DeleteRequest { name };

        let response = self.http.delete(self.url("/api/delete")).json(&request).send().await?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        match self.http.get(self.url("/api/tags")).timeout(HEALTH_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Health probe failed: {}", e);
                false
            }
        }
    }
}
