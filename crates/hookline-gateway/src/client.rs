use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Future, Stream, StreamExt};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::instrument;

use hookline_core::errors::GenerationError;
use hookline_core::request::GenerationBody;
use hookline_core::service::{ByteStream, GenerationService};

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8787/api/generate/stream";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Connection settings for the HTTP generation service.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub endpoint: String,
    pub connect_timeout: Duration,
    /// Longest gap allowed between two body chunks.
    pub idle_timeout: Duration,
    pub bearer_token: Option<SecretString>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            connect_timeout: CONNECT_TIMEOUT,
            idle_timeout: IDLE_TIMEOUT,
            bearer_token: None,
        }
    }
}

/// Generation service reached over HTTP with a streamed response body.
pub struct HttpGenerationService {
    client: Client,
    config: GatewayConfig,
}

impl HttpGenerationService {
    pub fn new(config: GatewayConfig) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| GenerationError::NetworkError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    fn build_request(&self, body: &GenerationBody) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(&self.config.endpoint)
            .header("accept", "text/event-stream")
            .json(body);

        if let Some(token) = &self.config.bearer_token {
            req = req.bearer_auth(token.expose_secret());
        }
        req
    }
}

#[async_trait]
impl GenerationService for HttpGenerationService {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip(self, body), fields(endpoint = %self.config.endpoint, category = %body.category))]
    async fn open(&self, body: &GenerationBody) -> Result<ByteStream, GenerationError> {
        let resp = self.build_request(body).send().await.map_err(|e| {
            if e.is_timeout() {
                GenerationError::Timeout(self.config.connect_timeout)
            } else {
                GenerationError::NetworkError(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            return Err(match GenerationError::from_status(status.as_u16(), body) {
                GenerationError::RateLimited { .. } => GenerationError::RateLimited { retry_after },
                other => other,
            });
        }

        tracing::debug!(status = status.as_u16(), "generation stream opened");

        let chunks = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| GenerationError::StreamInterrupted(e.to_string())));
        Ok(Box::pin(IdleTimeoutStream::new(chunks, self.config.idle_timeout)))
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Wraps a body stream; if no chunk arrives within `idle_duration`, yields a
/// timeout error and ends.
pub struct IdleTimeoutStream {
    inner: ByteStream,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    timed_out: bool,
}

impl IdleTimeoutStream {
    pub fn new(
        inner: impl Stream<Item = Result<Bytes, GenerationError>> + Send + 'static,
        idle_duration: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(inner),
            idle_deadline: Box::pin(tokio::time::sleep(idle_duration)),
            idle_duration,
            timed_out: false,
        }
    }
}

impl Stream for IdleTimeoutStream {
    type Item = Result<Bytes, GenerationError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.timed_out {
            return Poll::Ready(None);
        }

        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(item)) => {
                let next_deadline = tokio::time::Instant::now() + self.idle_duration;
                self.idle_deadline.as_mut().reset(next_deadline);
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => {
                if self.idle_deadline.as_mut().poll(cx).is_ready() {
                    self.timed_out = true;
                    return Poll::Ready(Some(Err(GenerationError::Timeout(self.idle_duration))));
                }
                Poll::Pending
            }
        }
    }
}
