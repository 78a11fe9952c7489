use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use hookline_core::errors::GenerationError;
use hookline_core::frame::StreamFrame;
use hookline_core::item::ParsedItem;
use hookline_core::request::GenerationBody;
use hookline_core::service::{ByteStream, GenerationService};

use crate::wire::encode_frame;

/// Pre-programmed responses for deterministic testing without a network.
pub enum MockResponse {
    /// Body made of these raw chunks, then end of stream.
    Chunks(Vec<Result<Bytes, GenerationError>>),
    /// Same as `Chunks`, but the body never ends afterwards.
    Stalled(Vec<Bytes>),
    /// Body fed live from a channel; ends when the sender is dropped.
    Live(mpsc::Receiver<Result<Bytes, GenerationError>>),
    /// `open` itself fails.
    Error(GenerationError),
    /// Wait, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// One chunk per encoded frame.
    pub fn frames(frames: Vec<StreamFrame>) -> Self {
        Self::Chunks(
            frames
                .iter()
                .map(|f| Ok(Bytes::from(encode_frame(f))))
                .collect(),
        )
    }

    /// Stream `items` as a JSON array split into deltas of `chunk_len` chars,
    /// then a `done` frame carrying the same items.
    pub fn streamed_items(items: &[ParsedItem], chunk_len: usize) -> Self {
        let mut frames = delta_frames(items, chunk_len);
        frames.push(StreamFrame::Done {
            items: items.to_vec(),
        });
        Self::frames(frames)
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }

    /// A live response and the sender that drives it.
    pub fn live() -> (mpsc::Sender<Result<Bytes, GenerationError>>, Self) {
        let (tx, rx) = mpsc::channel(64);
        (tx, Self::Live(rx))
    }
}

/// The JSON array for `items`, cut into delta frames of `chunk_len` chars.
pub fn delta_frames(items: &[ParsedItem], chunk_len: usize) -> Vec<StreamFrame> {
    let text = serde_json::to_string_pretty(items).unwrap_or_default();
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_len.max(1))
        .map(|c| StreamFrame::Delta {
            text: c.iter().collect(),
        })
        .collect()
}

/// Mock service that hands out pre-programmed responses in call order.
pub struct MockService {
    responses: Mutex<VecDeque<MockResponse>>,
    bodies: Mutex<Vec<GenerationBody>>,
}

impl MockService {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            bodies: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.bodies.lock().len()
    }

    /// Request bodies received so far, in call order.
    pub fn bodies(&self) -> Vec<GenerationBody> {
        self.bodies.lock().clone()
    }
}

#[async_trait]
impl GenerationService for MockService {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open(&self, body: &GenerationBody) -> Result<ByteStream, GenerationError> {
        let call = {
            let mut bodies = self.bodies.lock();
            bodies.push(body.clone());
            bodies.len()
        };

        let Some(mut response) = self.responses.lock().pop_front() else {
            return Err(GenerationError::InvalidRequest(format!(
                "MockService: no response configured for call {call}"
            )));
        };

        // Unrolled iteratively to avoid recursive async.
        loop {
            match response {
                MockResponse::Chunks(chunks) => return Ok(Box::pin(stream::iter(chunks))),
                MockResponse::Stalled(chunks) => {
                    let body = stream::iter(chunks.into_iter().map(Ok::<Bytes, GenerationError>))
                        .chain(stream::pending());
                    return Ok(Box::pin(body));
                }
                MockResponse::Live(rx) => return Ok(Box::pin(ReceiverStream::new(rx))),
                MockResponse::Error(e) => return Err(e),
                MockResponse::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    response = *inner;
                }
            }
        }
    }
}
