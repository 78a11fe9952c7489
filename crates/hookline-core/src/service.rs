use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::errors::GenerationError;
use crate::request::GenerationBody;

/// Raw response body of a generation call, chunk by chunk, in arrival order.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, GenerationError>> + Send>>;

/// An external content-generation service.
///
/// `open` resolves once the response headers arrive; a non-success status is
/// returned as an error before any body is read.
#[async_trait]
pub trait GenerationService: Send + Sync {
    fn name(&self) -> &str;

    async fn open(&self, body: &GenerationBody) -> Result<ByteStream, GenerationError>;
}
