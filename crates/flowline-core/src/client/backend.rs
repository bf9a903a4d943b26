use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;

use crate::error::TransportError;
use crate::workflow::schema::WorkflowExecutionRequest;

/// Chunked response body of one execution attempt.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Something that can submit a workflow and hand back its event stream.
///
/// [`HttpBackend`](super::HttpBackend) talks to the real service; tests
/// script their own streams.
pub trait WorkflowBackend: Send + Sync + 'static {
    /// Submit `request` to `runner`. An `Err` means no stream was opened;
    /// non-success HTTP responses map to [`TransportError::Status`].
    fn execute(
        &self,
        request: &WorkflowExecutionRequest,
        runner: &str,
    ) -> impl Future<Output = Result<ByteStream, TransportError>> + Send;
}
