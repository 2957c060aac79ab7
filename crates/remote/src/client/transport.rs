//! Transport seam between the batching engines and the wire
//!
//! Each upload batch is one [`UploadCall`]: the engine pushes requests into a
//! bounded channel and later awaits a single completion outcome. The server
//! answers every chunk with a status; [`await_upload_replies`] folds those
//! replies into the outcome. Cancellation is an explicit token rather than a
//! callback.

use crate::error::{RemoteError, Result};
use crate::proto::{
    CasDownloadBlobRequest, CasDownloadReply, CasLookupReply, CasLookupRequest,
    CasUploadBlobReply, CasUploadBlobRequest, CasUploadTreeMetadataReply, CasUploadTreeMetadataRequest,
    ExecutionCacheReply, ExecutionCacheRequest, ExecutionCacheSetReply, ExecutionCacheSetRequest,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const UPLOAD_OPERATION: &str = "CasService.UploadBlob";

/// Requests buffered per upload call before the sender waits
pub const UPLOAD_CHANNEL_CAPACITY: usize = 16;

/// Reply stream of a download call
pub type DownloadStream = BoxStream<'static, Result<CasDownloadReply>>;

/// Client side of one streaming upload call
pub struct UploadCall {
    requests: mpsc::Sender<CasUploadBlobRequest>,
    outcome: oneshot::Receiver<Result<()>>,
    cancel: CancellationToken,
}

/// Transport side of one streaming upload call
pub struct UploadEndpoint {
    /// Requests written by the engine; closes when the engine finishes
    pub requests: mpsc::Receiver<CasUploadBlobRequest>,
    /// Completion of the call, sent exactly once
    pub outcome: oneshot::Sender<Result<()>>,
    /// Fires when the engine aborts the call
    pub cancel: CancellationToken,
}

impl UploadCall {
    /// Create a connected call/endpoint pair
    pub fn open() -> (Self, UploadEndpoint) {
        let (requests_tx, requests_rx) = mpsc::channel(UPLOAD_CHANNEL_CAPACITY);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        (
            Self {
                requests: requests_tx,
                outcome: outcome_rx,
                cancel: cancel.clone(),
            },
            UploadEndpoint {
                requests: requests_rx,
                outcome: outcome_tx,
                cancel,
            },
        )
    }

    /// Send one request. Fails if the call already completed, since a call
    /// must not finish before the engine finished feeding it.
    pub async fn send(&mut self, request: CasUploadBlobRequest) -> Result<()> {
        self.ensure_open()?;
        if self.requests.send(request).await.is_err() {
            self.ensure_open()?;
            return Err(premature_end("request stream closed"));
        }
        self.ensure_open()
    }

    fn ensure_open(&mut self) -> Result<()> {
        let cause = match self.outcome.try_recv() {
            Err(oneshot::error::TryRecvError::Empty) => return Ok(()),
            Ok(Ok(())) => "server completed the call".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(oneshot::error::TryRecvError::Closed) => "unknown cause".to_string(),
        };
        Err(premature_end(cause))
    }

    /// Half-close the request stream; the returned batch resolves when the
    /// server completes the call
    pub fn finish(self) -> PendingBatch {
        drop(self.requests);
        PendingBatch {
            outcome: self.outcome,
            cancel: self.cancel,
        }
    }

    /// Abort the call so the server does not keep a dangling stream
    pub fn cancel(self) {
        self.cancel.cancel();
    }
}

fn premature_end(cause: impl std::fmt::Display) -> RemoteError {
    RemoteError::protocol_violation(format!("upload stream terminated prematurely: {cause}"))
}

/// An upload batch whose requests are all sent
pub struct PendingBatch {
    outcome: oneshot::Receiver<Result<()>>,
    cancel: CancellationToken,
}

impl PendingBatch {
    /// Token that aborts this batch
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the call to complete
    pub async fn wait(self) -> Result<()> {
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RemoteError::protocol_violation(
                "upload stream ended without a completion status",
            )),
        }
    }
}

/// Resolve an upload call from its per-chunk status replies.
///
/// The first failed status fails the call at once, before the server closes
/// the stream. The call succeeds only when the reply stream ends with every
/// status OK.
pub async fn await_upload_replies<S>(replies: S) -> Result<()>
where
    S: Stream<Item = Result<CasUploadBlobReply>>,
{
    let mut replies = std::pin::pin!(replies);
    let mut acknowledged = 0usize;
    while let Some(reply) = replies.next().await {
        match reply?.status {
            Some(status) if status.succeeded => acknowledged += 1,
            Some(status) => {
                return Err(RemoteError::remote_failure(
                    UPLOAD_OPERATION,
                    format!("{:?}: {}", status.error(), status.error_detail),
                ));
            }
            None => {
                return Err(RemoteError::protocol_violation(
                    "upload reply carries no status",
                ));
            }
        }
    }
    debug!(acknowledged, "Upload call completed");
    Ok(())
}

/// The content-addressable storage service
#[async_trait]
pub trait CasTransport: Send + Sync {
    /// Ask which digests the store lacks
    async fn lookup(&self, request: CasLookupRequest) -> Result<CasLookupReply>;

    /// Upload Merkle tree directory nodes
    async fn upload_tree_metadata(
        &self,
        request: CasUploadTreeMetadataRequest,
    ) -> Result<CasUploadTreeMetadataReply>;

    /// Open one bidirectional upload call
    fn upload_blob(&self) -> Result<UploadCall>;

    /// Start a streaming download of the requested digests
    async fn download_blob(&self, request: CasDownloadBlobRequest) -> Result<DownloadStream>;
}

/// The execution result cache service
#[async_trait]
pub trait ExecutionCacheTransport: Send + Sync {
    /// Fetch the cached result of an action
    async fn get_cached_result(&self, request: ExecutionCacheRequest)
    -> Result<ExecutionCacheReply>;

    /// Record the result of an action
    async fn set_cached_result(
        &self,
        request: ExecutionCacheSetRequest,
    ) -> Result<ExecutionCacheSetReply>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{CasStatus, cas_status::ErrorCode};

    #[tokio::test]
    async fn test_send_after_completion_is_protocol_violation() {
        let (mut call, endpoint) = UploadCall::open();
        endpoint
            .outcome
            .send(Err(RemoteError::remote_failure("upload", "disk full")))
            .ok();

        let err = call.send(CasUploadBlobRequest::default()).await.unwrap_err();
        assert!(matches!(err, RemoteError::ProtocolViolation { .. }));
        assert!(err.to_string().contains("disk full"));
    }

    #[tokio::test]
    async fn test_finish_resolves_with_endpoint_outcome() {
        let (mut call, mut endpoint) = UploadCall::open();
        call.send(CasUploadBlobRequest::default()).await.unwrap();
        let pending = call.finish();

        assert!(endpoint.requests.recv().await.is_some());
        assert!(endpoint.requests.recv().await.is_none());
        endpoint.outcome.send(Ok(())).ok();

        pending.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_fires_token() {
        let (call, endpoint) = UploadCall::open();
        call.cancel();
        assert!(endpoint.cancel.is_cancelled());
    }

    fn reply(status: Option<CasStatus>) -> Result<CasUploadBlobReply> {
        Ok(CasUploadBlobReply { status })
    }

    #[tokio::test]
    async fn test_all_ok_replies_succeed() {
        let replies = futures::stream::iter(vec![
            reply(Some(CasStatus::ok())),
            reply(Some(CasStatus::ok())),
        ]);
        await_upload_replies(replies).await.unwrap();
        await_upload_replies(futures::stream::empty()).await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_after_accepted_chunk_fails_the_call() {
        let replies = futures::stream::iter(vec![
            reply(Some(CasStatus::ok())),
            reply(Some(CasStatus::failed(ErrorCode::Unknown, "disk full on chunk 2"))),
            reply(Some(CasStatus::ok())),
        ]);
        let err = await_upload_replies(replies).await.unwrap_err();
        assert!(matches!(err, RemoteError::RemoteFailure { .. }));
        assert!(err.to_string().contains("disk full on chunk 2"));
    }

    #[tokio::test]
    async fn test_failure_status_ends_the_call_before_the_stream_closes() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(reply(Some(CasStatus::failed(ErrorCode::DigestMismatch, "bad bytes"))))
            .await
            .unwrap();
        // `tx` stays open: the failure alone must resolve the call
        let err = await_upload_replies(tokio_stream::wrappers::ReceiverStream::new(rx))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad bytes"));
        drop(tx);
    }

    #[tokio::test]
    async fn test_reply_without_status_or_transport_error() {
        let err = await_upload_replies(futures::stream::iter(vec![reply(None)]))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::ProtocolViolation { .. }));

        let broken = futures::stream::iter(vec![
            reply(Some(CasStatus::ok())),
            Err(RemoteError::grpc(
                UPLOAD_OPERATION,
                tonic::Status::unavailable("reset"),
            )),
        ]);
        let err = await_upload_replies(broken).await.unwrap_err();
        assert!(matches!(err, RemoteError::Grpc { .. }));
    }

    #[tokio::test]
    async fn test_dropped_endpoint_is_reported() {
        let (call, endpoint) = UploadCall::open();
        drop(endpoint);
        let err = call.finish().wait().await.unwrap_err();
        assert!(matches!(err, RemoteError::ProtocolViolation { .. }));
    }
}
