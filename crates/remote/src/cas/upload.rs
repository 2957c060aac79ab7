//! Batched streaming upload of chunked blobs
//!
//! Chunks are grouped into as few streaming calls as the batch limits allow.
//! Batch boundaries are only placed at blob starts, so a blob's chunks always
//! travel on one stream in offset order.

use crate::chunker::Chunker;
use crate::client::{CasTransport, PendingBatch, UploadCall};
use crate::error::{RemoteError, Result};
use crate::proto::CasUploadBlobRequest;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Limits applied to every upload batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// Maximum number of blobs started in one batch
    pub max_inputs: usize,
    /// Maximum cumulative chunk bytes in one batch, unless a single blob is
    /// larger on its own
    pub max_bytes: u64,
}

/// Per-call batching state; lives only for one upload
#[derive(Default)]
struct BatchState {
    call: Option<UploadCall>,
    inputs: usize,
    bytes: u64,
}

impl BatchState {
    fn needs_new_batch(&self, blob_size: u64, limits: BatchLimits) -> bool {
        self.call.is_none()
            || self.inputs >= limits.max_inputs
            || self.bytes + blob_size > limits.max_bytes
    }

    fn start(&mut self, call: UploadCall) -> Option<PendingBatch> {
        self.inputs = 0;
        self.bytes = 0;
        self.call.replace(call).map(UploadCall::finish)
    }
}

/// Upload `num_items` blobs produced by `chunker`.
///
/// Every batch is awaited up to `timeout`. The first batch error observed is
/// returned; an elapsed timeout without a recorded error is itself an error.
/// A failure while feeding a batch cancels that batch's call.
#[instrument(skip(transport, chunker, limits), fields(max_inputs = limits.max_inputs, max_bytes = limits.max_bytes))]
pub async fn upload_chunks(
    transport: &dyn CasTransport,
    num_items: usize,
    chunker: &mut Chunker,
    limits: BatchLimits,
    timeout: Duration,
) -> Result<()> {
    let mut pending = Vec::with_capacity(num_items);
    let mut state = BatchState::default();

    if let Err(e) = fill_batches(transport, chunker, limits, &mut state, &mut pending).await {
        if let Some(call) = state.call.take() {
            warn!(error = %e, "Cancelling upload batch");
            call.cancel();
        }
        return Err(e);
    }
    if let Some(call) = state.call.take() {
        pending.push(call.finish());
    }

    debug!(batches = pending.len(), "All upload batches sent");
    await_batches(pending, timeout).await
}

async fn fill_batches(
    transport: &dyn CasTransport,
    chunker: &mut Chunker,
    limits: BatchLimits,
    state: &mut BatchState,
    pending: &mut Vec<PendingBatch>,
) -> Result<()> {
    while let Some(chunk) = chunker.next().await? {
        if let Some(digest) = &chunk.digest {
            let blob_size = digest.size_bytes() as u64;
            if state.needs_new_batch(blob_size, limits) {
                if let Some(full) = state.start(transport.upload_blob()?) {
                    pending.push(full);
                }
            }
            state.inputs += 1;
        }
        state.bytes += chunk.data.len() as u64;

        let call = state.call.as_mut().ok_or_else(|| {
            RemoteError::protocol_violation("chunk continuation without a blob header")
        })?;
        call.send(CasUploadBlobRequest {
            data: Some(chunk.into()),
        })
        .await?;
    }
    Ok(())
}

async fn await_batches(pending: Vec<PendingBatch>, timeout: Duration) -> Result<()> {
    let cancels: Vec<CancellationToken> = pending.iter().map(PendingBatch::cancel_token).collect();
    let mut outcomes: FuturesUnordered<_> = pending.into_iter().map(PendingBatch::wait).collect();
    let mut first_error = None;

    let drained = tokio::time::timeout(timeout, async {
        while let Some(outcome) = outcomes.next().await {
            if let Err(e) = outcome {
                warn!(error = %e, "Upload batch failed");
                first_error.get_or_insert(e);
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            outstanding = outcomes.len(),
            timeout_secs = timeout.as_secs(),
            "Timed out waiting for upload batches"
        );
        for token in &cancels {
            token.cancel();
        }
        return Err(first_error
            .unwrap_or_else(|| RemoteError::timeout("CasService.UploadBlob", timeout.as_secs())));
    }

    first_error.map_or(Ok(()), Err)
}
