//! In-process cache server for tests and local development
//!
//! [`InMemoryCas`] answers both services from [`SimpleBlobStore`]s with the
//! same statuses a remote server would send, so the batching engines and the
//! cache client run unchanged against it.

use crate::client::transport::{
    CasTransport, DownloadStream, ExecutionCacheTransport, UPLOAD_CHANNEL_CAPACITY, UploadCall,
    UploadEndpoint, await_upload_replies,
};
use crate::error::{RemoteError, Result};
use crate::mapper::{digest_from_proto, digest_to_proto};
use crate::merkle::Digest;
use crate::proto::{
    self, BlobChunk, CasDownloadBlobRequest, CasDownloadReply, CasLookupReply, CasLookupRequest,
    CasStatus, CasUploadBlobReply, CasUploadBlobRequest, CasUploadTreeMetadataReply,
    CasUploadTreeMetadataRequest, ExecutionCacheReply, ExecutionCacheRequest,
    ExecutionCacheSetReply, ExecutionCacheSetRequest, ExecutionCacheStatus, cas_status,
    execution_cache_status,
};
use crate::store::{ConcurrentMapBlobStore, SimpleBlobStore};
use async_trait::async_trait;
use futures::StreamExt;
use prost::Message;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Call counters of an [`InMemoryCas`]
#[derive(Debug, Default)]
pub struct LoopbackStats {
    lookups: AtomicUsize,
    upload_calls: AtomicUsize,
    chunks_received: AtomicUsize,
    downloads: AtomicUsize,
}

impl LoopbackStats {
    /// Missing-digest lookups served
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Streaming upload calls opened
    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    /// Chunks received over all upload calls
    pub fn chunks_received(&self) -> usize {
        self.chunks_received.load(Ordering::SeqCst)
    }

    /// Download calls served
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

/// Loopback implementation of both cache services
pub struct InMemoryCas {
    blobs: Arc<dyn SimpleBlobStore>,
    results: Arc<dyn SimpleBlobStore>,
    chunk_size: usize,
    accept_results: bool,
    stats: Arc<LoopbackStats>,
}

impl Default for InMemoryCas {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCas {
    /// Empty server backed by [`ConcurrentMapBlobStore`]s
    pub fn new() -> Self {
        Self::with_stores(
            Arc::new(ConcurrentMapBlobStore::new()),
            Arc::new(ConcurrentMapBlobStore::new()),
        )
    }

    /// Server over caller-provided stores for blobs and action results
    pub fn with_stores(blobs: Arc<dyn SimpleBlobStore>, results: Arc<dyn SimpleBlobStore>) -> Self {
        Self {
            blobs,
            results,
            chunk_size: crate::chunker::DEFAULT_CHUNK_SIZE,
            accept_results: true,
            stats: Arc::new(LoopbackStats::default()),
        }
    }

    /// Chunk size used for download replies
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Answer result writes with an "unsupported" status, like a read-only
    /// backend
    pub fn read_only_results(mut self) -> Self {
        self.accept_results = false;
        self
    }

    /// Call counters for this server
    pub fn stats(&self) -> &LoopbackStats {
        &self.stats
    }

    /// Whether the blob store holds `digest`
    pub fn contains(&self, digest: &Digest) -> bool {
        self.blobs.contains_key(&digest.hash())
    }

    /// Store a blob directly, bypassing the upload protocol
    pub fn insert(&self, data: impl Into<Vec<u8>>) -> Digest {
        let data = data.into();
        let digest = Digest::from_bytes(&data);
        self.blobs.put(digest.hash(), data);
        digest
    }

    fn download_replies(&self, requested: &[proto::ContentDigest]) -> Vec<CasDownloadReply> {
        let mut replies = Vec::new();
        for wanted in requested {
            let blob = digest_from_proto(wanted)
                .ok()
                .and_then(|digest| self.blobs.get(&digest.hash()).map(|blob| (digest, blob)));
            let Some((digest, blob)) = blob else {
                let mut status = CasStatus::failed(
                    cas_status::ErrorCode::MissingDigest,
                    "requested blob is not stored",
                );
                status.missing_digest.push(wanted.clone());
                replies.push(CasDownloadReply {
                    status: Some(status),
                    data: None,
                });
                break;
            };

            let mut offset = 0;
            loop {
                let end = (offset + self.chunk_size).min(blob.len());
                replies.push(CasDownloadReply {
                    status: None,
                    data: Some(BlobChunk {
                        digest: (offset == 0).then(|| digest_to_proto(&digest)),
                        offset: offset as i64,
                        data: blob[offset..end].to_vec(),
                    }),
                });
                offset = end;
                if offset >= blob.len() {
                    break;
                }
            }
        }
        replies
    }
}

#[async_trait]
impl CasTransport for InMemoryCas {
    async fn lookup(&self, request: CasLookupRequest) -> Result<CasLookupReply> {
        self.stats.lookups.fetch_add(1, Ordering::SeqCst);

        let mut missing = Vec::new();
        for wanted in request.digest {
            let stored = digest_from_proto(&wanted)
                .map(|digest| self.blobs.contains_key(&digest.hash()))
                .unwrap_or(false);
            if !stored {
                missing.push(wanted);
            }
        }

        let status = if missing.is_empty() {
            CasStatus::ok()
        } else {
            CasStatus {
                missing_digest: missing,
                ..CasStatus::failed(cas_status::ErrorCode::MissingDigest, "")
            }
        };
        Ok(CasLookupReply {
            status: Some(status),
        })
    }

    async fn upload_tree_metadata(
        &self,
        request: CasUploadTreeMetadataRequest,
    ) -> Result<CasUploadTreeMetadataReply> {
        for node in request.tree_node {
            let encoded = node.encode_to_vec();
            let digest = Digest::from_bytes(&encoded);
            self.blobs.put(digest.hash(), encoded);
        }
        Ok(CasUploadTreeMetadataReply {
            status: Some(CasStatus::ok()),
        })
    }

    fn upload_blob(&self) -> Result<UploadCall> {
        self.stats.upload_calls.fetch_add(1, Ordering::SeqCst);
        let (call, endpoint) = UploadCall::open();
        let UploadEndpoint {
            requests,
            outcome,
            cancel,
        } = endpoint;
        let (replies_tx, replies_rx) = mpsc::channel(UPLOAD_CHANNEL_CAPACITY);
        tokio::spawn(serve_upload(
            requests,
            replies_tx,
            Arc::clone(&self.blobs),
            Arc::clone(&self.stats),
        ));

        tokio::spawn(async move {
            let replies = ReceiverStream::new(replies_rx).map(Ok::<_, RemoteError>);
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Upload call cancelled by client");
                    return;
                }
                result = await_upload_replies(replies) => result,
            };
            if let Err(e) = &result {
                warn!(error = %e, "Rejected upload call");
            }
            let _ = outcome.send(result);
        });

        Ok(call)
    }

    async fn download_blob(&self, request: CasDownloadBlobRequest) -> Result<DownloadStream> {
        self.stats.downloads.fetch_add(1, Ordering::SeqCst);
        let replies = self.download_replies(&request.digest);
        Ok(futures::stream::iter(replies.into_iter().map(Ok)).boxed())
    }
}

/// Server side of one upload call: answer every chunk with a status and
/// stop at the first rejection
async fn serve_upload(
    mut requests: mpsc::Receiver<CasUploadBlobRequest>,
    replies: mpsc::Sender<CasUploadBlobReply>,
    store: Arc<dyn SimpleBlobStore>,
    stats: Arc<LoopbackStats>,
) {
    let mut assembly = BlobAssembly::default();

    while let Some(request) = requests.recv().await {
        let Some(chunk) = request.data else {
            continue;
        };
        stats.chunks_received.fetch_add(1, Ordering::SeqCst);

        let status = match assembly.accept(chunk, store.as_ref()) {
            Ok(()) => CasStatus::ok(),
            Err(rejection) => rejection,
        };
        let rejected = !status.succeeded;
        let sent = replies
            .send(CasUploadBlobReply {
                status: Some(status),
            })
            .await;
        if rejected || sent.is_err() {
            return;
        }
    }

    if let Some(digest) = assembly.open_digest() {
        let _ = replies
            .send(CasUploadBlobReply {
                status: Some(invalid(format!("call completed inside {digest}"))),
            })
            .await;
    }
}

/// Demultiplexes the chunks of one upload call into blobs, verifying each
/// before storing it
#[derive(Default)]
struct BlobAssembly {
    current: Option<(Digest, Vec<u8>)>,
}

impl BlobAssembly {
    fn open_digest(&self) -> Option<Digest> {
        self.current.as_ref().map(|(digest, _)| *digest)
    }

    fn accept(
        &mut self,
        chunk: BlobChunk,
        store: &dyn SimpleBlobStore,
    ) -> std::result::Result<(), CasStatus> {
        let open = self
            .current
            .as_ref()
            .map(|(digest, buffer)| (*digest, buffer.len()));
        match (chunk.digest, open) {
            (Some(header), None) => {
                let digest = digest_from_proto(&header).map_err(|e| invalid(e.to_string()))?;
                if chunk.offset != 0 {
                    return Err(invalid(format!("{digest} starts at offset {}", chunk.offset)));
                }
                self.current = Some((digest, Vec::new()));
            }
            (None, Some((digest, assembled))) => {
                if chunk.offset != assembled as i64 {
                    return Err(invalid(format!(
                        "{digest} continues at offset {} after {assembled} bytes",
                        chunk.offset
                    )));
                }
            }
            (Some(_), Some((digest, _))) => {
                return Err(invalid(format!("new blob started inside {digest}")));
            }
            (None, None) => return Err(invalid("continuation chunk without a blob header")),
        }
        let Some((digest, buffer)) = self.current.as_mut() else {
            return Ok(());
        };
        let digest = *digest;

        buffer.extend_from_slice(&chunk.data);
        let size = digest.size_bytes() as usize;
        if buffer.len() > size {
            return Err(invalid(format!("more than {size} bytes sent for {digest}")));
        }
        if buffer.len() == size {
            let buffer = std::mem::take(buffer);
            self.current = None;
            if Digest::from_bytes(&buffer) != digest {
                return Err(CasStatus::failed(
                    cas_status::ErrorCode::DigestMismatch,
                    format!("digest mismatch for {digest}"),
                ));
            }
            store.put(digest.hash(), buffer);
        }
        Ok(())
    }
}

fn invalid(detail: impl Into<String>) -> CasStatus {
    CasStatus::failed(cas_status::ErrorCode::InvalidArgument, detail)
}

#[async_trait]
impl ExecutionCacheTransport for InMemoryCas {
    async fn get_cached_result(
        &self,
        request: ExecutionCacheRequest,
    ) -> Result<ExecutionCacheReply> {
        let key = match request.action_digest.as_ref().map(digest_from_proto) {
            Some(Ok(digest)) => digest.hash(),
            _ => {
                return Ok(ExecutionCacheReply {
                    status: Some(ExecutionCacheStatus::failed(
                        execution_cache_status::ErrorCode::Unknown,
                        "request carries no valid action digest",
                    )),
                    result: None,
                });
            }
        };

        let reply = match self.results.get(&key) {
            None => ExecutionCacheReply {
                status: Some(ExecutionCacheStatus::failed(
                    execution_cache_status::ErrorCode::MissingResult,
                    "no result recorded",
                )),
                result: None,
            },
            Some(stored) => match proto::ActionResult::decode(stored.as_ref()) {
                Ok(result) => ExecutionCacheReply {
                    status: Some(ExecutionCacheStatus::ok()),
                    result: Some(result),
                },
                Err(e) => ExecutionCacheReply {
                    status: Some(ExecutionCacheStatus::failed(
                        execution_cache_status::ErrorCode::Unknown,
                        format!("stored result is corrupt: {e}"),
                    )),
                    result: None,
                },
            },
        };
        Ok(reply)
    }

    async fn set_cached_result(
        &self,
        request: ExecutionCacheSetRequest,
    ) -> Result<ExecutionCacheSetReply> {
        if !self.accept_results {
            return Ok(ExecutionCacheSetReply {
                status: Some(ExecutionCacheStatus::failed(
                    execution_cache_status::ErrorCode::Unsupported,
                    "result writes are disabled",
                )),
            });
        }

        let status = match (request.action_digest.as_ref().map(digest_from_proto), request.result) {
            (Some(Ok(digest)), Some(result)) => {
                self.results.put(digest.hash(), result.encode_to_vec());
                ExecutionCacheStatus::ok()
            }
            _ => ExecutionCacheStatus::failed(
                execution_cache_status::ErrorCode::Unknown,
                "request needs an action digest and a result",
            ),
        };
        Ok(ExecutionCacheSetReply {
            status: Some(status),
        })
    }
}
