//! gRPC service clients for `remote_cache.v1`
//!
//! The stubs follow the shape of tonic's generated clients: a cloneable
//! wrapper around [`tonic::client::Grpc`] with one method per RPC.

use crate::client::channel::{AuthInterceptor, GrpcChannel};
use crate::client::transport::{
    CasTransport, DownloadStream, ExecutionCacheTransport, UploadCall, UploadEndpoint,
    await_upload_replies,
};
use crate::error::{RemoteError, Result};
use crate::proto::{
    CasDownloadBlobRequest, CasDownloadReply, CasLookupReply, CasLookupRequest,
    CasUploadBlobReply, CasUploadBlobRequest, CasUploadTreeMetadataReply,
    CasUploadTreeMetadataRequest, ExecutionCacheReply, ExecutionCacheRequest,
    ExecutionCacheSetReply, ExecutionCacheSetRequest,
};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::client::Grpc;
use tonic::codec::{ProstCodec, Streaming};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::codegen::{InterceptedService, StdError};
use tonic::transport::Channel;
use tonic::{IntoRequest, IntoStreamingRequest, Response, Status};
use tracing::{debug, instrument, warn};

type AuthedChannel = InterceptedService<Channel, AuthInterceptor>;

async fn ready(inner: &mut Grpc<AuthedChannel>) -> std::result::Result<(), Status> {
    inner.ready().await.map_err(|e| {
        let e: StdError = e.into();
        Status::unknown(format!("Service was not ready: {e}"))
    })
}

/// Client for `remote_cache.v1.CasService`
#[derive(Clone)]
pub struct CasServiceClient {
    inner: Grpc<AuthedChannel>,
}

impl CasServiceClient {
    /// Wrap `channel`, attaching credentials through `interceptor`
    pub fn new(channel: Channel, interceptor: AuthInterceptor) -> Self {
        Self {
            inner: Grpc::new(InterceptedService::new(channel, interceptor)),
        }
    }

    /// Ask which digests the store lacks
    pub async fn lookup(
        &mut self,
        request: impl IntoRequest<CasLookupRequest>,
    ) -> std::result::Result<Response<CasLookupReply>, Status> {
        ready(&mut self.inner).await?;
        let path = PathAndQuery::from_static("/remote_cache.v1.CasService/Lookup");
        self.inner
            .unary(request.into_request(), path, ProstCodec::default())
            .await
    }

    /// Record Merkle tree nodes
    pub async fn upload_tree_metadata(
        &mut self,
        request: impl IntoRequest<CasUploadTreeMetadataRequest>,
    ) -> std::result::Result<Response<CasUploadTreeMetadataReply>, Status> {
        ready(&mut self.inner).await?;
        let path = PathAndQuery::from_static("/remote_cache.v1.CasService/UploadTreeMetadata");
        self.inner
            .unary(request.into_request(), path, ProstCodec::default())
            .await
    }

    /// Bidirectional upload of chunks; the server answers every chunk with
    /// a status
    pub async fn upload_blob(
        &mut self,
        request: impl IntoStreamingRequest<Message = CasUploadBlobRequest>,
    ) -> std::result::Result<Response<Streaming<CasUploadBlobReply>>, Status> {
        ready(&mut self.inner).await?;
        let path = PathAndQuery::from_static("/remote_cache.v1.CasService/UploadBlob");
        self.inner
            .streaming(request.into_streaming_request(), path, ProstCodec::default())
            .await
    }

    /// Server-streaming download of the requested digests
    pub async fn download_blob(
        &mut self,
        request: impl IntoRequest<CasDownloadBlobRequest>,
    ) -> std::result::Result<Response<Streaming<CasDownloadReply>>, Status> {
        ready(&mut self.inner).await?;
        let path = PathAndQuery::from_static("/remote_cache.v1.CasService/DownloadBlob");
        self.inner
            .server_streaming(request.into_request(), path, ProstCodec::default())
            .await
    }
}

/// Client for `remote_cache.v1.ExecutionCacheService`
#[derive(Clone)]
pub struct ExecutionCacheServiceClient {
    inner: Grpc<AuthedChannel>,
}

impl ExecutionCacheServiceClient {
    /// Wrap `channel`, attaching credentials through `interceptor`
    pub fn new(channel: Channel, interceptor: AuthInterceptor) -> Self {
        Self {
            inner: Grpc::new(InterceptedService::new(channel, interceptor)),
        }
    }

    /// Fetch the result recorded for an action
    pub async fn get_cached_result(
        &mut self,
        request: impl IntoRequest<ExecutionCacheRequest>,
    ) -> std::result::Result<Response<ExecutionCacheReply>, Status> {
        ready(&mut self.inner).await?;
        let path =
            PathAndQuery::from_static("/remote_cache.v1.ExecutionCacheService/GetCachedResult");
        self.inner
            .unary(request.into_request(), path, ProstCodec::default())
            .await
    }

    /// Record the result of an action
    pub async fn set_cached_result(
        &mut self,
        request: impl IntoRequest<ExecutionCacheSetRequest>,
    ) -> std::result::Result<Response<ExecutionCacheSetReply>, Status> {
        ready(&mut self.inner).await?;
        let path =
            PathAndQuery::from_static("/remote_cache.v1.ExecutionCacheService/SetCachedResult");
        self.inner
            .unary(request.into_request(), path, ProstCodec::default())
            .await
    }
}

/// Both cache services over one gRPC channel
#[derive(Clone)]
pub struct GrpcTransport {
    cas: CasServiceClient,
    execution_cache: ExecutionCacheServiceClient,
}

impl GrpcTransport {
    /// Create service clients from a shared channel
    pub fn from_channel(channel: &GrpcChannel) -> Self {
        Self {
            cas: CasServiceClient::new(channel.channel(), channel.auth_interceptor()),
            execution_cache: ExecutionCacheServiceClient::new(
                channel.channel(),
                channel.auth_interceptor(),
            ),
        }
    }
}

/// Run one upload call to completion: stream the requests and fold the
/// per-chunk replies into the batch outcome
async fn drive_upload(
    client: &mut CasServiceClient,
    requests: mpsc::Receiver<CasUploadBlobRequest>,
) -> Result<()> {
    let replies = client
        .upload_blob(ReceiverStream::new(requests))
        .await
        .map_err(|e| RemoteError::grpc("CasService.UploadBlob", e))?
        .into_inner()
        .map(|reply| reply.map_err(|e| RemoteError::grpc("CasService.UploadBlob", e)));
    await_upload_replies(replies).await
}

#[async_trait]
impl CasTransport for GrpcTransport {
    #[instrument(skip_all, fields(digests = request.digest.len()))]
    async fn lookup(&self, request: CasLookupRequest) -> Result<CasLookupReply> {
        let mut client = self.cas.clone();
        client
            .lookup(request)
            .await
            .map(Response::into_inner)
            .map_err(|e| RemoteError::grpc("CasService.Lookup", e))
    }

    #[instrument(skip_all, fields(nodes = request.tree_node.len()))]
    async fn upload_tree_metadata(
        &self,
        request: CasUploadTreeMetadataRequest,
    ) -> Result<CasUploadTreeMetadataReply> {
        let mut client = self.cas.clone();
        client
            .upload_tree_metadata(request)
            .await
            .map(Response::into_inner)
            .map_err(|e| RemoteError::grpc("CasService.UploadTreeMetadata", e))
    }

    fn upload_blob(&self) -> Result<UploadCall> {
        let (call, endpoint) = UploadCall::open();
        let UploadEndpoint {
            requests,
            outcome,
            cancel,
        } = endpoint;
        let mut client = self.cas.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                // Dropping the call future resets the HTTP/2 stream
                _ = cancel.cancelled() => {
                    debug!("Upload call cancelled");
                    return;
                }
                result = drive_upload(&mut client, requests) => result,
            };
            if let Err(e) = &result {
                warn!(error = %e, "Upload call failed");
            }
            let _ = outcome.send(result);
        });

        Ok(call)
    }

    #[instrument(skip_all, fields(digests = request.digest.len()))]
    async fn download_blob(&self, request: CasDownloadBlobRequest) -> Result<DownloadStream> {
        let mut client = self.cas.clone();
        let replies = client
            .download_blob(request)
            .await
            .map_err(|e| RemoteError::grpc("CasService.DownloadBlob", e))?
            .into_inner();
        Ok(replies
            .map(|reply| reply.map_err(|e| RemoteError::grpc("CasService.DownloadBlob", e)))
            .boxed())
    }
}

#[async_trait]
impl ExecutionCacheTransport for GrpcTransport {
    async fn get_cached_result(
        &self,
        request: ExecutionCacheRequest,
    ) -> Result<ExecutionCacheReply> {
        let mut client = self.execution_cache.clone();
        client
            .get_cached_result(request)
            .await
            .map(Response::into_inner)
            .map_err(|e| RemoteError::grpc("ExecutionCacheService.GetCachedResult", e))
    }

    async fn set_cached_result(
        &self,
        request: ExecutionCacheSetRequest,
    ) -> Result<ExecutionCacheSetReply> {
        let mut client = self.execution_cache.clone();
        client
            .set_cached_result(request)
            .await
            .map(Response::into_inner)
            .map_err(|e| RemoteError::grpc("ExecutionCacheService.SetCachedResult", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteConfig;

    #[tokio::test]
    async fn test_unreachable_server_is_grpc_error() {
        let config = RemoteConfig {
            timeout_secs: 5,
            ..RemoteConfig::new("grpc://127.0.0.1:1")
        };
        let channel = GrpcChannel::connect_lazy(&config).unwrap();
        let transport = GrpcTransport::from_channel(&channel);

        let err = transport
            .lookup(CasLookupRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Grpc { .. }));
    }

    #[tokio::test]
    async fn test_upload_to_unreachable_server_fails_the_batch() {
        let config = RemoteConfig {
            timeout_secs: 5,
            ..RemoteConfig::new("grpc://127.0.0.1:1")
        };
        let channel = GrpcChannel::connect_lazy(&config).unwrap();
        let transport = GrpcTransport::from_channel(&channel);

        let call = transport.upload_blob().unwrap();
        let err = call.finish().wait().await.unwrap_err();
        assert!(matches!(err, RemoteError::Grpc { .. }));
    }
}
