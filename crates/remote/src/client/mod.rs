//! Transports for the cache services: gRPC and an in-process loopback

pub mod channel;
pub mod grpc;
pub mod memory;
pub mod transport;

pub use channel::{AuthInterceptor, GrpcChannel};
pub use grpc::{CasServiceClient, ExecutionCacheServiceClient, GrpcTransport};
pub use memory::{InMemoryCas, LoopbackStats};
pub use transport::{
    CasTransport, DownloadStream, ExecutionCacheTransport, PendingBatch, UPLOAD_CHANNEL_CAPACITY,
    UploadCall, UploadEndpoint,
};
