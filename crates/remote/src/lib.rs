//! Client for a remote content-addressable cache
//!
//! This crate stores build inputs and outputs in a remote content-addressable
//! store (CAS) and records action results in a remote execution cache, so a
//! build can skip actions another machine already ran.
//!
//! Blobs travel as fixed-size chunks over bidirectional upload calls, grouped
//! into batches bounded by input count and bytes; the server acknowledges
//! every chunk with a status. Downloads arrive on one server-streaming call
//! and are reassembled in request order.

pub mod action;
pub mod cache;
pub mod cas;
pub mod chunker;
pub mod client;
pub mod config;
pub mod error;
pub mod mapper;
pub mod merkle;
pub mod proto;
pub mod retry;
pub mod store;

pub use action::{ActionResult, FileMetadata, Output, OutputContent};
pub use cache::{RemoteActionCache, RemoteCacheClient};
pub use cas::{BatchLimits, MAX_BLOB_BYTES};
pub use chunker::{Chunk, Chunker, ChunkerBuilder, DEFAULT_CHUNK_SIZE};
pub use client::{CasTransport, ExecutionCacheTransport, GrpcTransport, InMemoryCas};
pub use config::{AuthConfig, RemoteConfig, RetryConfig, TlsConfig};
pub use error::{RemoteError, Result};
pub use merkle::{ActionInput, ActionKey, Digest};
pub use store::{ConcurrentMapBlobStore, SimpleBlobStore};
