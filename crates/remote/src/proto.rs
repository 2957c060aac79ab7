//! Wire messages of the remote cache protocol (package `remote_cache.v1`).
//!
//! Declared with prost derives so the crate builds without `protoc`.

/// Digest of a blob: raw hash bytes plus length.
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct ContentDigest {
    /// Raw SHA-256 bytes
    #[prost(bytes = "vec", tag = "1")]
    pub digest: ::prost::alloc::vec::Vec<u8>,
    #[prost(int64, tag = "2")]
    pub size_bytes: i64,
}

/// Content and mode of a file leaf.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileMetadata {
    #[prost(message, optional, tag = "1")]
    pub digest: ::core::option::Option<ContentDigest>,
    #[prost(bool, tag = "3")]
    pub executable: bool,
}

/// A Merkle tree node. Directories list their children; leaves carry file
/// metadata.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileNode {
    #[prost(message, optional, tag = "1")]
    pub file_metadata: ::core::option::Option<FileMetadata>,
    #[prost(message, repeated, tag = "2")]
    pub child: ::prost::alloc::vec::Vec<file_node::Child>,
}

/// Nested types of [`FileNode`].
pub mod file_node {
    /// A named entry of a directory node.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Child {
        #[prost(string, tag = "1")]
        pub path: ::prost::alloc::string::String,
        #[prost(message, optional, tag = "2")]
        pub digest: ::core::option::Option<super::ContentDigest>,
    }
}

/// A slice of a blob. Only the first chunk of a blob carries its digest.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlobChunk {
    #[prost(message, optional, tag = "1")]
    pub digest: ::core::option::Option<ContentDigest>,
    #[prost(int64, tag = "2")]
    pub offset: i64,
    #[prost(bytes = "vec", tag = "3")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

/// Outcome of a CAS call, or of one uploaded chunk.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CasStatus {
    #[prost(bool, tag = "1")]
    pub succeeded: bool,
    #[prost(enumeration = "cas_status::ErrorCode", tag = "2")]
    pub error: i32,
    #[prost(string, tag = "3")]
    pub error_detail: ::prost::alloc::string::String,
    /// Digests the store lacks, filled by lookups
    #[prost(message, repeated, tag = "4")]
    pub missing_digest: ::prost::alloc::vec::Vec<ContentDigest>,
}

/// Nested types of [`CasStatus`].
pub mod cas_status {
    /// Failure class of a [`super::CasStatus`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum ErrorCode {
        Unknown = 0,
        InvalidArgument = 1,
        MissingDigest = 2,
        DigestMismatch = 3,
        NodeParseError = 4,
    }
}

/// Asks which of the listed digests the store lacks.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CasLookupRequest {
    #[prost(message, repeated, tag = "1")]
    pub digest: ::prost::alloc::vec::Vec<ContentDigest>,
}

/// Lookup answer; missing digests ride in the status.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CasLookupReply {
    #[prost(message, optional, tag = "1")]
    pub status: ::core::option::Option<CasStatus>,
}

/// Tree nodes to record in the store.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CasUploadTreeMetadataRequest {
    #[prost(message, repeated, tag = "1")]
    pub tree_node: ::prost::alloc::vec::Vec<FileNode>,
}

/// Answer to a tree node upload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CasUploadTreeMetadataReply {
    #[prost(message, optional, tag = "1")]
    pub status: ::core::option::Option<CasStatus>,
}

/// One chunk on the request half of an upload call.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CasUploadBlobRequest {
    #[prost(message, optional, tag = "1")]
    pub data: ::core::option::Option<BlobChunk>,
}

/// Status answering one uploaded chunk.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CasUploadBlobReply {
    #[prost(message, optional, tag = "1")]
    pub status: ::core::option::Option<CasStatus>,
}

/// Blobs to stream back, in order.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CasDownloadBlobRequest {
    #[prost(message, repeated, tag = "1")]
    pub digest: ::prost::alloc::vec::Vec<ContentDigest>,
}

/// One chunk of a download stream, or a status ending it.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CasDownloadReply {
    #[prost(message, optional, tag = "1")]
    pub status: ::core::option::Option<CasStatus>,
    #[prost(message, optional, tag = "2")]
    pub data: ::core::option::Option<BlobChunk>,
}

/// A file or directory produced by an action.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Output {
    #[prost(string, tag = "1")]
    pub path: ::prost::alloc::string::String,
    #[prost(oneof = "output::Content", tags = "2, 3")]
    pub content: ::core::option::Option<output::Content>,
}

/// Nested types of [`Output`].
pub mod output {
    /// What an output path holds.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Content {
        /// Root digest of an output directory tree
        #[prost(message, tag = "2")]
        Digest(super::ContentDigest),
        /// A single file
        #[prost(message, tag = "3")]
        FileMetadata(super::FileMetadata),
    }
}

/// Outputs and exit code recorded for an action.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActionResult {
    #[prost(message, repeated, tag = "1")]
    pub output: ::prost::alloc::vec::Vec<Output>,
    #[prost(int32, tag = "2")]
    pub return_code: i32,
}

/// Outcome of an execution cache call.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecutionCacheStatus {
    #[prost(bool, tag = "1")]
    pub succeeded: bool,
    #[prost(enumeration = "execution_cache_status::ErrorCode", tag = "2")]
    pub error: i32,
    #[prost(string, tag = "3")]
    pub error_detail: ::prost::alloc::string::String,
}

/// Nested types of [`ExecutionCacheStatus`].
pub mod execution_cache_status {
    /// Failure class of a [`super::ExecutionCacheStatus`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum ErrorCode {
        Unknown = 0,
        MissingResult = 1,
        Unsupported = 2,
    }
}

/// Fetches the result recorded for an action digest.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecutionCacheRequest {
    #[prost(message, optional, tag = "1")]
    pub action_digest: ::core::option::Option<ContentDigest>,
}

/// Recorded result, present when the status succeeded.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecutionCacheReply {
    #[prost(message, optional, tag = "1")]
    pub status: ::core::option::Option<ExecutionCacheStatus>,
    #[prost(message, optional, tag = "2")]
    pub result: ::core::option::Option<ActionResult>,
}

/// Records a result under an action digest.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecutionCacheSetRequest {
    #[prost(message, optional, tag = "1")]
    pub action_digest: ::core::option::Option<ContentDigest>,
    #[prost(message, optional, tag = "2")]
    pub result: ::core::option::Option<ActionResult>,
}

/// Answer to recording a result.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecutionCacheSetReply {
    #[prost(message, optional, tag = "1")]
    pub status: ::core::option::Option<ExecutionCacheStatus>,
}

impl CasStatus {
    /// A successful status
    pub fn ok() -> Self {
        Self {
            succeeded: true,
            ..Default::default()
        }
    }

    /// A failed status with the given code and detail
    pub fn failed(code: cas_status::ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            error: code as i32,
            error_detail: detail.into(),
            missing_digest: Vec::new(),
        }
    }
}

impl ExecutionCacheStatus {
    /// A successful status
    pub fn ok() -> Self {
        Self {
            succeeded: true,
            ..Default::default()
        }
    }

    /// A failed status with the given code and detail
    pub fn failed(code: execution_cache_status::ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            error: code as i32,
            error_detail: detail.into(),
        }
    }
}
