//! Content-addressable storage engines: missing-digest lookup and batched
//! chunk upload/download

pub mod download;
pub mod missing;
pub mod upload;

pub use download::{MAX_BLOB_BYTES, download_blobs};
pub use missing::find_missing_digests;
pub use upload::{BatchLimits, upload_chunks};
