use crate::error::{RemoteError, Result};
use sha2::{Digest as Sha2Digest, Sha256};
use std::fmt;
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Length of a SHA-256 hash in bytes
pub const HASH_LEN: usize = 32;

const FILE_READ_BUFFER: usize = 64 * 1024;

/// A content digest: SHA-256 hash plus size in bytes.
///
/// Two blobs with equal digests are treated as identical content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    hash: [u8; HASH_LEN],
    size_bytes: i64,
}

impl Digest {
    /// Creates a Digest from a hex-encoded hash and a size.
    pub fn new(hash: &str, size_bytes: i64) -> Result<Self> {
        let raw = hex::decode(hash)
            .map_err(|e| RemoteError::invalid_digest(format!("hash '{hash}' is not hex: {e}")))?;
        Self::from_hash_bytes(&raw, size_bytes)
    }

    /// Creates a Digest from raw hash bytes, validating length and size.
    pub fn from_hash_bytes(hash: &[u8], size_bytes: i64) -> Result<Self> {
        let hash: [u8; HASH_LEN] = hash.try_into().map_err(|_| {
            RemoteError::invalid_digest(format!(
                "expected {HASH_LEN} hash bytes, got {}",
                hash.len()
            ))
        })?;
        if size_bytes < 0 {
            return Err(RemoteError::invalid_digest(format!(
                "negative size {size_bytes}"
            )));
        }
        Ok(Self { hash, size_bytes })
    }

    /// Creates a Digest from the given content.
    pub fn from_bytes(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self::finish(hasher, content.len() as i64)
    }

    /// Computes the digest of a file by streaming its contents.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| RemoteError::io("open", path, e))?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; FILE_READ_BUFFER];
        let mut size = 0i64;

        loop {
            let n = file
                .read(&mut buffer)
                .await
                .map_err(|e| RemoteError::io("read", path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            size += n as i64;
        }

        Ok(Self::finish(hasher, size))
    }

    fn finish(hasher: Sha256, size_bytes: i64) -> Self {
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&hasher.finalize());
        Self { hash, size_bytes }
    }

    /// Raw hash bytes
    pub fn hash_bytes(&self) -> &[u8; HASH_LEN] {
        &self.hash
    }

    /// Hex-encoded hash
    pub fn hash(&self) -> String {
        hex::encode(self.hash)
    }

    /// Size of the content in bytes
    pub fn size_bytes(&self) -> i64 {
        self.size_bytes
    }

    /// Zero-size blobs are handled locally and never sent over the wire.
    pub fn is_empty(&self) -> bool {
        self.size_bytes == 0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash(), self.size_bytes)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash(), self.size_bytes)
    }
}

/// Key of an execution cache entry: the digest of a serialized action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionKey(Digest);

impl ActionKey {
    /// Wraps an already computed action digest.
    pub fn new(digest: Digest) -> Self {
        Self(digest)
    }

    /// Computes the key of a serialized action description.
    pub fn from_action_bytes(action: &[u8]) -> Self {
        Self(Digest::from_bytes(action))
    }

    /// The underlying digest
    pub fn digest(&self) -> &Digest {
        &self.0
    }
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
