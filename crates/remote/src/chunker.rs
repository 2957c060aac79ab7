//! Lazy, single-pass splitting of blobs into size-bounded chunks
//!
//! The first chunk of every blob carries the blob's digest; the following
//! chunks carry only their offset. That is enough for a receiver to
//! demultiplex several blobs sent over one stream.

use crate::error::{RemoteError, Result};
use crate::mapper::digest_to_proto;
use crate::merkle::{ActionInput, Digest, InputDigestCache};
use crate::proto::BlobChunk;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

/// Default maximum chunk size in bytes
pub const DEFAULT_CHUNK_SIZE: usize = 16_000;

/// A bounded slice of one blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Present only on the first chunk of a blob
    pub digest: Option<Digest>,
    /// Bytes of this blob emitted before this chunk
    pub offset: i64,
    /// Chunk payload
    pub data: Vec<u8>,
}

impl From<Chunk> for BlobChunk {
    fn from(chunk: Chunk) -> Self {
        Self {
            digest: chunk.digest.as_ref().map(digest_to_proto),
            offset: chunk.offset,
            data: chunk.data,
        }
    }
}

enum ChunkerInput {
    Bytes(Vec<u8>),
    File {
        path: PathBuf,
        digest: Option<Digest>,
    },
    ActionInput {
        input: ActionInput,
        exec_root: PathBuf,
        cache: Arc<dyn InputDigestCache>,
    },
}

/// Builder for a [`Chunker`]
pub struct ChunkerBuilder {
    chunk_size: usize,
    inputs: Vec<ChunkerInput>,
    only_use: Option<HashSet<Digest>>,
}

impl Default for ChunkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkerBuilder {
    /// Create a builder with the default chunk size and no inputs
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            inputs: Vec::new(),
            only_use: None,
        }
    }

    /// Set the maximum chunk size in bytes
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Add an in-memory blob
    pub fn add_input(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.inputs.push(ChunkerInput::Bytes(data.into()));
        self
    }

    /// Add a file; its digest is computed when the chunker reaches it
    pub fn add_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.inputs.push(ChunkerInput::File {
            path: path.into(),
            digest: None,
        });
        self
    }

    /// Add a file whose digest is already known
    pub fn add_file_with_digest(mut self, path: impl Into<PathBuf>, digest: Digest) -> Self {
        self.inputs.push(ChunkerInput::File {
            path: path.into(),
            digest: Some(digest),
        });
        self
    }

    /// Add an action input whose digest comes from `cache`
    pub fn add_action_input(
        mut self,
        input: ActionInput,
        cache: Arc<dyn InputDigestCache>,
        exec_root: impl Into<PathBuf>,
    ) -> Self {
        self.inputs.push(ChunkerInput::ActionInput {
            input,
            exec_root: exec_root.into(),
            cache,
        });
        self
    }

    /// Add several action inputs sharing one digest cache and exec root
    pub fn add_action_inputs(
        mut self,
        inputs: impl IntoIterator<Item = ActionInput>,
        cache: &Arc<dyn InputDigestCache>,
        exec_root: &Path,
    ) -> Self {
        for input in inputs {
            self = self.add_action_input(input, Arc::clone(cache), exec_root);
        }
        self
    }

    /// Skip every input whose digest is not in `digests`
    pub fn only_use_digests(mut self, digests: impl IntoIterator<Item = Digest>) -> Self {
        self.only_use = Some(digests.into_iter().collect());
        self
    }

    /// Build the chunker
    pub fn build(self) -> Result<Chunker> {
        if self.chunk_size == 0 {
            return Err(RemoteError::config_error("chunk size must be positive"));
        }
        Ok(Chunker {
            chunk_size: self.chunk_size,
            pending: self.inputs.into(),
            only_use: self.only_use,
            emitted: HashSet::new(),
            current: None,
        })
    }
}

enum BlobSource {
    Memory(Vec<u8>),
    File { file: tokio::fs::File, path: PathBuf },
}

impl BlobSource {
    async fn read(&mut self, offset: usize, len: usize) -> Result<Vec<u8>> {
        match self {
            Self::Memory(data) => data
                .get(offset..offset + len)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| RemoteError::invalid_digest("blob is shorter than its digest")),
            Self::File { file, path } => {
                let mut buffer = vec![0u8; len];
                file.read_exact(&mut buffer)
                    .await
                    .map_err(|e| RemoteError::io("read chunk", &*path, e))?;
                Ok(buffer)
            }
        }
    }
}

struct OpenBlob {
    digest: Digest,
    source: BlobSource,
    offset: i64,
}

/// A finite, non-restartable sequence of chunks over a set of inputs.
///
/// Inputs are visited in the order they were added. An input is skipped when
/// it is empty, when a digest filter is set and does not contain it, or when
/// a blob with the same digest was already emitted.
pub struct Chunker {
    chunk_size: usize,
    pending: VecDeque<ChunkerInput>,
    only_use: Option<HashSet<Digest>>,
    emitted: HashSet<Digest>,
    current: Option<OpenBlob>,
}

impl Chunker {
    /// Start building a chunker
    pub fn builder() -> ChunkerBuilder {
        ChunkerBuilder::new()
    }

    /// Chunker over a single in-memory blob
    pub fn from_bytes(data: impl Into<Vec<u8>>, chunk_size: usize) -> Result<Self> {
        ChunkerBuilder::new()
            .chunk_size(chunk_size)
            .add_input(data)
            .build()
    }

    /// Chunker over a single file
    pub fn from_file(path: impl Into<PathBuf>, chunk_size: usize) -> Result<Self> {
        ChunkerBuilder::new()
            .chunk_size(chunk_size)
            .add_file(path)
            .build()
    }

    /// Maximum chunk size in bytes
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Whether another chunk is available. Opens the next selected input
    /// when the current one is exhausted.
    pub async fn has_next(&mut self) -> Result<bool> {
        while self.current.is_none() {
            let Some(input) = self.pending.pop_front() else {
                return Ok(false);
            };
            self.current = self.open(input).await?;
        }
        Ok(true)
    }

    /// The next chunk, or `None` once every input is exhausted
    pub async fn next(&mut self) -> Result<Option<Chunk>> {
        if !self.has_next().await? {
            return Ok(None);
        }
        let chunk_size = self.chunk_size as i64;
        let Some(blob) = self.current.as_mut() else {
            return Ok(None);
        };

        let len = (blob.digest.size_bytes() - blob.offset).min(chunk_size);
        let data = blob.source.read(blob.offset as usize, len as usize).await?;
        let chunk = Chunk {
            digest: (blob.offset == 0).then_some(blob.digest),
            offset: blob.offset,
            data,
        };

        blob.offset += len;
        if blob.offset >= blob.digest.size_bytes() {
            self.current = None;
        }
        Ok(Some(chunk))
    }

    fn selects(&mut self, digest: &Digest) -> bool {
        // Zero-size blobs are never sent
        if digest.is_empty() {
            return false;
        }
        let wanted = self
            .only_use
            .as_ref()
            .map_or(true, |digests| digests.contains(digest));
        wanted && self.emitted.insert(*digest)
    }

    async fn open(&mut self, input: ChunkerInput) -> Result<Option<OpenBlob>> {
        let (digest, source) = match input {
            ChunkerInput::Bytes(data) => {
                let digest = Digest::from_bytes(&data);
                if !self.selects(&digest) {
                    return Ok(None);
                }
                (digest, BlobSource::Memory(data))
            }
            ChunkerInput::File { path, digest } => {
                let digest = match digest {
                    Some(digest) => digest,
                    None => Digest::from_file(&path).await?,
                };
                if !self.selects(&digest) {
                    return Ok(None);
                }
                (digest, open_file(path).await?)
            }
            ChunkerInput::ActionInput {
                input,
                exec_root,
                cache,
            } => {
                let digest = cache.digest(&input).await?;
                if !self.selects(&digest) {
                    return Ok(None);
                }
                (digest, open_file(input.path_under(&exec_root)).await?)
            }
        };

        Ok(Some(OpenBlob {
            digest,
            source,
            offset: 0,
        }))
    }
}

async fn open_file(path: PathBuf) -> Result<BlobSource> {
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| RemoteError::io("open", &path, e))?;
    Ok(BlobSource::File { file, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::FileDigestCache;

    async fn drain(chunker: &mut Chunker) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = chunker.next().await.unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn test_concrete_scenario_25_bytes_chunk_10() {
        let blob = vec![b'a'; 25];
        let digest = Digest::from_bytes(&blob);
        let mut chunker = Chunker::from_bytes(blob.clone(), 10).unwrap();

        let chunks = drain(&mut chunker).await;
        assert_eq!(
            chunks,
            vec![
                Chunk {
                    digest: Some(digest),
                    offset: 0,
                    data: vec![b'a'; 10]
                },
                Chunk {
                    digest: None,
                    offset: 10,
                    data: vec![b'a'; 10]
                },
                Chunk {
                    digest: None,
                    offset: 20,
                    data: vec![b'a'; 5]
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_two_chunks_plus_seven() {
        let chunk_size = 16;
        let blob: Vec<u8> = (0..(chunk_size * 2 + 7)).map(|i| i as u8).collect();
        let mut chunker = Chunker::from_bytes(blob.clone(), chunk_size).unwrap();

        let chunks = drain(&mut chunker).await;
        let offsets: Vec<i64> = chunks.iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![0, 16, 32]);
        let joined: Vec<u8> = chunks.into_iter().flat_map(|c| c.data).collect();
        assert_eq!(joined, blob);
    }

    #[tokio::test]
    async fn test_not_restartable() {
        let mut chunker = Chunker::from_bytes(b"abc".to_vec(), 2).unwrap();
        assert_eq!(drain(&mut chunker).await.len(), 2);
        assert!(!chunker.has_next().await.unwrap());
        assert!(chunker.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_filter_skips_present_blobs() {
        let wanted = b"wanted".to_vec();
        let mut chunker = Chunker::builder()
            .chunk_size(4)
            .add_input(b"already there".to_vec())
            .add_input(wanted.clone())
            .only_use_digests([Digest::from_bytes(&wanted)])
            .build()
            .unwrap();

        let chunks = drain(&mut chunker).await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].digest, Some(Digest::from_bytes(&wanted)));
    }

    #[tokio::test]
    async fn test_duplicate_inputs_emitted_once() {
        let mut chunker = Chunker::builder()
            .add_input(b"same".to_vec())
            .add_input(b"other".to_vec())
            .add_input(b"same".to_vec())
            .build()
            .unwrap();

        let chunks = drain(&mut chunker).await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.digest.is_some()));
    }

    #[tokio::test]
    async fn test_inputs_keep_order() {
        let mut chunker = Chunker::builder()
            .chunk_size(3)
            .add_input(b"first".to_vec())
            .add_input(b"second".to_vec())
            .build()
            .unwrap();

        let starts: Vec<Digest> = drain(&mut chunker)
            .await
            .into_iter()
            .filter_map(|c| c.digest)
            .collect();
        assert_eq!(
            starts,
            vec![Digest::from_bytes(b"first"), Digest::from_bytes(b"second")]
        );
    }

    #[tokio::test]
    async fn test_zero_size_blob_emits_no_chunks() {
        let mut chunker = Chunker::from_bytes(Vec::new(), 10).unwrap();
        assert!(!chunker.has_next().await.unwrap());
        assert!(drain(&mut chunker).await.is_empty());
    }

    #[tokio::test]
    async fn test_zero_size_inputs_are_skipped_between_blobs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("empty"), b"").unwrap();

        let mut chunker = Chunker::builder()
            .chunk_size(4)
            .add_input(b"ab".to_vec())
            .add_input(Vec::new())
            .add_file(dir.path().join("empty"))
            .add_input(b"cd".to_vec())
            .build()
            .unwrap();

        let chunks = drain(&mut chunker).await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| !c.data.is_empty()));
    }

    #[tokio::test]
    async fn test_file_and_action_input_sources() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), vec![1u8; 23]).unwrap();
        std::fs::write(dir.path().join("b.bin"), vec![2u8; 5]).unwrap();

        let cache: Arc<dyn InputDigestCache> = Arc::new(FileDigestCache::new(dir.path()));
        let mut chunker = Chunker::builder()
            .chunk_size(10)
            .add_file(dir.path().join("a.bin"))
            .add_action_inputs([ActionInput::new("b.bin")], &cache, dir.path())
            .build()
            .unwrap();

        let chunks = drain(&mut chunker).await;
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].digest, Some(Digest::from_bytes(&[1u8; 23])));
        assert_eq!(chunks[2].offset, 20);
        assert_eq!(chunks[3].digest, Some(Digest::from_bytes(&[2u8; 5])));
    }

    #[tokio::test]
    async fn test_file_shrunk_after_digest_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shrinks");
        std::fs::write(&path, b"short").unwrap();

        let stale = Digest::from_bytes(b"much longer content");
        let mut chunker = Chunker::builder()
            .add_file_with_digest(&path, stale)
            .build()
            .unwrap();

        let err = chunker.next().await.unwrap_err();
        assert!(matches!(err, RemoteError::Io { .. }));
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(Chunker::from_bytes(b"x".to_vec(), 0).is_err());
    }

    #[test]
    fn test_chunk_to_proto() {
        let digest = Digest::from_bytes(b"abc");
        let proto: BlobChunk = Chunk {
            digest: Some(digest),
            offset: 0,
            data: b"abc".to_vec(),
        }
        .into();
        assert_eq!(proto.digest.unwrap().size_bytes, 3);
    }
}
