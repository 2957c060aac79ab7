//! The remote action cache: uploads and downloads action outputs and records
//! action results

use crate::action::{ActionResult, FileMetadata, Output, OutputContent};
use crate::cas;
use crate::chunker::{Chunker, ChunkerBuilder};
use crate::client::{CasTransport, ExecutionCacheTransport, GrpcChannel, GrpcTransport};
use crate::config::RemoteConfig;
use crate::error::{RemoteError, Result};
use crate::mapper::{ResultMapper, digest_to_proto};
use crate::merkle::{ActionInput, ActionKey, Digest, InputDigestCache, TreeNodeId, TreeRepository};
use crate::proto::{
    CasUploadTreeMetadataRequest, ExecutionCacheRequest, ExecutionCacheSetRequest,
    execution_cache_status,
};
use crate::retry::with_retry;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Operations of a remote cache for action inputs, outputs and results
#[async_trait]
pub trait RemoteActionCache: Send + Sync {
    /// Make the tree under `root` reconstructible remotely. Only nodes and
    /// files the store lacks are sent.
    async fn upload_tree(
        &self,
        repository: &mut dyn TreeRepository,
        exec_root: &Path,
        root: TreeNodeId,
    ) -> Result<()>;

    /// Reconstruct a directory from its Merkle root. Not supported.
    async fn download_tree(&self, root: Digest, exec_root: &Path) -> Result<()>;

    /// Write every file output of `result` under `exec_root`
    async fn download_all_results(&self, result: &ActionResult, exec_root: &Path) -> Result<()>;

    /// Upload the contents of `files` and describe them as action outputs
    async fn upload_all_results(&self, exec_root: &Path, files: &[PathBuf])
    -> Result<ActionResult>;

    /// Upload one file unless already stored
    async fn upload_file_contents(&self, path: &Path) -> Result<Digest>;

    /// Upload one action input unless already stored
    async fn upload_action_input(
        &self,
        input: &ActionInput,
        exec_root: &Path,
        cache: Arc<dyn InputDigestCache>,
    ) -> Result<Digest>;

    /// Upload one blob unless already stored
    async fn upload_blob(&self, blob: Vec<u8>) -> Result<Digest>;

    /// Upload blobs the store lacks; digests are returned in input order
    async fn upload_blobs(&self, blobs: Vec<Vec<u8>>) -> Result<Vec<Digest>>;

    /// Download one blob
    async fn download_blob(&self, digest: Digest) -> Result<Vec<u8>>;

    /// Download blobs, one buffer per requested digest
    async fn download_blobs(&self, digests: &[Digest]) -> Result<Vec<Vec<u8>>>;

    /// The recorded result of an action, or `None` when nothing is recorded
    async fn get_cached_action_result(&self, key: &ActionKey) -> Result<Option<ActionResult>>;

    /// Record the result of an action
    async fn set_cached_action_result(&self, key: &ActionKey, result: &ActionResult)
    -> Result<()>;
}

/// [`RemoteActionCache`] over a pair of service transports
pub struct RemoteCacheClient {
    cas: Arc<dyn CasTransport>,
    execution_cache: Arc<dyn ExecutionCacheTransport>,
    config: RemoteConfig,
}

impl RemoteCacheClient {
    /// Client over existing transports
    pub fn new(
        config: RemoteConfig,
        cas: Arc<dyn CasTransport>,
        execution_cache: Arc<dyn ExecutionCacheTransport>,
    ) -> Self {
        Self {
            cas,
            execution_cache,
            config,
        }
    }

    /// Validate `config` and connect to its endpoint over gRPC
    pub async fn connect(config: RemoteConfig) -> Result<Self> {
        config.validate()?;
        let channel = GrpcChannel::connect(&config).await?;
        let transport = Arc::new(GrpcTransport::from_channel(&channel));
        Ok(Self::new(config, transport.clone(), transport))
    }

    /// Configuration this client was built with
    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Digests among `digests` the remote store does not hold
    pub async fn missing_digests(&self, digests: Vec<Digest>) -> Result<BTreeSet<Digest>> {
        with_retry(self.config.retry.as_ref(), "CasService.Lookup", || {
            cas::find_missing_digests(self.cas.as_ref(), digests.clone())
        })
        .await
    }

    /// Fetch and materialize the cached outputs of `key`.
    ///
    /// `None` means the caller must execute the action: results are not
    /// accepted, nothing is recorded, or a referenced output is gone.
    #[instrument(skip(self, exec_root), fields(action = %key))]
    pub async fn fetch_cached_outputs(
        &self,
        key: &ActionKey,
        exec_root: &Path,
    ) -> Result<Option<ActionResult>> {
        if !self.config.accept_cached {
            return Ok(None);
        }
        let Some(result) = self.get_cached_action_result(key).await? else {
            debug!("No cached result");
            return Ok(None);
        };

        match self.download_all_results(&result, exec_root).await {
            Ok(()) => {
                info!(outputs = result.outputs.len(), "Restored cached outputs");
                Ok(Some(result))
            }
            Err(e) if e.is_cache_miss() => {
                warn!(error = %e, "Cached result references missing content");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Upload the outputs of a locally executed action and record its
    /// result, unless uploading local results is disabled
    #[instrument(skip(self, exec_root, files), fields(action = %key, files = files.len()))]
    pub async fn store_local_results(
        &self,
        key: &ActionKey,
        exec_root: &Path,
        files: &[PathBuf],
    ) -> Result<()> {
        if !self.config.upload_local_results {
            return Ok(());
        }
        let result = self.upload_all_results(exec_root, files).await?;
        self.set_cached_action_result(key, &result).await
    }

    fn chunker(&self) -> ChunkerBuilder {
        ChunkerBuilder::new().chunk_size(self.config.max_chunk_size_bytes)
    }

    async fn upload_chunks(&self, num_items: usize, chunker: &mut Chunker) -> Result<()> {
        cas::upload_chunks(
            self.cas.as_ref(),
            num_items,
            chunker,
            self.config.batch_limits(),
            self.config.timeout(),
        )
        .await
    }

    async fn upload_tree_metadata(&self, request: CasUploadTreeMetadataRequest) -> Result<()> {
        let reply = with_retry(
            self.config.retry.as_ref(),
            "CasService.UploadTreeMetadata",
            || self.cas.upload_tree_metadata(request.clone()),
        )
        .await?;
        match reply.status {
            Some(status) if status.succeeded => Ok(()),
            Some(status) => Err(RemoteError::remote_failure(
                "CasService.UploadTreeMetadata",
                status.error_detail,
            )),
            None => Err(RemoteError::protocol_violation(
                "tree metadata reply carries no status",
            )),
        }
    }
}

#[async_trait]
impl RemoteActionCache for RemoteCacheClient {
    #[instrument(skip(self, repository, exec_root))]
    async fn upload_tree(
        &self,
        repository: &mut dyn TreeRepository,
        exec_root: &Path,
        root: TreeNodeId,
    ) -> Result<()> {
        repository.compute_merkle_digests(root).await?;
        let missing = self.missing_digests(repository.all_digests(root)?).await?;
        if missing.is_empty() {
            debug!("Tree already stored");
            return Ok(());
        }

        let (inputs, nodes) = repository.data_from_digests(&missing);
        debug!(
            files = inputs.len(),
            directories = nodes.len(),
            "Uploading missing tree content"
        );

        if !nodes.is_empty() {
            self.upload_tree_metadata(CasUploadTreeMetadataRequest { tree_node: nodes })
                .await?;
        }
        if !inputs.is_empty() {
            let count = inputs.len();
            let mut chunker = self
                .chunker()
                .add_action_inputs(inputs, &repository.input_cache(), exec_root)
                .only_use_digests(missing)
                .build()?;
            self.upload_chunks(count, &mut chunker).await?;
        }
        Ok(())
    }

    async fn download_tree(&self, root: Digest, _exec_root: &Path) -> Result<()> {
        Err(RemoteError::unsupported(format!(
            "downloading the directory tree {root}"
        )))
    }

    #[instrument(skip(self, result, exec_root), fields(outputs = result.outputs.len()))]
    async fn download_all_results(&self, result: &ActionResult, exec_root: &Path) -> Result<()> {
        let mut files: Vec<(PathBuf, FileMetadata)> = Vec::with_capacity(result.outputs.len());
        for output in &result.outputs {
            match &output.content {
                OutputContent::File(metadata) => {
                    files.push((output_path(exec_root, &output.path)?, *metadata));
                }
                OutputContent::Directory(_) => {
                    return Err(RemoteError::unsupported(format!(
                        "downloading the directory output '{}'",
                        output.path
                    )));
                }
            }
        }

        let digests: Vec<Digest> = files.iter().map(|(_, metadata)| metadata.digest).collect();
        let blobs = self.download_blobs(&digests).await?;
        for ((path, metadata), blob) in files.into_iter().zip(blobs) {
            write_output(&path, &blob, metadata.executable).await?;
        }
        Ok(())
    }

    #[instrument(skip(self, exec_root, files), fields(files = files.len()))]
    async fn upload_all_results(
        &self,
        exec_root: &Path,
        files: &[PathBuf],
    ) -> Result<ActionResult> {
        let mut described = Vec::with_capacity(files.len());
        for file in files {
            let path = exec_root.join(file);
            let metadata = tokio::fs::metadata(&path)
                .await
                .map_err(|e| RemoteError::io("stat output", &path, e))?;
            if metadata.is_dir() {
                return Err(RemoteError::unsupported(format!(
                    "storing the directory '{}' as an action output",
                    path.display()
                )));
            }
            described.push((path, is_executable(&metadata)));
        }

        let mut outputs = Vec::with_capacity(described.len());
        let mut builder = self.chunker();
        for (path, executable) in &described {
            let relative = path.strip_prefix(exec_root).map_err(|_| {
                RemoteError::io(
                    "relativize output",
                    path,
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "output is outside the exec root",
                    ),
                )
            })?;
            let digest = Digest::from_file(path).await?;
            outputs.push(Output::file(
                relative.to_string_lossy().into_owned(),
                digest,
                *executable,
            ));
            builder = builder.add_file_with_digest(path, digest);
        }

        let result = ActionResult {
            outputs,
            return_code: 0,
        };
        let missing = self
            .missing_digests(result.file_digests().copied().collect())
            .await?;
        if !missing.is_empty() {
            let count = missing.len();
            let mut chunker = builder.only_use_digests(missing).build()?;
            self.upload_chunks(count, &mut chunker).await?;
        }
        Ok(result)
    }

    #[instrument(skip(self))]
    async fn upload_file_contents(&self, path: &Path) -> Result<Digest> {
        let digest = Digest::from_file(path).await?;
        let missing = self.missing_digests(vec![digest]).await?;
        if !missing.is_empty() {
            let mut chunker = self
                .chunker()
                .add_file_with_digest(path, digest)
                .only_use_digests(missing)
                .build()?;
            self.upload_chunks(1, &mut chunker).await?;
        }
        Ok(digest)
    }

    #[instrument(skip(self, exec_root, cache), fields(input = %input.exec_path()))]
    async fn upload_action_input(
        &self,
        input: &ActionInput,
        exec_root: &Path,
        cache: Arc<dyn InputDigestCache>,
    ) -> Result<Digest> {
        let digest = cache.digest(input).await?;
        let missing = self.missing_digests(vec![digest]).await?;
        if !missing.is_empty() {
            let mut chunker = self
                .chunker()
                .add_action_input(input.clone(), cache, exec_root)
                .only_use_digests(missing)
                .build()?;
            self.upload_chunks(1, &mut chunker).await?;
        }
        Ok(digest)
    }

    async fn upload_blob(&self, blob: Vec<u8>) -> Result<Digest> {
        let mut digests = self.upload_blobs(vec![blob]).await?;
        digests
            .pop()
            .ok_or_else(|| RemoteError::protocol_violation("no digest for uploaded blob"))
    }

    #[instrument(skip(self, blobs), fields(blobs = blobs.len()))]
    async fn upload_blobs(&self, blobs: Vec<Vec<u8>>) -> Result<Vec<Digest>> {
        let digests: Vec<Digest> = blobs.iter().map(|blob| Digest::from_bytes(blob)).collect();
        let missing = self.missing_digests(digests.clone()).await?;
        if !missing.is_empty() {
            let count = missing.len();
            let mut chunker = blobs
                .into_iter()
                .fold(self.chunker(), |builder, blob| builder.add_input(blob))
                .only_use_digests(missing)
                .build()?;
            self.upload_chunks(count, &mut chunker).await?;
        }
        Ok(digests)
    }

    async fn download_blob(&self, digest: Digest) -> Result<Vec<u8>> {
        let mut blobs = self.download_blobs(&[digest]).await?;
        blobs.pop().ok_or_else(|| RemoteError::not_found(digest))
    }

    #[instrument(skip(self, digests), fields(digests = digests.len()))]
    async fn download_blobs(&self, digests: &[Digest]) -> Result<Vec<Vec<u8>>> {
        with_retry(self.config.retry.as_ref(), "CasService.DownloadBlob", || {
            cas::download_blobs(self.cas.as_ref(), digests)
        })
        .await
    }

    #[instrument(skip(self), fields(action = %key))]
    async fn get_cached_action_result(&self, key: &ActionKey) -> Result<Option<ActionResult>> {
        let request = ExecutionCacheRequest {
            action_digest: Some(digest_to_proto(key.digest())),
        };
        let reply = with_retry(
            self.config.retry.as_ref(),
            "ExecutionCacheService.GetCachedResult",
            || self.execution_cache.get_cached_result(request.clone()),
        )
        .await?;

        let status = reply.status.ok_or_else(|| {
            RemoteError::protocol_violation("cached result reply carries no status")
        })?;
        if !status.succeeded {
            if status.error() == execution_cache_status::ErrorCode::MissingResult {
                return Ok(None);
            }
            return Err(RemoteError::remote_failure(
                "ExecutionCacheService.GetCachedResult",
                status.error_detail,
            ));
        }

        let result = reply.result.ok_or_else(|| {
            RemoteError::protocol_violation("successful cached result reply carries no result")
        })?;
        ResultMapper::from_proto(result).map(Some)
    }

    #[instrument(skip(self, result), fields(action = %key, outputs = result.outputs.len()))]
    async fn set_cached_action_result(
        &self,
        key: &ActionKey,
        result: &ActionResult,
    ) -> Result<()> {
        let request = ExecutionCacheSetRequest {
            action_digest: Some(digest_to_proto(key.digest())),
            result: Some(ResultMapper::to_proto(result)),
        };
        let reply = with_retry(
            self.config.retry.as_ref(),
            "ExecutionCacheService.SetCachedResult",
            || self.execution_cache.set_cached_result(request.clone()),
        )
        .await?;

        let status = reply.status.ok_or_else(|| {
            RemoteError::protocol_violation("set result reply carries no status")
        })?;
        if status.succeeded {
            return Ok(());
        }
        if status.error() == execution_cache_status::ErrorCode::Unsupported {
            debug!("Remote cache does not accept results");
            return Ok(());
        }
        Err(RemoteError::remote_failure(
            "ExecutionCacheService.SetCachedResult",
            status.error_detail,
        ))
    }
}

/// Resolve an output path, rejecting paths that leave the exec root
fn output_path(exec_root: &Path, relative: &str) -> Result<PathBuf> {
    let path = Path::new(relative);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if relative.is_empty() || escapes {
        return Err(RemoteError::protocol_violation(format!(
            "output path '{relative}' is not inside the exec root"
        )));
    }
    Ok(exec_root.join(path))
}

async fn write_output(path: &Path, content: &[u8], executable: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| RemoteError::io("create output directory", parent, e))?;
    }
    tokio::fs::write(path, content)
        .await
        .map_err(|e| RemoteError::io("write output", path, e))?;
    if executable {
        set_executable(path).await?;
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut permissions = tokio::fs::metadata(path)
        .await
        .map_err(|e| RemoteError::io("stat output", path, e))?
        .permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    tokio::fs::set_permissions(path, permissions)
        .await
        .map_err(|e| RemoteError::io("set executable bit", path, e))
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}
