//! Streaming download and reassembly of blobs

use crate::client::{CasTransport, DownloadStream};
use crate::error::{RemoteError, Result};
use crate::mapper::{digest_from_proto, digest_to_proto};
use crate::merkle::Digest;
use crate::proto::{BlobChunk, CasDownloadBlobRequest, CasStatus, cas_status::ErrorCode};
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, instrument};

/// Largest blob a single download buffer may hold
pub const MAX_BLOB_BYTES: i64 = 512 * 1024 * 1024;

/// Download `digests` in one streaming call.
///
/// Returns one buffer per requested digest, in request order. Zero-size
/// digests are answered locally and repeated digests are requested once.
#[instrument(skip(transport, digests), fields(requested = digests.len()))]
pub async fn download_blobs(
    transport: &dyn CasTransport,
    digests: &[Digest],
) -> Result<Vec<Vec<u8>>> {
    let mut uses: HashMap<Digest, usize> = HashMap::new();
    let mut wanted = Vec::new();
    for digest in digests.iter().filter(|d| !d.is_empty()) {
        if digest.size_bytes() > MAX_BLOB_BYTES {
            return Err(RemoteError::resource_exceeded(*digest, MAX_BLOB_BYTES));
        }
        let count = uses.entry(*digest).or_insert(0);
        if *count == 0 {
            wanted.push(*digest);
        }
        *count += 1;
    }

    let mut fetched = HashMap::with_capacity(wanted.len());
    if !wanted.is_empty() {
        let request = CasDownloadBlobRequest {
            digest: wanted.iter().map(digest_to_proto).collect(),
        };
        let replies = transport.download_blob(request).await?;
        let blobs = assemble(replies, &wanted).await?;
        debug!(blobs = blobs.len(), "Downloaded blobs");
        fetched.extend(wanted.into_iter().zip(blobs));
    }

    digests
        .iter()
        .map(|digest| {
            if digest.is_empty() {
                return Ok(Vec::new());
            }
            let remaining = uses.get_mut(digest).map_or(0, |count| {
                *count -= 1;
                *count
            });
            let blob = if remaining == 0 {
                fetched.remove(digest)
            } else {
                fetched.get(digest).cloned()
            };
            blob.ok_or_else(|| RemoteError::not_found(*digest))
        })
        .collect()
}

/// Demultiplex a reply stream into one buffer per expected digest.
///
/// Replies must follow request order: a header chunk carrying the digest at
/// offset zero, then continuation chunks without a digest whose offset equals
/// the bytes assembled so far.
async fn assemble(mut replies: DownloadStream, expected: &[Digest]) -> Result<Vec<Vec<u8>>> {
    let mut blobs: Vec<Vec<u8>> = Vec::with_capacity(expected.len());
    let mut current: Option<Vec<u8>> = None;

    while let Some(reply) = replies.next().await {
        let reply = reply?;
        if let Some(status) = &reply.status {
            check_status(status, expected.get(blobs.len()))?;
        }
        let Some(chunk) = reply.data else {
            continue;
        };
        let Some(digest) = expected.get(blobs.len()) else {
            return Err(RemoteError::protocol_violation(
                "download stream carries data after the last requested blob",
            ));
        };

        match &current {
            None => check_header(&chunk, digest)?,
            Some(buffer) => check_continuation(&chunk, digest, buffer.len())?,
        }

        let size = digest.size_bytes() as usize;
        let buffer = current.get_or_insert_with(|| Vec::with_capacity(size));
        if buffer.len() + chunk.data.len() > size {
            return Err(RemoteError::protocol_violation(format!(
                "received more than {size} bytes for {digest}"
            )));
        }
        buffer.extend_from_slice(&chunk.data);

        if buffer.len() == size {
            blobs.extend(current.take());
        }
    }

    if current.is_some() {
        let digest = expected[blobs.len()];
        return Err(RemoteError::protocol_violation(format!(
            "download stream ended inside {digest}"
        )));
    }
    match expected.get(blobs.len()) {
        Some(digest) => Err(RemoteError::not_found(*digest)),
        None => Ok(blobs),
    }
}

fn check_status(status: &CasStatus, expected: Option<&Digest>) -> Result<()> {
    if status.succeeded {
        return Ok(());
    }
    if status.error() == ErrorCode::MissingDigest {
        let reported = status.missing_digest.first().map(digest_from_proto).transpose()?;
        if let Some(digest) = reported.or_else(|| expected.copied()) {
            return Err(RemoteError::not_found(digest));
        }
    }
    Err(RemoteError::remote_failure(
        "CasService.DownloadBlob",
        status.error_detail.clone(),
    ))
}

fn check_header(chunk: &BlobChunk, expected: &Digest) -> Result<()> {
    let header = chunk
        .digest
        .as_ref()
        .ok_or_else(|| {
            RemoteError::protocol_violation(format!(
                "first chunk for {expected} carries no digest"
            ))
        })
        .and_then(digest_from_proto)?;
    if header != *expected {
        return Err(RemoteError::protocol_violation(format!(
            "expected {expected} but the stream started {header}"
        )));
    }
    if chunk.offset != 0 {
        return Err(RemoteError::protocol_violation(format!(
            "first chunk for {expected} starts at offset {}",
            chunk.offset
        )));
    }
    Ok(())
}

fn check_continuation(chunk: &BlobChunk, expected: &Digest, assembled: usize) -> Result<()> {
    if chunk.digest.is_some() {
        return Err(RemoteError::protocol_violation(format!(
            "digest header repeated inside {expected}"
        )));
    }
    if chunk.offset != assembled as i64 {
        return Err(RemoteError::protocol_violation(format!(
            "chunk for {expected} at offset {} but {assembled} bytes assembled",
            chunk.offset
        )));
    }
    Ok(())
}
