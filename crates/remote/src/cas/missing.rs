//! Missing-digest resolution: which candidate blobs the store lacks

use crate::client::CasTransport;
use crate::error::{RemoteError, Result};
use crate::mapper::{digest_to_proto, digests_from_proto};
use crate::merkle::Digest;
use crate::proto::{CasLookupRequest, cas_status::ErrorCode};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Return the subset of `digests` the remote store does not hold.
///
/// Zero-size digests are never sent and never reported missing. An empty
/// candidate set returns without a network call. Any failure status other
/// than "missing digest" is fatal.
pub async fn find_missing_digests(
    transport: &dyn CasTransport,
    digests: impl IntoIterator<Item = Digest>,
) -> Result<BTreeSet<Digest>> {
    let candidates: BTreeSet<Digest> = digests.into_iter().filter(|d| !d.is_empty()).collect();
    if candidates.is_empty() {
        return Ok(BTreeSet::new());
    }

    let request = CasLookupRequest {
        digest: candidates.iter().map(digest_to_proto).collect(),
    };
    let reply = transport.lookup(request).await?;
    let status = reply
        .status
        .ok_or_else(|| RemoteError::protocol_violation("lookup reply carries no status"))?;

    if !status.succeeded && status.error() != ErrorCode::MissingDigest {
        return Err(RemoteError::remote_failure(
            "CasService.Lookup",
            status.error_detail,
        ));
    }

    let reported = digests_from_proto(&status.missing_digest)
        .map_err(|e| RemoteError::protocol_violation(format!("lookup reply: {e}")))?;
    let mut missing = BTreeSet::new();
    for digest in reported {
        if candidates.contains(&digest) {
            missing.insert(digest);
        } else {
            warn!(digest = %digest, "Lookup reported a digest that was not requested");
        }
    }

    debug!(
        candidates = candidates.len(),
        missing = missing.len(),
        "Resolved missing digests"
    );
    Ok(missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{DownloadStream, UploadCall};
    use crate::proto::{
        CasDownloadBlobRequest, CasLookupReply, CasStatus, CasUploadTreeMetadataReply,
        CasUploadTreeMetadataRequest,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replies to lookups with a fixed status and counts calls
    struct ScriptedLookup {
        status: Option<CasStatus>,
        calls: Mutex<usize>,
    }

    impl ScriptedLookup {
        fn new(status: Option<CasStatus>) -> Self {
            Self {
                status,
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl CasTransport for ScriptedLookup {
        async fn lookup(&self, _request: CasLookupRequest) -> Result<CasLookupReply> {
            *self.calls.lock().unwrap() += 1;
            Ok(CasLookupReply {
                status: self.status.clone(),
            })
        }

        async fn upload_tree_metadata(
            &self,
            _request: CasUploadTreeMetadataRequest,
        ) -> Result<CasUploadTreeMetadataReply> {
            unreachable!("lookup tests never upload")
        }

        fn upload_blob(&self) -> Result<UploadCall> {
            unreachable!("lookup tests never upload")
        }

        async fn download_blob(&self, _request: CasDownloadBlobRequest) -> Result<DownloadStream> {
            unreachable!("lookup tests never download")
        }
    }

    fn missing_status(digests: &[Digest]) -> CasStatus {
        CasStatus {
            missing_digest: digests.iter().map(digest_to_proto).collect(),
            ..CasStatus::failed(ErrorCode::MissingDigest, "")
        }
    }

    #[tokio::test]
    async fn test_empty_input_makes_no_call() {
        let transport = ScriptedLookup::new(None);
        let missing = find_missing_digests(&transport, Vec::new()).await.unwrap();
        assert!(missing.is_empty());
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_zero_size_digests_are_never_sent() {
        let transport = ScriptedLookup::new(None);
        let missing = find_missing_digests(&transport, [Digest::from_bytes(b"")])
            .await
            .unwrap();
        assert!(missing.is_empty());
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_digest_status_is_not_an_error() {
        let a = Digest::from_bytes(b"a");
        let b = Digest::from_bytes(b"b");
        let transport = ScriptedLookup::new(Some(missing_status(&[b])));

        let missing = find_missing_digests(&transport, [a, b]).await.unwrap();
        assert_eq!(missing.into_iter().collect::<Vec<_>>(), vec![b]);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_success_means_nothing_missing() {
        let transport = ScriptedLookup::new(Some(CasStatus::ok()));
        let missing = find_missing_digests(&transport, [Digest::from_bytes(b"a")])
            .await
            .unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_other_failure_is_fatal() {
        let transport = ScriptedLookup::new(Some(CasStatus::failed(
            ErrorCode::InvalidArgument,
            "bad request",
        )));
        let err = find_missing_digests(&transport, [Digest::from_bytes(b"a")])
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::RemoteFailure { ref detail, .. } if detail == "bad request"));
    }

    #[tokio::test]
    async fn test_unrequested_digests_are_ignored() {
        let a = Digest::from_bytes(b"a");
        let stranger = Digest::from_bytes(b"stranger");
        let transport = ScriptedLookup::new(Some(missing_status(&[a, stranger])));

        let missing = find_missing_digests(&transport, [a]).await.unwrap();
        assert_eq!(missing.len(), 1);
        assert!(missing.contains(&a));
    }
}
