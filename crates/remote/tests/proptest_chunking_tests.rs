//! Property-based tests for chunking and batching.
//!
//! These tests verify the behavioral contracts of the upload path:
//! - Reassembly: concatenating a blob's chunks yields the blob
//! - Bounds: no chunk exceeds the chunk size and offsets are contiguous
//! - Batching: upload calls follow the per-batch input limit
//! - Round trip: whatever is uploaded downloads byte-identical

use proptest::prelude::*;
use remote_cache::{Chunker, Digest, InMemoryCas, RemoteActionCache, RemoteCacheClient, RemoteConfig};
use std::collections::HashSet;
use std::sync::Arc;

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Non-empty blob content
fn blob_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..300)
}

fn chunk_size_strategy() -> impl Strategy<Value = usize> {
    prop_oneof![Just(1usize), 2usize..64, Just(16_000usize)]
}

// =============================================================================
// Property Tests: Chunking
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Contract: chunks of one blob reassemble to the blob, stay within the
    /// chunk size, and only the first one carries the digest
    #[test]
    fn chunks_reassemble_to_blob(data in blob_strategy(), chunk_size in chunk_size_strategy()) {
        let chunks = tokio_test::block_on(async {
            let mut chunker = Chunker::from_bytes(data.clone(), chunk_size).unwrap();
            let mut chunks = Vec::new();
            while let Some(chunk) = chunker.next().await.unwrap() {
                chunks.push(chunk);
            }
            chunks
        });

        prop_assert_eq!(chunks.len(), data.len().div_ceil(chunk_size));
        prop_assert_eq!(chunks[0].digest, Some(Digest::from_bytes(&data)));

        let mut assembled = Vec::new();
        for chunk in &chunks {
            prop_assert!(chunk.data.len() <= chunk_size);
            prop_assert!(!chunk.data.is_empty());
            prop_assert_eq!(chunk.offset, assembled.len() as i64);
            if chunk.offset > 0 {
                prop_assert!(chunk.digest.is_none());
            }
            assembled.extend_from_slice(&chunk.data);
        }
        prop_assert_eq!(assembled, data);
    }
}

// =============================================================================
// Property Tests: Batching and round trip
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Contract: with no byte pressure, each upload call carries at most
    /// `max_batch_inputs` distinct blobs and every call but the last is full
    #[test]
    fn upload_calls_follow_input_limit(
        blobs in prop::collection::vec(blob_strategy(), 1..12),
        max_inputs in 1usize..5,
    ) {
        let distinct: HashSet<Digest> = blobs.iter().map(|b| Digest::from_bytes(b)).collect();
        let cas = Arc::new(InMemoryCas::new());
        let config = RemoteConfig {
            max_batch_inputs: max_inputs,
            ..RemoteConfig::new("loopback")
        };
        let client = RemoteCacheClient::new(config, cas.clone(), cas.clone());

        tokio_test::block_on(client.upload_blobs(blobs)).unwrap();

        prop_assert_eq!(cas.stats().upload_calls(), distinct.len().div_ceil(max_inputs));
        for digest in &distinct {
            prop_assert!(cas.contains(digest));
        }
    }

    /// Contract: download returns exactly the uploaded bytes, in request
    /// order, for any chunk size on either side
    #[test]
    fn upload_then_download_is_identity(
        blobs in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..200), 1..8),
        upload_chunk in 1usize..50,
        download_chunk in 1usize..50,
        max_bytes in 1u64..400,
    ) {
        let cas = Arc::new(InMemoryCas::new().with_chunk_size(download_chunk));
        let config = RemoteConfig {
            max_chunk_size_bytes: upload_chunk,
            max_batch_size_bytes: max_bytes,
            ..RemoteConfig::new("loopback")
        };
        let client = RemoteCacheClient::new(config, cas.clone(), cas.clone());

        let downloaded = tokio_test::block_on(async {
            let digests = client.upload_blobs(blobs.clone()).await?;
            client.download_blobs(&digests).await
        })
        .unwrap();

        prop_assert_eq!(downloaded, blobs);
    }
}
