//! Digest conversion to and from `ContentDigest`

use crate::error::Result;
use crate::merkle::Digest;
use crate::proto::ContentDigest;

/// Convert our Digest to the wire digest
pub fn digest_to_proto(digest: &Digest) -> ContentDigest {
    ContentDigest {
        digest: digest.hash_bytes().to_vec(),
        size_bytes: digest.size_bytes(),
    }
}

/// Convert a wire digest, rejecting malformed hashes or sizes
pub fn digest_from_proto(proto: &ContentDigest) -> Result<Digest> {
    Digest::from_hash_bytes(&proto.digest, proto.size_bytes)
}

/// Convert a list of wire digests
pub fn digests_from_proto<'a>(
    protos: impl IntoIterator<Item = &'a ContentDigest>,
) -> Result<Vec<Digest>> {
    protos.into_iter().map(digest_from_proto).collect()
}
