//! Content digests and Merkle trees of action inputs

pub mod digest;
pub mod tree;

pub use digest::{ActionKey, Digest, HASH_LEN};
pub use tree::{
    ActionInput, FileDigestCache, InputDigestCache, TreeNodeId, TreeNodeRepository,
    TreeRepository,
};
