//! Mappers between domain types and wire messages

pub mod digest;
pub mod result;

pub use digest::{digest_from_proto, digest_to_proto, digests_from_proto};
pub use result::ResultMapper;
