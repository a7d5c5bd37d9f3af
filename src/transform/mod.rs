//! Payload transforms: serialization, compression and the transform cache

pub mod cache;
mod codec;

pub use cache::{Direction, Fingerprint, TransformCache, FINGERPRINT_PREFIX_CHARS};
pub use codec::{parse_if_json, ValueCodec};
