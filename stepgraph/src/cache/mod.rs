//! Cache index and fingerprinting.
//!
//! A cache key digests a step's identity, the content fingerprints of its
//! resolved inputs, its parameters and its executor policy. A hit lets the
//! scheduler reuse recorded outputs instead of running the step again.

mod fingerprint;
mod index;
mod key;

pub use fingerprint::{canonical_json, fingerprint_value, sha256_hex};
pub use index::{CacheEntry, CacheHit, CacheIndex, InMemoryCacheIndex};
pub use key::{compute_cache_key, CacheKey};
