//! Canonical structural encoding used for object hashing and signing.

use serde::Serialize;

/// Encode a value with the canonical encoding (fixed-width little-endian
/// bincode).
///
/// Signing preimages and object hashes are computed over these bytes, so the
/// output must be identical across all honest nodes for the same value.
/// Serialization of an in-memory value cannot fail for the plain data types
/// this crate defines.
pub fn signing_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("canonical encoding of an in-memory value cannot fail")
}
