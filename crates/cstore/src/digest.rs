//! Digest helpers for big-data items.
//!
//! The store never recomputes digests from content: whatever the caller's
//! digest function returns at write time is recorded. Stored digests are only
//! checked syntactically when they are read back.

use oci_spec::image::Digest;
use oci_spec::OciSpecError;
use sha2::{Digest as _, Sha256};

use crate::error::{Result, StorageError};

/// Compute the canonical (`sha256`) digest of `data`.
///
/// This has the shape expected by the big-data `set` operations, so it can be
/// passed directly as the digest function.
pub fn from_bytes(data: &[u8]) -> std::result::Result<Digest, OciSpecError> {
    format!("sha256:{}", hex::encode(Sha256::digest(data))).parse()
}

/// Validate a stored digest string for the big-data item `name`.
pub fn parse(name: &str, digest: &str) -> Result<Digest> {
    digest
        .parse::<Digest>()
        .map_err(|e| StorageError::InvalidDigest {
            name: name.to_string(),
            digest: digest.to_string(),
            reason: e.to_string(),
        })
}
