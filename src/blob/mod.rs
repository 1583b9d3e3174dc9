pub mod replicator;
pub mod resolver;
pub mod store;

use crate::{Error, Result};

/// A blob id is the lowercase hex SHA-256 of the uncompressed value.
/// Validated before any filesystem operation so an id can never escape
/// the store directory.
pub fn validate_blob_id(id: &str) -> Result<()> {
    if id.len() == 64 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        Ok(())
    } else {
        Err(Error::InvalidBlobId(id.to_string()))
    }
}
