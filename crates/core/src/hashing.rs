//! SHA-256 fingerprints of submitted graphs.
//!
//! A snapshot's hash covers the exact JSON bytes sent to the server, so
//! two runs with the same hash executed the same graph.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}
