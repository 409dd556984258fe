//! Credential hashing.

use sha2::{Digest, Sha224};

/// SHA-224 of a password as lowercase hex: the 56-character credential hash
/// clients present on the wire.
pub fn sha224_hex(password: &str) -> String {
    hex::encode(Sha224::digest(password.as_bytes()))
}
