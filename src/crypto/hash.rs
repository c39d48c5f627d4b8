// Cryptographic Hashing Wrappers
use sha2::{Digest, Sha256};

/// SHA-256: Single round, building block for the double hash
pub fn hash_sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256d: sha256(sha256(data)), used for frame checksums and block hashes
pub fn hash_sha256d(data: &[u8]) -> [u8; 32] {
    hash_sha256(&hash_sha256(data))
}

/// Frame checksum: first 4 bytes of SHA-256d over the payload
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let h = hash_sha256d(payload);
    [h[0], h[1], h[2], h[3]]
}
