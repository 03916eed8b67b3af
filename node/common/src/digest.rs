use sha2::{Digest, Sha256};

/// Compute SHA256 hash
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hex-encoded SHA256, used to fingerprint candidate sources in logs and evidence
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}
