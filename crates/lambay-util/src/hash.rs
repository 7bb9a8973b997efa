use sha2::{Digest, Sha256};
use std::io::{self, Read};

/// Compute the SHA-256 hash of a byte slice, returning the hex-encoded digest.
#[must_use]
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute the SHA-256 hash of everything a reader yields, returning the
/// hex-encoded digest.
///
/// Streams the content to keep memory usage bounded.
///
/// # Errors
/// Returns an error if the reader fails.
pub fn sha256_stream<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
