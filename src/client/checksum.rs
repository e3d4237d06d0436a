//! Whole-payload SHA-256, computed once before any part is sent.

use base64::{Engine as _, engine::general_purpose};
use sha2::{Digest, Sha256};
use std::io;
use tokio::{fs::File, io::AsyncReadExt};

use super::payload::Payload;

const READ_BUFFER_LEN: usize = 1024 * 1024;

/// Base64 SHA-256 of the whole payload; the integrity contract declared at
/// initiation and checked by the store at finalize.
pub async fn sha256_base64(payload: &Payload) -> io::Result<String> {
    let mut hasher = Sha256::new();
    match payload {
        Payload::Memory(bytes) => hasher.update(bytes),
        Payload::File { path, .. } => {
            let mut file = File::open(path).await?;
            let mut buf = vec![0u8; READ_BUFFER_LEN];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }
    }
    Ok(general_purpose::STANDARD.encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn known_digest() {
        let digest = sha256_base64(&Payload::from_bytes(&b"abc"[..])).await.unwrap();
        assert_eq!(digest, "ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0=");
    }

    #[tokio::test]
    async fn file_digest_matches_memory_digest() {
        let data = vec![7u8; 3 * READ_BUFFER_LEN + 17];
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.mp4");
        tokio::fs::write(&path, &data).await.unwrap();

        let from_file = sha256_base64(&Payload::from_file(&path).await.unwrap()).await.unwrap();
        let from_memory = sha256_base64(&Payload::from_bytes(data)).await.unwrap();
        assert_eq!(from_file, from_memory);
    }
}
