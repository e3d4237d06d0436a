//! Payload sources: an in-memory buffer or a file on disk, read by range.

use bytes::Bytes;
use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};

use crate::models::multipart::ByteRange;

#[derive(Debug, Clone)]
pub enum Payload {
    Memory(Bytes),
    File { path: PathBuf, len: u64 },
}

impl Payload {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Payload::Memory(bytes.into())
    }

    pub async fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let len = tokio::fs::metadata(&path).await?.len();
        Ok(Payload::File { path, len })
    }

    pub fn len(&self) -> u64 {
        match self {
            Payload::Memory(bytes) => bytes.len() as u64,
            Payload::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read `[range.start, range.end)`. Each call opens its own file handle
    /// so concurrent workers never share a cursor.
    pub async fn read_range(&self, range: ByteRange) -> io::Result<Bytes> {
        if range.end > self.len() || range.start > range.end {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("range {}..{} outside payload of {} bytes", range.start, range.end, self.len()),
            ));
        }
        match self {
            Payload::Memory(bytes) => Ok(bytes.slice(range.start as usize..range.end as usize)),
            Payload::File { path, .. } => {
                let mut file = File::open(path).await?;
                file.seek(SeekFrom::Start(range.start)).await?;
                let mut buf = vec![0u8; range.len() as usize];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }

    pub async fn read_all(&self) -> io::Result<Bytes> {
        self.read_range(ByteRange::new(0, self.len())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_and_memory_ranges_agree() {
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.webm");
        tokio::fs::write(&path, &data).await.unwrap();

        let file = Payload::from_file(&path).await.unwrap();
        let memory = Payload::from_bytes(data.clone());
        assert_eq!(file.len(), 10_000);

        let range = ByteRange::new(4_000, 7_500);
        assert_eq!(
            file.read_range(range).await.unwrap(),
            memory.read_range(range).await.unwrap()
        );
        assert_eq!(&file.read_all().await.unwrap()[..], &data[..]);
    }

    #[tokio::test]
    async fn out_of_bounds_range_is_an_error() {
        let payload = Payload::from_bytes(vec![1u8; 10]);
        assert!(payload.read_range(ByteRange::new(5, 11)).await.is_err());
    }
}
