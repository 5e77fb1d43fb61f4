//! Local filesystem source handler.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::{ByteStream, SourceError, SourceHandler, SourceResult};

/// Source handler rooted at a local directory. File paths from the
/// catalog are resolved relative to the base path.
pub struct LocalSource {
    base_path: PathBuf,
}

impl LocalSource {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }
}

#[async_trait]
impl SourceHandler for LocalSource {
    async fn open(&self, path: &str, offset: u64, length: u64) -> SourceResult<ByteStream> {
        let full = self.full_path(path);
        let mut file = fs::File::open(&full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SourceError::Unavailable(format!("{} not found", full.display()))
            } else {
                SourceError::Io(e)
            }
        })?;

        let file_size = file.metadata().await?.len();
        if offset + length > file_size {
            return Err(SourceError::Corrupt(format!(
                "range {}..{} exceeds size {} of {}",
                offset,
                offset + length,
                file_size,
                full.display()
            )));
        }

        file.seek(std::io::SeekFrom::Start(offset)).await?;
        Ok(Box::new(file.take(length)))
    }

    async fn remove(&self, path: &str) -> SourceResult<()> {
        let full = self.full_path(path);
        match fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()), // Already removed
            Err(e) => Err(SourceError::Io(e)),
        }
    }

    fn remote(&self, path: &str) -> String {
        self.full_path(path).display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_open_honors_offset_and_length() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a.bin"), b"0123456789")
            .await
            .unwrap();
        let source = LocalSource::new(temp_dir.path().to_path_buf());

        let mut stream = source.open("a.bin", 2, 5).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"23456");
    }

    #[tokio::test]
    async fn test_open_rejects_range_past_eof() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a.bin"), b"0123456789")
            .await
            .unwrap();
        let source = LocalSource::new(temp_dir.path().to_path_buf());

        let result = source.open("a.bin", 8, 5).await;
        assert!(matches!(result, Err(SourceError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_missing_file_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let source = LocalSource::new(temp_dir.path().to_path_buf());

        let result = source.open("missing.bin", 0, 1).await;
        assert!(matches!(result, Err(SourceError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a.bin"), b"x").await.unwrap();
        let source = LocalSource::new(temp_dir.path().to_path_buf());

        source.remove("a.bin").await.unwrap();
        source.remove("a.bin").await.unwrap();
        assert!(!temp_dir.path().join("a.bin").exists());
    }
}
