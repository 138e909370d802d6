//! Persistence of binary frames received during a session.

use std::path::{Path, PathBuf};

/// Writes one file per binary frame, numbered in arrival order.
#[derive(Debug)]
pub struct ArtifactStore {
    dir: PathBuf,
    count: usize,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            count: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of artifacts written so far.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Write `bytes` exactly as received and return the file path.
    pub async fn persist(&mut self, bytes: &[u8]) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let index = self.count + 1;
        let path = self
            .dir
            .join(format!("image-{:04}.{}", index, extension_for(bytes)));
        tokio::fs::write(&path, bytes).await?;
        self.count = index;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "Stored artifact");
        Ok(path)
    }
}

/// File extension from the image magic bytes.
fn extension_for(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        "png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "jpg"
    } else {
        "bin"
    }
}
