//! Screenshot sources.
//!
//! Capturing the desktop belongs to the executor. The verifier only needs the
//! most recent image, so the stock provider reads it back from the run folder.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Source of the current desktop image.
#[async_trait]
pub trait ScreenshotProvider: Send + Sync {
    /// Return the encoded image bytes, or `None` when no image is available.
    async fn capture(&self) -> std::io::Result<Option<Vec<u8>>>;
}

/// Reads the most recently modified `.png`/`.jpg`/`.jpeg` in a folder.
#[derive(Debug, Clone)]
pub struct LatestScreenshot {
    folder: PathBuf,
}

impl LatestScreenshot {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
        }
    }

    /// Path of the newest image file, if any.
    pub async fn latest_path(&self) -> std::io::Result<Option<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.folder).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut newest: Option<(SystemTime, PathBuf)> = None;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_image(&path) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let replace = match &newest {
                Some((best, best_path)) => {
                    modified > *best || (modified == *best && path > *best_path)
                }
                None => true,
            };
            if replace {
                newest = Some((modified, path));
            }
        }
        Ok(newest.map(|(_, path)| path))
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg"))
        .unwrap_or(false)
}

#[async_trait]
impl ScreenshotProvider for LatestScreenshot {
    async fn capture(&self) -> std::io::Result<Option<Vec<u8>>> {
        let Some(path) = self.latest_path().await? else {
            tracing::debug!(folder = %self.folder.display(), "No screenshot found");
            return Ok(None);
        };
        tracing::debug!(path = %path.display(), "Using screenshot");
        let bytes = tokio::fs::read(&path).await?;
        Ok(Some(bytes))
    }
}
