//! Single-clip local storage
//!
//! Exactly one clip lives at a well-known path. Every recording and every
//! received clip replaces it.

use bytes::Bytes;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

use super::mp4;
use crate::{Error, Result};

/// Metadata of the stored clip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipInfo {
    pub size_bytes: u64,
    /// Human readable size, e.g. "2.4 MB"
    pub size_display: String,
    /// Display width/height of the first video track, when the clip is a movie file
    pub dimensions: Option<(u32, u32)>,
}

impl fmt::Display for ClipInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some((w, h)) = self.dimensions {
            writeln!(f, "Width: {}", w)?;
            writeln!(f, "Height: {}", h)?;
        }
        write!(f, "Size: {}", self.size_display)
    }
}

/// Format a byte count with decimal units
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1000 {
        return if bytes == 1 {
            "1 byte".to_string()
        } else {
            format!("{} bytes", bytes)
        };
    }

    let mut value = bytes as f64 / 1000.0;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    let text = format!("{:.1}", value);
    let text = text.strip_suffix(".0").unwrap_or(&text);
    format!("{} {}", text, UNITS[unit])
}

/// Owns the clip path
#[derive(Debug, Clone)]
pub struct ClipStore {
    path: PathBuf,
}

impl ClipStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Replace the stored clip with `bytes`.
    ///
    /// Written to a sibling temp file first, so a reader never sees a
    /// partially written clip.
    pub async fn replace(&self, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.path.with_extension("partial");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &self.path).await?;
        info!(path = %self.path.display(), bytes = bytes.len(), "Clip stored");
        Ok(())
    }

    /// Whole clip in memory
    pub async fn read(&self) -> Result<Bytes> {
        match fs::read(&self.path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::NotFound(self.path.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Size and, for movie files, display dimensions of the stored clip
    pub async fn info(&self) -> Result<ClipInfo> {
        let data = self.read().await?;
        let size_bytes = data.len() as u64;
        Ok(ClipInfo {
            size_bytes,
            size_display: format_size(size_bytes),
            dimensions: mp4::probe_dimensions(&data),
        })
    }
}
