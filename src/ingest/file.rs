//! Still-image frame source.
//!
//! `FileSource` serves a decoded image from disk, either once (single-image
//! inspection) or repeatedly at the poll interval. Paths starting with
//! `stub://` produce synthetic frames instead, for tests and demos.

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;

use super::FrameSource;
use crate::frame::Frame;

/// Configuration for a file source.
#[derive(Clone, Debug)]
pub struct FileConfig {
    /// Local image path, or `stub://<name>` for synthetic frames.
    pub path: String,
    /// Keep serving the same image instead of ending after one frame.
    pub repeat: bool,
    /// Size of synthetic frames.
    pub width: u32,
    pub height: u32,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            repeat: false,
            width: 640,
            height: 480,
        }
    }
}

pub struct FileSource {
    backend: FileBackend,
}

enum FileBackend {
    Synthetic(SyntheticSource),
    Image(ImageFileSource),
}

impl FileSource {
    pub fn new(config: FileConfig) -> Result<Self> {
        if !is_local_file_path(&config.path) {
            return Err(anyhow!(
                "file ingestion only supports local paths (no URL schemes)"
            ));
        }
        let backend = if config.path.starts_with("stub://") {
            FileBackend::Synthetic(SyntheticSource::new(config))
        } else {
            FileBackend::Image(ImageFileSource::new(config))
        };
        Ok(Self { backend })
    }

    pub fn stats(&self) -> FileStats {
        match &self.backend {
            FileBackend::Synthetic(source) => FileStats {
                frames_served: source.frame_count,
                path: source.config.path.clone(),
            },
            FileBackend::Image(source) => FileStats {
                frames_served: source.frame_count,
                path: source.config.path.clone(),
            },
        }
    }
}

impl FrameSource for FileSource {
    fn describe(&self) -> String {
        match &self.backend {
            FileBackend::Synthetic(source) => source.config.path.clone(),
            FileBackend::Image(source) => source.config.path.clone(),
        }
    }

    fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.connect(),
            FileBackend::Image(source) => source.connect(),
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.next_frame(),
            FileBackend::Image(source) => source.next_frame(),
        }
    }

    fn release(&mut self) {
        match &mut self.backend {
            FileBackend::Synthetic(_) => {}
            FileBackend::Image(source) => source.image = None,
        }
    }

    fn is_healthy(&self) -> bool {
        match &self.backend {
            FileBackend::Synthetic(_) => true,
            FileBackend::Image(source) => source.image.is_some(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FileStats {
    pub frames_served: u64,
    pub path: String,
}

// ----------------------------------------------------------------------------
// Image on disk
// ----------------------------------------------------------------------------

struct ImageFileSource {
    config: FileConfig,
    image: Option<Frame>,
    frame_count: u64,
}

impl ImageFileSource {
    fn new(config: FileConfig) -> Self {
        Self {
            config,
            image: None,
            frame_count: 0,
        }
    }

    fn connect(&mut self) -> Result<()> {
        let path = PathBuf::from(&self.config.path);
        let frame = Frame::load(&path)
            .with_context(|| format!("open image source {}", path.display()))?;
        log::info!(
            "FileSource: loaded {} ({}x{})",
            path.display(),
            frame.width(),
            frame.height()
        );
        self.image = Some(frame);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let image = self.image.as_ref().context("image source not connected")?;
        if self.frame_count > 0 && !self.config.repeat {
            return Ok(None);
        }
        self.frame_count += 1;
        Ok(Some(image.clone()))
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticSource {
    config: FileConfig,
    frame_count: u64,
}

impl SyntheticSource {
    fn new(config: FileConfig) -> Self {
        Self {
            config,
            frame_count: 0,
        }
    }

    fn connect(&mut self) -> Result<()> {
        log::info!("FileSource: connected to {} (synthetic)", self.config.path);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.frame_count > 0 && !self.config.repeat {
            return Ok(None);
        }
        self.frame_count += 1;
        let shade = (self.frame_count % 256) as u8;
        Ok(Some(Frame::filled(
            self.config.width,
            self.config.height,
            [shade, 128, 255 - shade],
        )))
    }
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with("stub://") {
        return true;
    }
    !path.contains("://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_remote_urls() {
        let config = FileConfig {
            path: "https://example.com/wall.jpg".to_string(),
            ..FileConfig::default()
        };
        assert!(FileSource::new(config).is_err());
    }

    #[test]
    fn single_image_ends_after_one_frame() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("wall.png");
        Frame::filled(12, 10, [90, 90, 90]).image().save(&path)?;

        let mut source = FileSource::new(FileConfig {
            path: path.to_string_lossy().into_owned(),
            ..FileConfig::default()
        })?;
        source.connect()?;
        let frame = source.next_frame()?.expect("first frame");
        assert_eq!(frame.dimensions(), (12, 10));
        assert!(source.next_frame()?.is_none());

        source.release();
        assert!(!source.is_healthy());
        Ok(())
    }

    #[test]
    fn missing_image_fails_to_connect() -> Result<()> {
        let mut source = FileSource::new(FileConfig {
            path: "/nonexistent/wall.jpg".to_string(),
            ..FileConfig::default()
        })?;
        assert!(source.connect().is_err());
        Ok(())
    }

    #[test]
    fn synthetic_source_repeats() -> Result<()> {
        let mut source = FileSource::new(FileConfig {
            path: "stub://camera".to_string(),
            repeat: true,
            width: 32,
            height: 24,
        })?;
        source.connect()?;
        for _ in 0..3 {
            let frame = source.next_frame()?.expect("synthetic frame");
            assert_eq!(frame.dimensions(), (32, 24));
        }
        assert_eq!(source.stats().frames_served, 3);
        Ok(())
    }
}
