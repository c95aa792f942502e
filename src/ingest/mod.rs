//! Frame ingestion sources.
//!
//! - Still images on disk, served once or repeatedly
//! - Synthetic `stub://` frames (testing)
//! - USB/V4L2 devices (feature: ingest-v4l2)
//!
//! Every source follows the same lifecycle: `connect`, then `next_frame`
//! until it returns `None` or an error, then `release`. The polling task in
//! [`poller`] drives that lifecycle on its own thread.

use anyhow::{anyhow, Result};

use crate::config::CameraSettings;
use crate::frame::Frame;

pub mod file;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod poller;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use file::{FileConfig, FileSource};
pub use poller::{CameraPoller, FrameSink, PollExit, PollerHandle};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::{V4l2Config, V4l2Source};

/// A camera or image source with an explicit open / poll / release lifecycle.
pub trait FrameSource {
    /// Device path or URL, for status lines.
    fn describe(&self) -> String;

    fn connect(&mut self) -> Result<()>;

    /// Next frame, or `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Give the device back. Safe to call more than once.
    fn release(&mut self);

    fn is_healthy(&self) -> bool;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        (**self).next_frame()
    }

    fn release(&mut self) {
        (**self).release()
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }
}

/// Pick a source for `device`: `stub://` and image paths use [`FileSource`],
/// `/dev/video*` nodes use V4L2.
pub fn open_source(device: &str, camera: &CameraSettings) -> Result<Box<dyn FrameSource + Send>> {
    if device.starts_with("/dev/") {
        #[cfg(feature = "ingest-v4l2")]
        {
            return Ok(Box::new(V4l2Source::new(V4l2Config {
                device: device.to_string(),
                target_fps: fps_for(camera.poll_interval),
                width: camera.width,
                height: camera.height,
            })));
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            return Err(anyhow!(
                "camera device {} requires the ingest-v4l2 feature",
                device
            ));
        }
    }
    if device.trim().is_empty() {
        return Err(anyhow!("no camera device configured"));
    }
    Ok(Box::new(FileSource::new(FileConfig {
        path: device.to_string(),
        repeat: true,
        width: camera.width,
        height: camera.height,
    })?))
}

#[cfg(feature = "ingest-v4l2")]
fn fps_for(interval: std::time::Duration) -> u32 {
    let millis = interval.as_millis().max(1) as u32;
    (1000 / millis).clamp(1, 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn camera() -> CameraSettings {
        CameraSettings {
            device: "stub://camera".to_string(),
            poll_interval: Duration::from_millis(30),
            width: 64,
            height: 48,
        }
    }

    #[test]
    fn stub_device_opens_synthetic_source() -> Result<()> {
        let mut source = open_source("stub://camera", &camera())?;
        source.connect()?;
        let frame = source.next_frame()?.expect("frame");
        assert_eq!(frame.dimensions(), (64, 48));
        source.release();
        Ok(())
    }

    #[test]
    fn empty_device_is_rejected() {
        assert!(open_source("  ", &camera()).is_err());
    }

    #[cfg(not(feature = "ingest-v4l2"))]
    #[test]
    fn video_node_needs_feature() {
        assert!(open_source("/dev/video0", &camera()).is_err());
    }
}
