use anyhow::Result;

use crate::detect::result::Inference;
use crate::frame::Frame;

/// Detector backend trait.
///
/// A backend wraps one object/segmentation model. It receives a decoded frame
/// and returns the annotated frame, the detections, and the class-name lookup
/// that goes with the model. Calls are blocking; the pipeline runs them on its
/// own worker thread.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run the model on a frame.
    fn infer(&mut self, frame: &Frame) -> Result<Inference>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn infer(&mut self, frame: &Frame) -> Result<Inference> {
        (**self).infer(frame)
    }

    fn warm_up(&mut self) -> Result<()> {
        (**self).warm_up()
    }
}
