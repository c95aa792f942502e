use crate::detect::backend::Detector;
use crate::detect::result::{Detection, Inference};
use crate::error::PipelineError;
use crate::frame::Frame;

/// Uniform front for any detector backend.
///
/// Guarantees callers get a detection list with confidences in [0, 1] and an
/// annotated frame with the input's dimensions. Model errors propagate as
/// `PipelineError::Detection`.
pub struct DetectionAdapter {
    backend: Box<dyn Detector>,
}

impl DetectionAdapter {
    pub fn new(backend: Box<dyn Detector>) -> Self {
        Self { backend }
    }

    pub fn from_backend<D: Detector + 'static>(backend: D) -> Self {
        Self::new(Box::new(backend))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn warm_up(&mut self) -> Result<(), PipelineError> {
        self.backend.warm_up().map_err(PipelineError::detection)
    }

    pub fn infer(&mut self, frame: &Frame) -> Result<Inference, PipelineError> {
        let mut inference = self
            .backend
            .infer(frame)
            .map_err(PipelineError::detection)?;

        if inference.annotated.dimensions() != frame.dimensions() {
            let (aw, ah) = inference.annotated.dimensions();
            return Err(PipelineError::detection(anyhow::anyhow!(
                "backend '{}' returned a {}x{} annotated frame for a {}x{} input",
                self.backend.name(),
                aw,
                ah,
                frame.width(),
                frame.height()
            )));
        }

        let before = inference.detections.len();
        inference.detections = normalize(std::mem::take(&mut inference.detections));
        if inference.detections.len() != before {
            log::warn!(
                "detector '{}' produced {} non-finite confidences; dropped",
                self.backend.name(),
                before - inference.detections.len()
            );
        }
        Ok(inference)
    }
}

fn normalize(detections: Vec<Detection>) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|d| d.confidence.is_finite())
        .map(|mut d| {
            d.confidence = d.confidence.clamp(0.0, 1.0);
            d
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::ScriptedDetector;
    use crate::detect::result::ClassNames;
    use anyhow::Result;
    use std::sync::Arc;

    struct ShrinkingDetector;

    impl Detector for ShrinkingDetector {
        fn name(&self) -> &'static str {
            "shrinking"
        }

        fn infer(&mut self, _frame: &Frame) -> Result<Inference> {
            Ok(Inference {
                annotated: Frame::filled(1, 1, [0, 0, 0]),
                detections: vec![],
                class_names: Arc::new(ClassNames::default()),
            })
        }
    }

    #[test]
    fn confidences_are_clamped_and_nan_dropped() -> Result<()> {
        let script = vec![vec![
            Detection::new(0, 1.4),
            Detection::new(0, f32::NAN),
            Detection::new(1, -0.2),
        ]];
        let mut adapter = DetectionAdapter::from_backend(ScriptedDetector::new(
            ClassNames::from_list(["crack", "spalling"]),
            script,
        ));
        let out = adapter.infer(&Frame::filled(4, 4, [0, 0, 0]))?;
        let confs: Vec<f32> = out.detections.iter().map(|d| d.confidence).collect();
        assert_eq!(confs, vec![1.0, 0.0]);
        Ok(())
    }

    #[test]
    fn empty_result_is_an_empty_list() -> Result<()> {
        let mut adapter = DetectionAdapter::from_backend(ScriptedDetector::new(
            ClassNames::from_list(["crack"]),
            vec![vec![]],
        ));
        let frame = Frame::filled(8, 6, [9, 9, 9]);
        let out = adapter.infer(&frame)?;
        assert!(out.detections.is_empty());
        assert_eq!(out.annotated.dimensions(), (8, 6));
        Ok(())
    }

    #[test]
    fn resized_annotation_is_rejected() {
        let mut adapter = DetectionAdapter::from_backend(ShrinkingDetector);
        let err = adapter
            .infer(&Frame::filled(4, 4, [0, 0, 0]))
            .expect_err("dimension mismatch");
        assert_eq!(err.kind(), "detection");
    }
}
