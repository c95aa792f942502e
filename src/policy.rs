use crate::detect::Detection;
use crate::error::PipelineError;

/// True iff at least one detection is strictly above `threshold`.
pub fn is_significant(detections: &[Detection], threshold: f32) -> bool {
    detections.iter().any(|d| d.confidence > threshold)
}

/// Decides which frames are captured as evidence.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EpisodePolicy {
    threshold: f32,
}

impl EpisodePolicy {
    pub fn new(threshold: f32) -> Result<Self, PipelineError> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(PipelineError::Configuration(format!(
                "significance threshold must be within [0, 1], got {}",
                threshold
            )));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn is_significant(&self, detections: &[Detection]) -> bool {
        is_significant(detections, self.threshold)
    }
}
