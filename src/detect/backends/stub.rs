use anyhow::Result;
use std::sync::Arc;

use crate::detect::annotate::draw_detections;
use crate::detect::backend::Detector;
use crate::detect::result::{ClassNames, Detection, Inference};
use crate::frame::Frame;

/// Stub backend for tests and dry runs.
///
/// Replays a fixed script of per-frame detection lists, cycling when it runs
/// out. An empty script yields no detections.
pub struct ScriptedDetector {
    class_names: Arc<ClassNames>,
    script: Vec<Vec<Detection>>,
    cursor: usize,
}

impl ScriptedDetector {
    pub fn new(class_names: ClassNames, script: Vec<Vec<Detection>>) -> Self {
        Self {
            class_names: Arc::new(class_names),
            script,
            cursor: 0,
        }
    }

    /// Number of frames served so far.
    pub fn frames_served(&self) -> usize {
        self.cursor
    }
}

impl Detector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(&mut self, frame: &Frame) -> Result<Inference> {
        let detections = if self.script.is_empty() {
            Vec::new()
        } else {
            self.script[self.cursor % self.script.len()].clone()
        };
        self.cursor += 1;

        Ok(Inference {
            annotated: draw_detections(frame, &detections),
            detections,
            class_names: self.class_names.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_cycles() -> Result<()> {
        let mut backend = ScriptedDetector::new(
            ClassNames::from_list(["crack"]),
            vec![vec![Detection::new(0, 0.9)], vec![]],
        );
        let frame = Frame::filled(4, 4, [0, 0, 0]);

        assert_eq!(backend.infer(&frame)?.detections.len(), 1);
        assert!(backend.infer(&frame)?.detections.is_empty());
        assert_eq!(backend.infer(&frame)?.detections.len(), 1);
        assert_eq!(backend.frames_served(), 3);
        Ok(())
    }
}
