use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::PipelineError;
use crate::frame::Frame;

/// One detected defect instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    /// Confidence in [0, 1].
    pub confidence: f32,
    /// Box in frame pixel coordinates, when the backend provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
}

impl Detection {
    pub fn new(class_id: u32, confidence: f32) -> Self {
        Self {
            class_id,
            confidence,
            bbox: None,
        }
    }

    pub fn with_bbox(mut self, bbox: BoundingBox) -> Self {
        self.bbox = Some(bbox);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Class id to name lookup shipped by the detector.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassNames {
    names: BTreeMap<u32, String>,
}

impl ClassNames {
    pub fn new(names: BTreeMap<u32, String>) -> Self {
        Self { names }
    }

    /// Names indexed by position, the way YOLO exports list them.
    pub fn from_list<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names
                .into_iter()
                .enumerate()
                .map(|(idx, name)| (idx as u32, name.into()))
                .collect(),
        }
    }

    pub fn resolve(&self, class_id: u32) -> Result<&str, PipelineError> {
        self.names
            .get(&class_id)
            .map(String::as_str)
            .ok_or(PipelineError::UnknownClass(class_id))
    }

    /// Label used when a class id cannot be resolved.
    pub fn fallback_label(class_id: u32) -> String {
        format!("class_{}", class_id)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Output of one detector call.
#[derive(Clone, Debug)]
pub struct Inference {
    /// Input frame with detections drawn on it. Same dimensions as the input.
    pub annotated: Frame,
    pub detections: Vec<Detection>,
    pub class_names: Arc<ClassNames>,
}
