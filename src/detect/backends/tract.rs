#![cfg(feature = "backend-tract")]

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use crate::detect::annotate::draw_detections;
use crate::detect::backend::Detector;
use crate::detect::result::{BoundingBox, ClassNames, Detection, Inference};
use crate::frame::Frame;

const MAX_DETECTIONS: usize = 100;

/// Tract-based backend for YOLO ONNX exports (detect or segment heads).
///
/// Loads a local model file once and runs it on every frame. The first output
/// is decoded as `[1, 4 + classes (+ mask coefficients), anchors]`; mask
/// prototypes, when present, are ignored.
pub struct TractYoloBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    class_names: Arc<ClassNames>,
    confidence_floor: f32,
    iou_threshold: f32,
}

impl TractYoloBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        input_size: u32,
        class_names: ClassNames,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        if class_names.is_empty() {
            return Err(anyhow!("YOLO backend needs at least one class name"));
        }
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(0, f32::fact([1, 3, side, side]).into())
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            class_names: Arc::new(class_names),
            confidence_floor: 0.25,
            iou_threshold: 0.45,
        })
    }

    /// Minimum score for a candidate to survive decoding.
    pub fn with_confidence_floor(mut self, floor: f32) -> Self {
        self.confidence_floor = floor;
        self
    }

    pub fn with_iou_threshold(mut self, iou: f32) -> Self {
        self.iou_threshold = iou;
        self
    }

    fn build_input(&self, frame: &Frame) -> Tensor {
        let side = self.input_size;
        let resized = imageops::resize(frame.image(), side, side, FilterType::Triangle);
        let side = side as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0
        });
        input.into_tensor()
    }

    fn decode(&self, outputs: TVec<TValue>, frame: &Frame) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("expected a rank-3 YOLO output")?;

        let nc = self.class_names.len();
        let (rows, cols) = (view.shape()[1], view.shape()[2]);
        // Exports disagree on whether anchors are the last or middle axis.
        let (channels, anchors, transposed) = if rows <= cols {
            (rows, cols, false)
        } else {
            (cols, rows, true)
        };
        if channels < 4 + nc {
            return Err(anyhow!(
                "output has {} channels, need at least {} for {} classes",
                channels,
                4 + nc,
                nc
            ));
        }
        let at = |channel: usize, anchor: usize| -> f32 {
            if transposed {
                view[[0, anchor, channel]]
            } else {
                view[[0, channel, anchor]]
            }
        };

        let sx = frame.width() as f32 / self.input_size as f32;
        let sy = frame.height() as f32 / self.input_size as f32;
        let mut candidates = Vec::new();
        for anchor in 0..anchors {
            let (class_id, score) = (0..nc)
                .map(|c| (c, at(4 + c, anchor)))
                .fold((0usize, f32::NEG_INFINITY), |best, cur| {
                    if cur.1 > best.1 {
                        cur
                    } else {
                        best
                    }
                });
            if !(score >= self.confidence_floor) {
                continue;
            }
            let (cx, cy, w, h) = (at(0, anchor), at(1, anchor), at(2, anchor), at(3, anchor));
            candidates.push(Detection::new(class_id as u32, score).with_bbox(BoundingBox {
                x1: (cx - w / 2.0) * sx,
                y1: (cy - h / 2.0) * sy,
                x2: (cx + w / 2.0) * sx,
                y2: (cy + h / 2.0) * sy,
            }));
        }

        Ok(non_max_suppression(
            candidates,
            self.iou_threshold,
            MAX_DETECTIONS,
        ))
    }
}

/// Greedy per-class NMS, highest score first.
pub(crate) fn non_max_suppression(
    mut candidates: Vec<Detection>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for cand in candidates {
        if kept.len() >= max_detections {
            break;
        }
        let overlaps = kept.iter().any(|k| {
            k.class_id == cand.class_id
                && match (k.bbox, cand.bbox) {
                    (Some(a), Some(b)) => a.iou(&b) > iou_threshold,
                    _ => false,
                }
        });
        if !overlaps {
            kept.push(cand);
        }
    }
    kept
}

impl Detector for TractYoloBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn infer(&mut self, frame: &Frame) -> Result<Inference> {
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let detections = self.decode(outputs, frame)?;

        Ok(Inference {
            annotated: draw_detections(frame, &detections),
            detections,
            class_names: self.class_names.clone(),
        })
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = Frame::filled(self.input_size, self.input_size, [114, 114, 114]);
        self.infer(&blank).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(class_id: u32, confidence: f32, x1: f32) -> Detection {
        Detection::new(class_id, confidence).with_bbox(BoundingBox {
            x1,
            y1: 0.0,
            x2: x1 + 10.0,
            y2: 10.0,
        })
    }

    #[test]
    fn nms_suppresses_same_class_overlap_only() {
        let kept = non_max_suppression(
            vec![boxed(0, 0.6, 1.0), boxed(0, 0.9, 0.0), boxed(1, 0.7, 0.0)],
            0.45,
            10,
        );
        let summary: Vec<(u32, f32)> = kept.iter().map(|d| (d.class_id, d.confidence)).collect();
        assert_eq!(summary, vec![(0, 0.9), (1, 0.7)]);
    }
}
