mod adapter;
pub mod annotate;
mod backend;
pub mod backends;
mod result;

pub use adapter::DetectionAdapter;
pub use backend::Detector;
pub use backends::{build_detector, ScriptedDetector};
pub use result::{BoundingBox, ClassNames, Detection, Inference};
