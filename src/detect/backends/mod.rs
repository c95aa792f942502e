pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::ScriptedDetector;

#[cfg(feature = "backend-tract")]
pub use tract::TractYoloBackend;

use anyhow::{anyhow, Result};

use crate::config::DetectorSettings;
use crate::detect::backend::Detector;
use crate::detect::result::{ClassNames, Detection};

/// Build the backend named in the detector settings.
pub fn build_detector(settings: &DetectorSettings) -> Result<Box<dyn Detector>> {
    let class_names = ClassNames::from_list(settings.class_names.iter().cloned());
    match settings.backend.as_str() {
        "stub" => {
            log::warn!("using stub detector; detections are scripted, not inferred");
            Ok(Box::new(ScriptedDetector::new(class_names, demo_script())))
        }
        "tract" => build_tract(settings, class_names),
        other => Err(anyhow!("unknown detector backend '{}'", other)),
    }
}

#[cfg(feature = "backend-tract")]
fn build_tract(settings: &DetectorSettings, class_names: ClassNames) -> Result<Box<dyn Detector>> {
    let model_path = settings
        .model_path
        .as_ref()
        .ok_or_else(|| anyhow!("detector backend 'tract' requires model_path"))?;
    let backend = TractYoloBackend::new(model_path, settings.input_size, class_names)?
        .with_confidence_floor(settings.confidence_floor)
        .with_iou_threshold(settings.iou_threshold);
    Ok(Box::new(backend))
}

#[cfg(not(feature = "backend-tract"))]
fn build_tract(_settings: &DetectorSettings, _class_names: ClassNames) -> Result<Box<dyn Detector>> {
    Err(anyhow!(
        "detector backend 'tract' requires the backend-tract feature"
    ))
}

/// Script for dry runs: a frame with cracks and spalling, then a clean frame.
fn demo_script() -> Vec<Vec<Detection>> {
    vec![
        vec![
            Detection::new(0, 0.7),
            Detection::new(0, 0.4),
            Detection::new(1, 0.95),
        ],
        Vec::new(),
    ]
}
