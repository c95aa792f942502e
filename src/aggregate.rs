//! Per-frame class statistics.

use serde::{Deserialize, Serialize};

use crate::detect::{ClassNames, Detection};

/// Count and mean confidence of one class within a frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassSummary {
    pub class_name: String,
    pub count: u32,
    /// Detector precision. Widening to `f64` puts float noise in the payload.
    pub avg_confidence: f32,
}

#[derive(Clone, Debug)]
struct ClassTally {
    class_id: u32,
    count: u32,
    conf_sum: f64,
}

/// Rebuilds the class summary from each frame's detections.
///
/// `update` replaces the previous summary entirely; nothing carries over from
/// one frame to the next. Entries keep the order in which classes first
/// appear in the frame.
#[derive(Debug, Default)]
pub struct FrameAggregator {
    summary: Vec<ClassSummary>,
    unresolved: Vec<u32>,
}

impl FrameAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, detections: &[Detection], names: &ClassNames) -> &[ClassSummary] {
        let mut tallies: Vec<ClassTally> = Vec::new();
        for det in detections {
            match tallies.iter_mut().find(|t| t.class_id == det.class_id) {
                Some(tally) => {
                    tally.count += 1;
                    tally.conf_sum += f64::from(det.confidence);
                }
                None => tallies.push(ClassTally {
                    class_id: det.class_id,
                    count: 1,
                    conf_sum: f64::from(det.confidence),
                }),
            }
        }

        self.unresolved.clear();
        let summary: Vec<ClassSummary> = tallies
            .into_iter()
            .map(|tally| {
                let class_name = match names.resolve(tally.class_id) {
                    Ok(name) => name.to_string(),
                    Err(err) => {
                        log::warn!("{}; using fallback label", err);
                        self.unresolved.push(tally.class_id);
                        ClassNames::fallback_label(tally.class_id)
                    }
                };
                ClassSummary {
                    class_name,
                    count: tally.count,
                    avg_confidence: (tally.conf_sum / f64::from(tally.count)) as f32,
                }
            })
            .collect();

        self.summary = summary;
        &self.summary
    }

    pub fn summary(&self) -> &[ClassSummary] {
        &self.summary
    }

    /// Class ids from the last update that had no name.
    pub fn unresolved_classes(&self) -> &[u32] {
        &self.unresolved
    }

    pub fn reset(&mut self) {
        self.summary.clear();
        self.unresolved.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> ClassNames {
        ClassNames::from_list(["crack", "spalling"])
    }

    #[test]
    fn averages_and_counts_per_class() {
        let mut agg = FrameAggregator::new();
        let dets = vec![
            Detection::new(0, 0.7),
            Detection::new(0, 0.4),
            Detection::new(1, 0.95),
        ];
        let summary = agg.update(&dets, &names()).to_vec();

        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].class_name, "crack");
        assert_eq!(summary[0].count, 2);
        assert!((summary[0].avg_confidence - 0.55).abs() < 1e-6);
        assert_eq!(summary[1].class_name, "spalling");
        assert_eq!(summary[1].count, 1);
        assert!((summary[1].avg_confidence - 0.95).abs() < 1e-6);

        let total: u32 = summary.iter().map(|s| s.count).sum();
        assert_eq!(total as usize, dets.len());
    }

    #[test]
    fn each_update_replaces_previous_summary() {
        let mut agg = FrameAggregator::new();
        agg.update(&[Detection::new(1, 0.9)], &names());
        let summary = agg.update(&[Detection::new(0, 0.3)], &names());
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].class_name, "crack");

        assert!(agg.update(&[], &names()).is_empty());
    }

    #[test]
    fn unknown_class_uses_fallback_label() {
        let mut agg = FrameAggregator::new();
        let summary = agg
            .update(&[Detection::new(4, 0.8), Detection::new(0, 0.6)], &names())
            .to_vec();
        assert_eq!(summary[0].class_name, "class_4");
        assert_eq!(summary[1].class_name, "crack");
        assert_eq!(agg.unresolved_classes(), &[4]);
    }

    #[test]
    fn serialized_mean_has_no_widening_noise() -> serde_json::Result<()> {
        let mut agg = FrameAggregator::new();
        let summary = agg.update(&[Detection::new(1, 0.92)], &names());
        let json = serde_json::to_string(summary)?;
        assert_eq!(
            json,
            r#"[{"class_name":"spalling","count":1,"avg_confidence":0.92}]"#
        );
        Ok(())
    }

    #[test]
    fn reset_clears_state() {
        let mut agg = FrameAggregator::new();
        agg.update(&[Detection::new(9, 0.8)], &names());
        agg.reset();
        assert!(agg.summary().is_empty());
        assert!(agg.unresolved_classes().is_empty());
    }
}
