//! Episode state for one run of the pipeline.

use std::path::PathBuf;

use crate::aggregate::{ClassSummary, FrameAggregator};
use crate::detect::Inference;
use crate::error::PipelineError;
use crate::evidence::EvidenceStore;
use crate::frame::Frame;
use crate::notify::NotificationDispatcher;
use crate::policy::EpisodePolicy;
use crate::report::{Report, ReportGenerator};

/// What happened to one frame.
#[derive(Debug)]
pub struct FrameOutcome {
    pub summary: Vec<ClassSummary>,
    pub significant: bool,
    /// Artifact written for this frame, if it was captured.
    pub evidence: Option<PathBuf>,
    /// Non-fatal problems: unknown classes, a failed capture.
    pub warnings: Vec<PipelineError>,
}

/// Copy of the session state for readers on other threads.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionSnapshot {
    pub episode: u32,
    pub summary: Vec<ClassSummary>,
    pub reportable_summary: Vec<ClassSummary>,
    pub evidence: Vec<PathBuf>,
    pub frames_processed: u64,
}

/// Aggregation, policy, and evidence for one episode.
///
/// Construction starts an episode; `reset` ends it. Only the owning thread
/// mutates the session.
pub struct AggregationSession {
    aggregator: FrameAggregator,
    policy: EpisodePolicy,
    evidence: EvidenceStore,
    capture_annotated: bool,
    /// Summary of the most recent significant frame.
    reportable: Vec<ClassSummary>,
    frames_processed: u64,
}

impl AggregationSession {
    pub fn new(policy: EpisodePolicy, evidence: EvidenceStore) -> Self {
        Self {
            aggregator: FrameAggregator::new(),
            policy,
            evidence,
            capture_annotated: false,
            reportable: Vec::new(),
            frames_processed: 0,
        }
    }

    /// Persist the annotated frame instead of the raw input.
    pub fn capture_annotated(mut self, enabled: bool) -> Self {
        self.capture_annotated = enabled;
        self
    }

    pub fn policy(&self) -> &EpisodePolicy {
        &self.policy
    }

    pub fn evidence(&self) -> &EvidenceStore {
        &self.evidence
    }

    pub fn summary(&self) -> &[ClassSummary] {
        self.aggregator.summary()
    }

    /// Summary that a report would carry: the last significant frame's, or
    /// the current one when nothing significant happened yet.
    pub fn reportable_summary(&self) -> &[ClassSummary] {
        if self.reportable.is_empty() {
            self.aggregator.summary()
        } else {
            &self.reportable
        }
    }

    pub fn process(&mut self, frame: &Frame, inference: &Inference) -> FrameOutcome {
        self.frames_processed += 1;
        let summary = self
            .aggregator
            .update(&inference.detections, &inference.class_names)
            .to_vec();
        let mut warnings: Vec<PipelineError> = self
            .aggregator
            .unresolved_classes()
            .iter()
            .map(|id| PipelineError::UnknownClass(*id))
            .collect();

        let significant = self.policy.is_significant(&inference.detections);
        let mut evidence = None;
        if significant {
            self.reportable = summary.clone();
            let to_store = if self.capture_annotated {
                &inference.annotated
            } else {
                frame
            };
            match self.evidence.capture(to_store) {
                Ok(path) => {
                    log::info!(
                        "significant detection (threshold {}); evidence #{} at {}",
                        self.policy.threshold(),
                        self.evidence.len(),
                        path.display()
                    );
                    evidence = Some(path);
                }
                Err(err) => {
                    log::error!("{}", err);
                    warnings.push(err);
                }
            }
        }

        FrameOutcome {
            summary,
            significant,
            evidence,
            warnings,
        }
    }

    /// Generate the narrative and wrap it with the episode's evidence.
    pub fn build_report(
        &self,
        generator: &ReportGenerator,
        subject_prefix: &str,
    ) -> Result<Report, PipelineError> {
        let summary = self.reportable_summary();
        let narrative = generator.generate(summary)?;
        Ok(Report::compose(
            subject_prefix,
            summary,
            narrative,
            self.evidence.list(),
        ))
    }

    /// Send the report; clear the evidence only if the send succeeded.
    pub fn dispatch(
        &mut self,
        report: &Report,
        dispatcher: &NotificationDispatcher,
    ) -> Result<(), PipelineError> {
        dispatcher.send(report)?;
        self.acknowledge(report);
        Ok(())
    }

    /// Forget the evidence a delivered report carried. Captures made after
    /// the report was built stay queued for the next one.
    pub fn acknowledge(&mut self, report: &Report) {
        self.evidence.acknowledge(report.attachments.len());
        if self.evidence.is_empty() {
            self.reportable.clear();
        }
    }

    /// End the episode: summary and evidence bookkeeping start over.
    pub fn reset(&mut self) {
        self.aggregator.reset();
        self.evidence.clear();
        self.reportable.clear();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            episode: self.evidence.episode(),
            summary: self.aggregator.summary().to_vec(),
            reportable_summary: self.reportable_summary().to_vec(),
            evidence: self.evidence.list(),
            frames_processed: self.frames_processed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{ClassNames, Detection};
    use std::sync::Arc;

    fn inference(frame: &Frame, detections: Vec<Detection>) -> Inference {
        Inference {
            annotated: frame.clone(),
            detections,
            class_names: Arc::new(ClassNames::from_list(["crack", "spalling"])),
        }
    }

    #[test]
    fn insignificant_frame_is_not_captured() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut session =
            AggregationSession::new(EpisodePolicy::new(0.5)?, EvidenceStore::new(dir.path()));
        let frame = Frame::filled(8, 8, [0, 0, 0]);
        let outcome = session.process(&frame, &inference(&frame, vec![Detection::new(0, 0.5)]));
        assert!(!outcome.significant);
        assert!(outcome.evidence.is_none());
        assert!(session.evidence().is_empty());
        assert_eq!(outcome.summary.len(), 1);
        Ok(())
    }

    #[test]
    fn unknown_class_is_a_warning() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut session =
            AggregationSession::new(EpisodePolicy::new(0.5)?, EvidenceStore::new(dir.path()));
        let frame = Frame::filled(8, 8, [0, 0, 0]);
        let outcome = session.process(&frame, &inference(&frame, vec![Detection::new(5, 0.9)]));
        assert!(outcome.significant);
        assert!(outcome.evidence.is_some());
        assert!(matches!(
            outcome.warnings.as_slice(),
            [PipelineError::UnknownClass(5)]
        ));
        assert_eq!(outcome.summary[0].class_name, "class_5");
        Ok(())
    }

    #[test]
    fn failed_capture_is_a_warning_and_processing_continues() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file")?;
        let mut session = AggregationSession::new(
            EpisodePolicy::new(0.5)?,
            EvidenceStore::new(blocker.join("evidence")),
        );
        let frame = Frame::filled(8, 8, [0, 0, 0]);

        let outcome = session.process(&frame, &inference(&frame, vec![Detection::new(0, 0.9)]));
        assert!(outcome.significant);
        assert!(outcome.evidence.is_none());
        assert!(matches!(
            outcome.warnings.as_slice(),
            [PipelineError::StorageWrite { .. }]
        ));
        assert!(session.evidence().is_empty());
        assert_eq!(session.summary()[0].class_name, "crack");

        let next = session.process(&frame, &inference(&frame, vec![Detection::new(1, 0.2)]));
        assert!(!next.significant);
        assert_eq!(session.snapshot().frames_processed, 2);
        Ok(())
    }

    #[test]
    fn reportable_summary_survives_quiet_frames() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut session =
            AggregationSession::new(EpisodePolicy::new(0.5)?, EvidenceStore::new(dir.path()));
        let frame = Frame::filled(8, 8, [0, 0, 0]);
        session.process(&frame, &inference(&frame, vec![Detection::new(1, 0.9)]));
        session.process(&frame, &inference(&frame, vec![]));

        assert!(session.summary().is_empty());
        assert_eq!(session.reportable_summary()[0].class_name, "spalling");

        session.reset();
        assert!(session.reportable_summary().is_empty());
        assert!(session.evidence().is_empty());
        Ok(())
    }
}
