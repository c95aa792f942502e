//! crackwatch
//!
//! Structural-defect detection aggregation and episode reporting.
//!
//! # Architecture
//!
//! Frames come from a source (still image, synthetic stub, V4L2 camera) and
//! pass through:
//!
//! 1. **Detection**: an object-detection backend produces per-frame
//!    detections, normalized by [`detect::DetectionAdapter`].
//! 2. **Aggregation**: [`aggregate::FrameAggregator`] rebuilds per-class
//!    count and average confidence for the frame.
//! 3. **Policy**: [`policy::EpisodePolicy`] marks a frame significant when any
//!    confidence is strictly above the threshold.
//! 4. **Evidence**: significant frames are written as JPEG artifacts by
//!    [`evidence::EvidenceStore`] until a report cycle completes.
//! 5. **Reporting**: [`report::ReportGenerator`] asks a text-generation
//!    service for a risk narrative; [`notify::NotificationDispatcher`] mails
//!    it with the evidence. Only a successful dispatch clears the evidence.
//!
//! [`session::AggregationSession`] owns the per-episode state and
//! [`pipeline::Pipeline`] runs it on a worker thread.
//!
//! # Module Structure
//!
//! - `frame`: decoded RGB frames and JPEG encoding
//! - `detect`: detector trait, adapter, backends (stub, tract ONNX)
//! - `ingest`: frame sources and the camera polling task
//! - `config`: TOML + env configuration
//! - `error`: the pipeline error taxonomy

pub mod aggregate;
pub mod config;
pub mod detect;
pub mod error;
pub mod evidence;
pub mod frame;
pub mod ingest;
pub mod notify;
pub mod pipeline;
pub mod policy;
pub mod report;
pub mod session;

pub use aggregate::{ClassSummary, FrameAggregator};
pub use config::CrackwatchConfig;
pub use detect::{ClassNames, Detection, DetectionAdapter, Detector, Inference};
pub use error::PipelineError;
pub use evidence::{EvidenceRecord, EvidenceStore};
pub use frame::Frame;
pub use notify::{MailSender, NotificationDispatcher, OutgoingMail};
pub use pipeline::{Pipeline, PipelineHandle, PipelineOptions, StatusUpdate};
pub use policy::{is_significant, EpisodePolicy};
pub use report::{NarrativeGenerator, Report, ReportGenerator};
pub use session::{AggregationSession, FrameOutcome, SessionSnapshot};
