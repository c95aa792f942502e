//! Error taxonomy for the detection and reporting pipeline.
//!
//! Every variant is recoverable at the pipeline boundary: callers turn it into
//! a status line and keep running.

use std::path::PathBuf;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Deployment configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A credential environment variable is unset or empty.
    #[error("credential not configured: set {0}")]
    MissingCredential(String),

    /// An evidence artifact could not be written.
    #[error("failed to write evidence artifact {}: {source}", path.display())]
    StorageWrite {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// The text-generation collaborator failed or timed out.
    #[error("report generation failed: {0}")]
    Service(#[source] BoxError),

    /// The mail transport rejected or could not deliver the report.
    #[error("report dispatch failed: {0}")]
    Dispatch(#[source] BoxError),

    /// The detector returned a class id missing from its name lookup.
    #[error("detector returned unknown class id {0}")]
    UnknownClass(u32),

    /// The detection model rejected the frame.
    #[error("detection failed: {0}")]
    Detection(#[source] BoxError),

    /// The frame source could not be opened.
    #[error("failed to open frame source {device}: {source}")]
    CameraOpen {
        device: String,
        #[source]
        source: BoxError,
    },

    /// The frame source failed after it was opened.
    #[error("frame source error: {0}")]
    Source(#[source] BoxError),
}

impl PipelineError {
    pub fn service(err: impl Into<BoxError>) -> Self {
        Self::Service(err.into())
    }

    pub fn dispatch(err: impl Into<BoxError>) -> Self {
        Self::Dispatch(err.into())
    }

    pub fn detection(err: impl Into<BoxError>) -> Self {
        Self::Detection(err.into())
    }

    /// Short machine-friendly label for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::MissingCredential(_) => "missing_credential",
            Self::StorageWrite { .. } => "storage_write",
            Self::Service(_) => "service",
            Self::Dispatch(_) => "dispatch",
            Self::UnknownClass(_) => "unknown_class",
            Self::Detection(_) => "detection",
            Self::CameraOpen { .. } => "camera_open",
            Self::Source(_) => "source",
        }
    }
}
