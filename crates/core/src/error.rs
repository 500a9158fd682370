use serde::Serialize;
use thiserror::Error;

use crate::media::Fingerprint;
use crate::types::{FailureReason, JobState};

/// A failure inside one pipeline stage, tagged with the job it belongs to.
///
/// Components return their own error types; the worker wraps them into a
/// `StageError` before handing them to the orchestrator, which is the only
/// place that decides what gets written to the job store.
#[derive(Debug, Clone, Error, Serialize)]
#[error("job {job_id} ({stage}): {reason}: {message}")]
pub struct StageError {
    pub job_id: String,
    pub fingerprint: Fingerprint,
    pub stage: JobState,
    pub reason: FailureReason,
    pub message: String,
}

impl StageError {
    pub fn new(
        job_id: impl Into<String>,
        fingerprint: Fingerprint,
        stage: JobState,
        reason: FailureReason,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            fingerprint,
            stage,
            reason,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        self.reason.as_str()
    }

    pub fn is_retryable(&self) -> bool {
        self.reason.is_retryable()
    }
}
