use std::time::Duration;

use article_datastore::{JobId, JobStatus};

/// Failure of a call into the language-model or speech provider.
///
/// Every variant is retried by [`crate::retry::with_retry`] before it is
/// allowed to surface as a terminal job or session state.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("Provider error: {0}")]
    Provider(String),
    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Schema validation error: {0}")]
    SchemaValidation(String),
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {0} not found")]
    NotFound(JobId),
    #[error("Job {job_id} is not ready (status: {status})")]
    NotReady { job_id: JobId, status: JobStatus },
    #[error("Job {0} has already been started")]
    AlreadyStarted(JobId),
    #[error("Job {job_id} was given an invalid transcript: {reason}")]
    InvalidTranscript { job_id: JobId, reason: String },
    #[error("Invalid status transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("Store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// The live session no longer accepts frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Session is closed")]
pub struct SessionClosed;
