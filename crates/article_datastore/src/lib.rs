//! # DataStore Module
//!
//! Persistence for interview-to-article jobs: the job record, the interview
//! transcript, and append-only logs of article drafts and editor feedback,
//! all keyed by job identifier.
//!
//! Two backends are provided: an in-process [`MemoryDataStore`] and a
//! [`PgDataStore`] built on sqlx.

mod datastore;
mod domain;

pub use datastore::memory::MemoryDataStore;
pub use datastore::postgres::PgDataStore;
pub use datastore::DataStore;
pub use domain::{
    ArticleDraft, EditorFeedback, InterviewMessage, InterviewTranscript, Job, JobId, JobStatus,
    Speaker, UnknownJobStatus,
};
