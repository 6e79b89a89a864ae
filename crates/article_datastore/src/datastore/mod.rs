use std::{future::Future, sync::Arc};

use crate::{ArticleDraft, EditorFeedback, InterviewTranscript, Job, JobId};

pub mod memory;
pub mod postgres;

/// Append-only storage for jobs, transcripts, drafts and editor feedback.
///
/// Implementations must serialise writes for a single job while allowing
/// writes for distinct jobs to proceed concurrently.
pub trait DataStore {
    fn insert_job(&self, job: &Job) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn get_job(&self, job_id: &JobId) -> impl Future<Output = anyhow::Result<Option<Job>>> + Send;

    /// Persists the mutable fields of `job` (status, iteration, outcome flags).
    fn update_job(&self, job: &Job) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn save_transcript(
        &self,
        job_id: &JobId,
        transcript: &InterviewTranscript,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn get_transcript(
        &self,
        job_id: &JobId,
    ) -> impl Future<Output = anyhow::Result<Option<InterviewTranscript>>> + Send;

    /// Fails if a draft with the same version was already stored for the job.
    fn append_draft(
        &self,
        job_id: &JobId,
        draft: &ArticleDraft,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Fails if feedback for the same draft version was already stored for the job.
    fn append_feedback(
        &self,
        job_id: &JobId,
        feedback: &EditorFeedback,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn latest_draft(
        &self,
        job_id: &JobId,
    ) -> impl Future<Output = anyhow::Result<Option<ArticleDraft>>> + Send;

    fn list_drafts(
        &self,
        job_id: &JobId,
    ) -> impl Future<Output = anyhow::Result<Vec<ArticleDraft>>> + Send;

    fn list_feedback(
        &self,
        job_id: &JobId,
    ) -> impl Future<Output = anyhow::Result<Vec<EditorFeedback>>> + Send;
}

impl<T: DataStore + Send + Sync> DataStore for Arc<T> {
    async fn insert_job(&self, job: &Job) -> anyhow::Result<()> {
        (**self).insert_job(job).await
    }

    async fn get_job(&self, job_id: &JobId) -> anyhow::Result<Option<Job>> {
        (**self).get_job(job_id).await
    }

    async fn update_job(&self, job: &Job) -> anyhow::Result<()> {
        (**self).update_job(job).await
    }

    async fn save_transcript(
        &self,
        job_id: &JobId,
        transcript: &InterviewTranscript,
    ) -> anyhow::Result<()> {
        (**self).save_transcript(job_id, transcript).await
    }

    async fn get_transcript(&self, job_id: &JobId) -> anyhow::Result<Option<InterviewTranscript>> {
        (**self).get_transcript(job_id).await
    }

    async fn append_draft(&self, job_id: &JobId, draft: &ArticleDraft) -> anyhow::Result<()> {
        (**self).append_draft(job_id, draft).await
    }

    async fn append_feedback(
        &self,
        job_id: &JobId,
        feedback: &EditorFeedback,
    ) -> anyhow::Result<()> {
        (**self).append_feedback(job_id, feedback).await
    }

    async fn latest_draft(&self, job_id: &JobId) -> anyhow::Result<Option<ArticleDraft>> {
        (**self).latest_draft(job_id).await
    }

    async fn list_drafts(&self, job_id: &JobId) -> anyhow::Result<Vec<ArticleDraft>> {
        (**self).list_drafts(job_id).await
    }

    async fn list_feedback(&self, job_id: &JobId) -> anyhow::Result<Vec<EditorFeedback>> {
        (**self).list_feedback(job_id).await
    }
}
