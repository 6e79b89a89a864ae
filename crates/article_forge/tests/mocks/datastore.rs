use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use article_datastore::{
    ArticleDraft, DataStore, EditorFeedback, InterviewTranscript, Job, JobId, JobStatus,
    MemoryDataStore,
};

/// A persisted status change, with what the store held at that moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRecord {
    pub job_id: JobId,
    pub status: JobStatus,
    pub iteration: u32,
    pub drafts_stored: usize,
}

/// In-memory store that records every persisted status and can be told to
/// reject draft writes or to stall transcript writes for one topic.
#[derive(Clone, Default)]
pub struct MockDataStore {
    pub inner: MemoryDataStore,
    pub statuses: Arc<Mutex<Vec<StatusRecord>>>,
    pub fail_drafts_with: Option<String>,
    pub slow_transcripts_for: Option<(String, Duration)>,
}

impl MockDataStore {
    pub fn failing(msg: &str) -> Self {
        Self {
            fail_drafts_with: Some(msg.to_string()),
            ..Default::default()
        }
    }

    /// Saving the transcript of a job about `topic` takes `delay`.
    pub fn slow_for(topic: &str, delay: Duration) -> Self {
        Self {
            slow_transcripts_for: Some((topic.to_string(), delay)),
            ..Default::default()
        }
    }

    pub fn records_of(&self, job_id: JobId) -> Vec<StatusRecord> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|record| record.job_id == job_id)
            .copied()
            .collect()
    }

    pub fn statuses_of(&self, job_id: JobId) -> Vec<JobStatus> {
        self.records_of(job_id)
            .into_iter()
            .map(|record| record.status)
            .collect()
    }

    async fn record(&self, job: &Job) -> anyhow::Result<()> {
        let drafts_stored = self.inner.list_drafts(&job.id).await?.len();
        let mut statuses = self.statuses.lock().unwrap();
        let last = statuses
            .iter()
            .rev()
            .find(|record| record.job_id == job.id)
            .map(|record| record.status);
        if last != Some(job.status) {
            statuses.push(StatusRecord {
                job_id: job.id,
                status: job.status,
                iteration: job.iteration,
                drafts_stored,
            });
        }
        Ok(())
    }
}

impl DataStore for MockDataStore {
    async fn insert_job(&self, job: &Job) -> anyhow::Result<()> {
        self.inner.insert_job(job).await?;
        self.record(job).await
    }

    async fn get_job(&self, job_id: &JobId) -> anyhow::Result<Option<Job>> {
        self.inner.get_job(job_id).await
    }

    async fn update_job(&self, job: &Job) -> anyhow::Result<()> {
        self.inner.update_job(job).await?;
        self.record(job).await
    }

    async fn save_transcript(
        &self,
        job_id: &JobId,
        transcript: &InterviewTranscript,
    ) -> anyhow::Result<()> {
        if let Some((ref topic, delay)) = self.slow_transcripts_for {
            let job = self.inner.get_job(job_id).await?;
            if job.is_some_and(|job| &job.topic == topic) {
                tokio::time::sleep(delay).await;
            }
        }
        self.inner.save_transcript(job_id, transcript).await
    }

    async fn get_transcript(&self, job_id: &JobId) -> anyhow::Result<Option<InterviewTranscript>> {
        self.inner.get_transcript(job_id).await
    }

    async fn append_draft(&self, job_id: &JobId, draft: &ArticleDraft) -> anyhow::Result<()> {
        if let Some(ref msg) = self.fail_drafts_with {
            return Err(anyhow::anyhow!("{}", msg));
        }
        self.inner.append_draft(job_id, draft).await
    }

    async fn append_feedback(
        &self,
        job_id: &JobId,
        feedback: &EditorFeedback,
    ) -> anyhow::Result<()> {
        self.inner.append_feedback(job_id, feedback).await
    }

    async fn latest_draft(&self, job_id: &JobId) -> anyhow::Result<Option<ArticleDraft>> {
        self.inner.latest_draft(job_id).await
    }

    async fn list_drafts(&self, job_id: &JobId) -> anyhow::Result<Vec<ArticleDraft>> {
        self.inner.list_drafts(job_id).await
    }

    async fn list_feedback(&self, job_id: &JobId) -> anyhow::Result<Vec<EditorFeedback>> {
        self.inner.list_feedback(job_id).await
    }
}
