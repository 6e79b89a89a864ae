use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};

use chrono::Utc;
use itertools::Itertools;
use tokio::sync::Mutex;

use crate::{datastore::DataStore, ArticleDraft, EditorFeedback, InterviewTranscript, Job, JobId};

#[derive(Debug)]
struct JobRecord {
    job: Job,
    transcript: Option<InterviewTranscript>,
    drafts: Vec<ArticleDraft>,
    feedback: Vec<EditorFeedback>,
}

/// In-process store scoped to the lifetime of whoever constructs it.
///
/// Each job lives behind its own async mutex; the outer map lock is only held
/// long enough to look the record up.
#[derive(Debug, Default, Clone)]
pub struct MemoryDataStore {
    jobs: Arc<StdMutex<HashMap<JobId, Arc<Mutex<JobRecord>>>>>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, job_id: &JobId) -> anyhow::Result<Option<Arc<Mutex<JobRecord>>>> {
        let jobs = self
            .jobs
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        Ok(jobs.get(job_id).cloned())
    }

    fn existing_record(&self, job_id: &JobId) -> anyhow::Result<Arc<Mutex<JobRecord>>> {
        self.record(job_id)?
            .ok_or_else(|| anyhow::anyhow!("Job {job_id} does not exist"))
    }
}

impl DataStore for MemoryDataStore {
    async fn insert_job(&self, job: &Job) -> anyhow::Result<()> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        if jobs.contains_key(&job.id) {
            anyhow::bail!("Job {} already exists", job.id);
        }
        jobs.insert(
            job.id,
            Arc::new(Mutex::new(JobRecord {
                job: job.clone(),
                transcript: None,
                drafts: Vec::new(),
                feedback: Vec::new(),
            })),
        );
        Ok(())
    }

    async fn get_job(&self, job_id: &JobId) -> anyhow::Result<Option<Job>> {
        match self.record(job_id)? {
            Some(record) => Ok(Some(record.lock().await.job.clone())),
            None => Ok(None),
        }
    }

    async fn update_job(&self, job: &Job) -> anyhow::Result<()> {
        let record = self.existing_record(&job.id)?;
        let mut record = record.lock().await;
        record.job = Job {
            updated_at: Utc::now(),
            created_at: record.job.created_at,
            ..job.clone()
        };
        Ok(())
    }

    async fn save_transcript(
        &self,
        job_id: &JobId,
        transcript: &InterviewTranscript,
    ) -> anyhow::Result<()> {
        let record = self.existing_record(job_id)?;
        let mut record = record.lock().await;
        if record.transcript.is_some() {
            anyhow::bail!("Transcript for job {job_id} is already stored");
        }
        record.transcript = Some(transcript.clone());
        Ok(())
    }

    async fn get_transcript(&self, job_id: &JobId) -> anyhow::Result<Option<InterviewTranscript>> {
        match self.record(job_id)? {
            Some(record) => Ok(record.lock().await.transcript.clone()),
            None => Ok(None),
        }
    }

    async fn append_draft(&self, job_id: &JobId, draft: &ArticleDraft) -> anyhow::Result<()> {
        let record = self.existing_record(job_id)?;
        let mut record = record.lock().await;
        if record.drafts.iter().any(|d| d.version == draft.version) {
            anyhow::bail!(
                "Draft version {} for job {job_id} is already stored",
                draft.version
            );
        }
        record.drafts.push(draft.clone());
        Ok(())
    }

    async fn append_feedback(
        &self,
        job_id: &JobId,
        feedback: &EditorFeedback,
    ) -> anyhow::Result<()> {
        let record = self.existing_record(job_id)?;
        let mut record = record.lock().await;
        if record
            .feedback
            .iter()
            .any(|f| f.draft_version == feedback.draft_version)
        {
            anyhow::bail!(
                "Feedback for draft version {} of job {job_id} is already stored",
                feedback.draft_version
            );
        }
        record.feedback.push(feedback.clone());
        Ok(())
    }

    async fn latest_draft(&self, job_id: &JobId) -> anyhow::Result<Option<ArticleDraft>> {
        match self.record(job_id)? {
            Some(record) => Ok(record
                .lock()
                .await
                .drafts
                .iter()
                .max_by_key(|d| d.version)
                .cloned()),
            None => Ok(None),
        }
    }

    async fn list_drafts(&self, job_id: &JobId) -> anyhow::Result<Vec<ArticleDraft>> {
        match self.record(job_id)? {
            Some(record) => Ok(record
                .lock()
                .await
                .drafts
                .iter()
                .sorted_by_key(|d| d.version)
                .cloned()
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn list_feedback(&self, job_id: &JobId) -> anyhow::Result<Vec<EditorFeedback>> {
        match self.record(job_id)? {
            Some(record) => Ok(record
                .lock()
                .await
                .feedback
                .iter()
                .sorted_by_key(|f| f.draft_version)
                .cloned()
                .collect()),
            None => Ok(Vec::new()),
        }
    }
}
