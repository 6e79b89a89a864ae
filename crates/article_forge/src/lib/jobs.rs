//! # Job Manager
//!
//! Owns the lifecycle of article jobs: creation, the handoff from the
//! interview to the reflection loop, status queries and result retrieval.
//! Each started job runs on its own task; a failure inside one job is
//! recorded on that job and never reaches the caller or other jobs.

pub mod builder;

use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, MutexGuard, PoisonError},
};

use article_datastore::{DataStore, InterviewTranscript, Job, JobId, JobStatus};
use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::{
    config::EngineConfig,
    error::JobError,
    llm::gateway::AgentGateway,
    reflection::{LoopPhase, PhaseObserver, ReflectionLoop, ReflectionState},
};

pub use builder::JobManagerBuilder;

/// Failure reason recorded when a job is started without any interview content.
pub const EMPTY_TRANSCRIPT_REASON: &str = "empty transcript";

/// Failure reason recorded when the reflection task panics.
pub const PANICKED_REASON: &str = "reflection task panicked";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobProgress {
    pub status: JobStatus,
    pub iteration: u32,
}

/// The final article of a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArticleResult {
    pub title: String,
    pub content: String,
    pub version: u32,
    /// Present only when the Editor never approved the returned draft.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations_exceeded: Option<bool>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub partial_transcript: bool,
}

pub struct JobManager<D, G> {
    shared: Arc<Shared<D, G>>,
}

struct Shared<D, G> {
    store: Arc<D>,
    gateway: Arc<G>,
    config: EngineConfig,
    tasks: TaskMap,
}

/// Jobs with a start in progress or a running reflection task. Entries
/// leave the map when the task finishes, so only live work is tracked.
#[derive(Default)]
struct TaskMap(std::sync::Mutex<HashMap<JobId, TaskSlot>>);

enum TaskSlot {
    Reserved,
    Running(JoinHandle<()>),
}

impl TaskMap {
    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, TaskSlot>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims `job_id` for the caller until the returned guard is dropped or launched.
    fn reserve(&self, job_id: JobId) -> Result<Reservation<'_>, JobError> {
        let mut tasks = self.lock();
        if tasks.contains_key(&job_id) {
            return Err(JobError::AlreadyStarted(job_id));
        }
        tasks.insert(job_id, TaskSlot::Reserved);
        Ok(Reservation {
            tasks: self,
            job_id,
        })
    }

    fn take_running(&self, job_id: JobId) -> Option<JoinHandle<()>> {
        let mut tasks = self.lock();
        match tasks.remove(&job_id) {
            Some(TaskSlot::Running(handle)) => Some(handle),
            Some(reserved) => {
                tasks.insert(job_id, reserved);
                None
            }
            None => None,
        }
    }

    /// Drops the entry of a finishing task. A handle taken by `join` or a
    /// pending reservation is left alone.
    fn release(&self, job_id: JobId) {
        let mut tasks = self.lock();
        if matches!(tasks.get(&job_id), Some(TaskSlot::Running(_))) {
            tasks.remove(&job_id);
        }
    }
}

struct Reservation<'a> {
    tasks: &'a TaskMap,
    job_id: JobId,
}

impl Reservation<'_> {
    /// Spawns `task` and tracks its handle. The map stays locked until the
    /// handle is stored, so a task that finishes at once still finds its
    /// entry to remove.
    fn launch<F>(self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        let handle = tokio::spawn(task);
        tasks.insert(self.job_id, TaskSlot::Running(handle));
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut tasks = self.tasks.lock();
        if matches!(tasks.get(&self.job_id), Some(TaskSlot::Reserved)) {
            tasks.remove(&self.job_id);
        }
    }
}

impl<D, G> JobManager<D, G>
where
    D: DataStore + Send + Sync + 'static,
    G: AgentGateway + Send + Sync + 'static,
{
    pub fn new(store: Arc<D>, gateway: Arc<G>, config: EngineConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                gateway,
                config,
                tasks: TaskMap::default(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<D> {
        &self.shared.store
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.shared.gateway
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Number of jobs whose reflection task is still running or being launched.
    pub fn active_tasks(&self) -> usize {
        self.shared.tasks.lock().len()
    }

    #[tracing::instrument(skip(self))]
    pub async fn create_job(&self, topic: &str, target_audience: &str) -> Result<JobId, JobError> {
        let job = Job::new(topic, target_audience);
        self.shared
            .store
            .insert_job(&job)
            .await
            .inspect_err(|e| tracing::error!(error = ?e, "Failed to insert job"))?;

        tracing::info!(job_id = %job.id, "Job created");
        Ok(job.id)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Job, JobError> {
        self.shared.load(job_id).await
    }

    /// Marks a pending job as interviewing when a live session attaches to it.
    #[tracing::instrument(skip(self))]
    pub async fn begin_interview(&self, job_id: JobId) -> Result<Job, JobError> {
        let _reservation = self.shared.tasks.reserve(job_id)?;
        let job = self.shared.load(job_id).await?;

        if job.status != JobStatus::Pending {
            return Err(JobError::AlreadyStarted(job_id));
        }
        self.shared
            .transition(job_id, JobStatus::Interviewing, |_| {})
            .await
    }

    /// Hands a finished transcript to the reflection loop and returns
    /// without waiting for it.
    ///
    /// A job can be started once. An empty transcript fails the job
    /// immediately with [`EMPTY_TRANSCRIPT_REASON`]; a transcript whose
    /// sequence indices do not strictly increase is rejected without
    /// touching the job.
    #[tracing::instrument(skip(self, transcript), fields(messages = transcript.len(), partial = transcript.partial))]
    pub async fn start(&self, job_id: JobId, transcript: InterviewTranscript) -> Result<(), JobError> {
        let reservation = self.shared.tasks.reserve(job_id)?;

        let job = self.shared.load(job_id).await?;
        if !matches!(job.status, JobStatus::Pending | JobStatus::Interviewing) {
            return Err(JobError::AlreadyStarted(job_id));
        }
        if !transcript.is_well_ordered() {
            return Err(JobError::InvalidTranscript {
                job_id,
                reason: "message sequence indices must strictly increase".into(),
            });
        }

        if job.status == JobStatus::Pending {
            self.shared
                .transition(job_id, JobStatus::Interviewing, |_| {})
                .await?;
        }

        if transcript.is_empty() {
            tracing::warn!("Transcript is empty, failing job");
            self.shared
                .transition(job_id, JobStatus::Failed, |job| {
                    job.failure_reason = Some(EMPTY_TRANSCRIPT_REASON.to_string())
                })
                .await?;
            return Ok(());
        }

        self.shared
            .store
            .save_transcript(&job_id, &transcript)
            .await
            .inspect_err(|e| tracing::error!(error = ?e, "Failed to save transcript"))?;

        let partial = transcript.partial;
        let job = self.shared.amend(job_id, |job| job.partial_transcript = partial).await?;

        let span = tracing::info_span!("reflection", %job_id);
        reservation.launch(
            Arc::clone(&self.shared)
                .run_reflection(job, transcript)
                .instrument(span),
        );

        Ok(())
    }

    pub async fn get_status(&self, job_id: JobId) -> Result<JobProgress, JobError> {
        let job = self.shared.load(job_id).await?;
        Ok(JobProgress {
            status: job.status,
            iteration: job.iteration,
        })
    }

    /// The latest draft of a completed job.
    pub async fn get_result(&self, job_id: JobId) -> Result<ArticleResult, JobError> {
        let job = self.shared.load(job_id).await?;
        if job.status != JobStatus::Completed {
            return Err(JobError::NotReady {
                job_id,
                status: job.status,
            });
        }

        let draft = self
            .shared
            .store
            .latest_draft(&job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Completed job {job_id} has no stored draft"))?;

        Ok(ArticleResult {
            title: draft.title,
            content: draft.content,
            version: draft.version,
            max_iterations_exceeded: job.max_iterations_exceeded.then_some(true),
            partial_transcript: job.partial_transcript,
        })
    }

    /// Waits for the job's reflection task, if one is running, to finish.
    pub async fn join(&self, job_id: JobId) -> Result<(), JobError> {
        if let Some(handle) = self.shared.tasks.take_running(job_id) {
            if let Err(e) = handle.await {
                tracing::error!(%job_id, error = %e, "Reflection task did not complete");
            }
        }
        self.shared.load(job_id).await.map(|_| ())
    }
}

impl<D, G> Shared<D, G>
where
    D: DataStore + Send + Sync + 'static,
    G: AgentGateway + Send + Sync + 'static,
{
    async fn load(&self, job_id: JobId) -> Result<Job, JobError> {
        self.store
            .get_job(&job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))
    }

    /// Applies `edit` without changing the status.
    async fn amend(
        &self,
        job_id: JobId,
        edit: impl FnOnce(&mut Job) + Send,
    ) -> Result<Job, JobError> {
        let mut job = self.load(job_id).await?;
        edit(&mut job);
        self.store.update_job(&job).await?;
        Ok(job)
    }

    async fn transition(
        &self,
        job_id: JobId,
        next: JobStatus,
        edit: impl FnOnce(&mut Job) + Send,
    ) -> Result<Job, JobError> {
        let mut job = self.load(job_id).await?;
        let from = job.status;
        if !from.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                job_id,
                from,
                to: next,
            });
        }

        job.status = next;
        edit(&mut job);
        self.store
            .update_job(&job)
            .await
            .inspect_err(|e| tracing::error!(error = ?e, "Failed to persist job status"))?;

        tracing::info!(%job_id, %from, to = %next, iteration = job.iteration, "Job status changed");
        Ok(job)
    }

    async fn run_reflection(self: Arc<Self>, job: Job, transcript: InterviewTranscript) {
        self.reflect(&job, &transcript).await;
        self.tasks.release(job.id);
    }

    async fn reflect(&self, job: &Job, transcript: &InterviewTranscript) {
        let reflection = ReflectionLoop::new(
            Arc::clone(&self.gateway),
            Arc::clone(&self.store),
            &self.config,
        );
        let recorder = StatusRecorder {
            shared: self,
            job_id: job.id,
        };

        let state = AssertUnwindSafe(reflection.run(
            job.id,
            &job.topic,
            &job.target_audience,
            transcript,
            &recorder,
        ))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| ReflectionState::Failed {
            iteration: 0,
            reason: PANICKED_REASON.into(),
        });

        let recorded = match state {
            ReflectionState::Done(outcome) => {
                self.transition(job.id, JobStatus::Completed, |job| {
                    job.iteration = outcome.draft.version;
                    job.max_iterations_exceeded = outcome.max_iterations_exceeded;
                })
                .await
            }
            ReflectionState::Failed { reason, .. } => {
                self.transition(job.id, JobStatus::Failed, |job| {
                    job.failure_reason = Some(reason)
                })
                .await
            }
            ReflectionState::Writing { .. } | ReflectionState::Editing { .. } => {
                self.transition(job.id, JobStatus::Failed, |job| {
                    job.failure_reason = Some("reflection loop stopped early".into())
                })
                .await
            }
        };

        if let Err(e) = recorded {
            tracing::error!(error = %e, "Failed to record job outcome");
        }
    }
}

/// Mirrors reflection loop phases onto the job's status.
struct StatusRecorder<'a, D, G> {
    shared: &'a Shared<D, G>,
    job_id: JobId,
}

impl<D, G> PhaseObserver for StatusRecorder<'_, D, G>
where
    D: DataStore + Send + Sync + 'static,
    G: AgentGateway + Send + Sync + 'static,
{
    async fn on_phase(&self, phase: LoopPhase, iteration: u32) -> anyhow::Result<()> {
        let next = match phase {
            LoopPhase::Writing => JobStatus::Writing,
            LoopPhase::Editing => JobStatus::Editing,
        };
        self.shared
            .transition(self.job_id, next, |job| job.iteration = iteration)
            .await?;
        Ok(())
    }
}
