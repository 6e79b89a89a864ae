use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{migrate::Migrator, postgres::PgPoolOptions, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    datastore::DataStore, ArticleDraft, EditorFeedback, InterviewTranscript, Job, JobId, Speaker,
};

static MIGRATOR: Migrator = sqlx::migrate!();

#[derive(Debug, Clone)]
pub struct PgDataStore {
    pub pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    topic: String,
    target_audience: String,
    status: String,
    iteration: i32,
    max_iterations_exceeded: bool,
    partial_transcript: bool,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id.into(),
            topic: row.topic,
            target_audience: row.target_audience,
            status: row.status.parse()?,
            iteration: u32::try_from(row.iteration).context("Negative iteration count")?,
            max_iterations_exceeded: row.max_iterations_exceeded,
            partial_transcript: row.partial_transcript,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DraftRow {
    version: i32,
    title: String,
    content: String,
}

impl From<DraftRow> for ArticleDraft {
    fn from(row: DraftRow) -> Self {
        ArticleDraft {
            title: row.title,
            content: row.content,
            version: row.version.max(0) as u32,
        }
    }
}

#[derive(sqlx::FromRow)]
struct FeedbackRow {
    draft_version: i32,
    is_approved: bool,
    critiques: Vec<String>,
}

impl PgDataStore {
    /// Establish connection to database and run the embedded migrations
    pub async fn init(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .inspect_err(
                |e| tracing::error!(error = ?e, "Failed to establish connection to database"),
            )
            .context("Failed to connect to postgres database")?;

        MIGRATOR
            .run(&pool)
            .await
            .inspect_err(|e| tracing::error!(error = ?e, "Failed to run database migrations"))
            .context("Failed to run database migrations")?;

        Ok(PgDataStore { pool })
    }

    /// Takes the row lock that makes the caller the single writer for `job_id`
    /// until the transaction ends.
    async fn lock_job(tx: &mut Transaction<'_, Postgres>, job_id: &JobId) -> anyhow::Result<()> {
        let locked: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .context("Failed to lock job row")?;

        if locked.is_none() {
            anyhow::bail!("Job {job_id} does not exist");
        }
        Ok(())
    }
}

impl DataStore for PgDataStore {
    async fn insert_job(&self, job: &Job) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, topic, target_audience, status, iteration,
                max_iterations_exceeded, partial_transcript, failure_reason, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.topic)
        .bind(&job.target_audience)
        .bind(job.status.as_str())
        .bind(job.iteration as i32)
        .bind(job.max_iterations_exceeded)
        .bind(job.partial_transcript)
        .bind(&job.failure_reason)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .inspect_err(|e| tracing::error!(error = ?e, job_id = %job.id, "Failed to insert job"))
        .context("Failed to insert job")?;

        Ok(())
    }

    async fn get_job(&self, job_id: &JobId) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch job")?;

        row.map(Job::try_from).transpose()
    }

    async fn update_job(&self, job: &Job) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2, iteration = $3, max_iterations_exceeded = $4,
                partial_transcript = $5, failure_reason = $6, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(job.iteration as i32)
        .bind(job.max_iterations_exceeded)
        .bind(job.partial_transcript)
        .bind(&job.failure_reason)
        .execute(&self.pool)
        .await
        .inspect_err(|e| tracing::error!(error = ?e, job_id = %job.id, "Failed to update job"))
        .context("Failed to update job")?;

        if result.rows_affected() == 0 {
            anyhow::bail!("Job {} does not exist", job.id);
        }
        Ok(())
    }

    async fn save_transcript(
        &self,
        job_id: &JobId,
        transcript: &InterviewTranscript,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::lock_job(&mut tx, job_id).await?;

        sqlx::query("INSERT INTO transcripts (job_id, partial) VALUES ($1, $2)")
            .bind(job_id.as_uuid())
            .bind(transcript.partial)
            .execute(&mut *tx)
            .await
            .context("Failed to insert transcript")?;

        for message in &transcript.messages {
            sqlx::query(
                "INSERT INTO transcript_messages (job_id, sequence, speaker, text) VALUES ($1, $2, $3, $4)",
            )
            .bind(job_id.as_uuid())
            .bind(message.sequence as i32)
            .bind(message.speaker.as_str())
            .bind(&message.text)
            .execute(&mut *tx)
            .await
            .context("Failed to insert transcript message")?;
        }

        tx.commit().await.context("Failed to commit transcript")?;
        Ok(())
    }

    async fn get_transcript(&self, job_id: &JobId) -> anyhow::Result<Option<InterviewTranscript>> {
        let partial: Option<(bool,)> =
            sqlx::query_as("SELECT partial FROM transcripts WHERE job_id = $1")
                .bind(job_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .context("Failed to fetch transcript")?;

        let Some((partial,)) = partial else {
            return Ok(None);
        };

        let rows: Vec<(i32, String, String)> = sqlx::query_as(
            "SELECT sequence, speaker, text FROM transcript_messages WHERE job_id = $1 ORDER BY sequence",
        )
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch transcript messages")?;

        let messages = rows
            .into_iter()
            .map(|(sequence, speaker, text)| {
                Ok(crate::InterviewMessage {
                    speaker: speaker.parse::<Speaker>().map_err(anyhow::Error::msg)?,
                    text,
                    sequence: sequence.max(0) as u32,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Some(InterviewTranscript { messages, partial }))
    }

    async fn append_draft(&self, job_id: &JobId, draft: &ArticleDraft) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::lock_job(&mut tx, job_id).await?;

        sqlx::query(
            "INSERT INTO article_drafts (job_id, version, title, content) VALUES ($1, $2, $3, $4)",
        )
        .bind(job_id.as_uuid())
        .bind(draft.version as i32)
        .bind(&draft.title)
        .bind(&draft.content)
        .execute(&mut *tx)
        .await
        .inspect_err(|e| {
            tracing::error!(error = ?e, %job_id, version = draft.version, "Failed to append draft")
        })
        .context("Failed to append draft")?;

        tx.commit().await.context("Failed to commit draft")?;
        Ok(())
    }

    async fn append_feedback(
        &self,
        job_id: &JobId,
        feedback: &EditorFeedback,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::lock_job(&mut tx, job_id).await?;

        sqlx::query(
            "INSERT INTO editor_feedback (job_id, draft_version, is_approved, critiques) VALUES ($1, $2, $3, $4)",
        )
        .bind(job_id.as_uuid())
        .bind(feedback.draft_version as i32)
        .bind(feedback.is_approved)
        .bind(&feedback.critiques)
        .execute(&mut *tx)
        .await
        .inspect_err(|e| {
            tracing::error!(
                error = ?e,
                %job_id,
                draft_version = feedback.draft_version,
                "Failed to append feedback"
            )
        })
        .context("Failed to append feedback")?;

        tx.commit().await.context("Failed to commit feedback")?;
        Ok(())
    }

    async fn latest_draft(&self, job_id: &JobId) -> anyhow::Result<Option<ArticleDraft>> {
        let row = sqlx::query_as::<_, DraftRow>(
            "SELECT version, title, content FROM article_drafts WHERE job_id = $1 ORDER BY version DESC LIMIT 1",
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch latest draft")?;

        Ok(row.map(ArticleDraft::from))
    }

    async fn list_drafts(&self, job_id: &JobId) -> anyhow::Result<Vec<ArticleDraft>> {
        let rows = sqlx::query_as::<_, DraftRow>(
            "SELECT version, title, content FROM article_drafts WHERE job_id = $1 ORDER BY version",
        )
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch drafts")?;

        Ok(rows.into_iter().map(ArticleDraft::from).collect())
    }

    async fn list_feedback(&self, job_id: &JobId) -> anyhow::Result<Vec<EditorFeedback>> {
        let rows = sqlx::query_as::<_, FeedbackRow>(
            "SELECT draft_version, is_approved, critiques FROM editor_feedback WHERE job_id = $1 ORDER BY draft_version",
        )
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch feedback")?;

        Ok(rows
            .into_iter()
            .map(|row| EditorFeedback {
                is_approved: row.is_approved,
                critiques: row.critiques,
                draft_version: row.draft_version.max(0) as u32,
            })
            .collect())
    }
}
