use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use article_datastore::{DataStore, InterviewTranscript, JobId, MemoryDataStore, PgDataStore, Speaker};
use article_forge::{
    openai::OpenAIClient, tracing::init_tracing_subscriber, AudioStreamPipeline, EngineConfig,
    JobManager, JobManagerBuilder, PipelineConfig, RetryPolicy, SessionEvent,
};
use clap::{Parser, Subcommand};
use itertools::Itertools;
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "article-forge", about = "Interview to article orchestration engine")]
struct Cli {
    /// Database connection URL. Jobs are kept in memory when omitted.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// OpenAI API key
    #[arg(long, env = "OPENAI_API_KEY")]
    openai_key: String,

    /// Alternative OpenAI-compatible endpoint
    #[arg(long, env = "OPENAI_BASE_URL")]
    openai_base_url: Option<String>,

    /// Maximum Writer invocations per job
    #[arg(long, env = "MAX_ITERATIONS", default_value = "3")]
    max_iterations: u32,

    /// Retries per provider call after the first attempt
    #[arg(long, env = "MAX_RETRIES", default_value = "3")]
    max_retries: u32,

    /// Seconds between job status polls
    #[arg(long, default_value = "2")]
    poll_interval: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write an article from a recorded transcript
    Write {
        #[arg(long)]
        topic: String,
        #[arg(long)]
        audience: String,
        /// JSON array of `{"speaker": "interviewer"|"subject", "text": ...}` turns
        #[arg(long)]
        transcript: PathBuf,
    },
    /// Replay recorded answers through a live interview session
    Interview {
        #[arg(long)]
        topic: String,
        #[arg(long)]
        audience: String,
        /// Directory of audio files, one subject answer per file, in name order
        #[arg(long)]
        audio_dir: PathBuf,
        /// Where the synthesized interviewer audio and transcript are written
        #[arg(long, default_value = "/var/tmp/article-forge")]
        out_dir: PathBuf,
        #[arg(long, env = "MAX_QUESTIONS", default_value = "8")]
        max_questions: u32,
    },
}

#[derive(Debug, Deserialize)]
struct Turn {
    speaker: Speaker,
    text: String,
}

fn read_transcript(path: &Path) -> anyhow::Result<InterviewTranscript> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read transcript {}", path.display()))?;
    let turns: Vec<Turn> = serde_json::from_str(&raw).context("Transcript is not a list of turns")?;

    Ok(InterviewTranscript::from_turns(
        turns.into_iter().map(|turn| (turn.speaker, turn.text)),
    ))
}

async fn wait_for_terminal<D: DataStore + Send + Sync + 'static>(
    manager: &JobManager<D, OpenAIClient>,
    job_id: JobId,
    poll_interval: Duration,
) -> anyhow::Result<()> {
    loop {
        let progress = manager.get_status(job_id).await?;
        tracing::info!(%job_id, status = %progress.status, iteration = progress.iteration, "Job progress");
        if progress.status.is_terminal() {
            return Ok(());
        }
        tokio::time::sleep(poll_interval).await;
    }
}

async fn print_outcome<D: DataStore + Send + Sync + 'static>(
    manager: &JobManager<D, OpenAIClient>,
    job_id: JobId,
) -> anyhow::Result<()> {
    match manager.get_result(job_id).await {
        Ok(article) => println!("{}", serde_json::to_string_pretty(&article)?),
        Err(e) => {
            let job = manager.get_job(job_id).await?;
            anyhow::bail!(
                "Job {job_id} did not complete ({e}): {}",
                job.failure_reason.unwrap_or_default()
            );
        }
    }
    Ok(())
}

async fn run<D: DataStore + Send + Sync + 'static>(store: D, cli: Cli) -> anyhow::Result<()> {
    let mut openai = OpenAIClient::new(&cli.openai_key);
    if let Some(base_url) = &cli.openai_base_url {
        openai = openai.with_base_url(base_url);
    }

    let manager = Arc::new(
        JobManagerBuilder::new()
            .store(store)
            .gateway(openai.clone())
            .config(EngineConfig {
                max_iterations: cli.max_iterations,
                retry: RetryPolicy {
                    max_retries: cli.max_retries,
                    ..Default::default()
                },
            })
            .build(),
    );
    let poll_interval = Duration::from_secs(cli.poll_interval.max(1));

    match cli.command {
        Command::Write {
            topic,
            audience,
            transcript,
        } => {
            let transcript = read_transcript(&transcript)?;
            let job_id = manager.create_job(&topic, &audience).await?;
            tracing::info!(%job_id, messages = transcript.len(), "Starting job from transcript");

            manager.start(job_id, transcript).await?;
            wait_for_terminal(&manager, job_id, poll_interval).await?;
            print_outcome(&manager, job_id).await
        }
        Command::Interview {
            topic,
            audience,
            audio_dir,
            out_dir,
            max_questions,
        } => {
            let answers = std::fs::read_dir(&audio_dir)
                .with_context(|| format!("Failed to read {}", audio_dir.display()))?
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| path.is_file())
                .sorted()
                .collect::<Vec<_>>();
            std::fs::create_dir_all(&out_dir)?;

            let config = PipelineConfig {
                max_questions,
                utterance_silence: None,
                ..Default::default()
            };
            let greets = config.open_with_greeting;
            let pipeline = AudioStreamPipeline::new(Arc::clone(&manager), Arc::new(openai), config);

            let job_id = manager.create_job(&topic, &audience).await?;
            let mut session = pipeline.open(job_id).await?;
            let mut speech = Vec::new();

            let mut open = !greets || session.next_reply(|e| replay_event(e, &mut speech)).await;
            for path in &answers {
                if !open {
                    tracing::info!("Session ended, remaining answers not sent");
                    break;
                }
                let audio = std::fs::read(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                tracing::info!(answer = %path.display(), bytes = audio.len(), "Sending answer");
                if session.send_audio(audio).await.is_err() || session.end_utterance().await.is_err() {
                    break;
                }
                open = session.next_reply(|e| replay_event(e, &mut speech)).await;
            }
            if session.end().await.is_err() {
                tracing::debug!("Session already closed");
            }

            let (outcome, events) = session.finish().await?;
            for event in events {
                replay_event(event, &mut speech);
            }

            std::fs::write(out_dir.join("interviewer.mp3"), speech)?;
            std::fs::write(
                out_dir.join("transcript.json"),
                serde_json::to_vec_pretty(&outcome.transcript)?,
            )?;

            if !outcome.job_started {
                anyhow::bail!("Interview for job {job_id} ended without starting the article");
            }
            wait_for_terminal(&manager, job_id, poll_interval).await?;
            print_outcome(&manager, job_id).await
        }
    }
}

fn replay_event(event: SessionEvent, speech: &mut Vec<u8>) {
    match event {
        SessionEvent::Audio(bytes) => speech.extend(bytes),
        SessionEvent::TranscriptUpdate(message) => {
            tracing::info!(speaker = %message.speaker, sequence = message.sequence, text = %message.text, "Transcript")
        }
        SessionEvent::Error {
            code,
            message,
            fatal,
        } => tracing::warn!(?code, fatal, %message, "Session error"),
        SessionEvent::Closed { reason } => {
            tracing::info!(reason = reason.as_str(), "Session closed")
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let _guard = sentry::init((
        std::env::var("SENTRY_DSN").unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some("production".into()),
            ..Default::default()
        },
    ));

    let cli = Cli::parse();
    init_tracing_subscriber()?;

    match cli.database_url.clone() {
        Some(database_url) => {
            let store = PgDataStore::init(&database_url)
                .await
                .inspect_err(|e| tracing::error!(error = ?e, "Failed to initialise datastore"))?;
            run(store, cli).await
        }
        None => {
            tracing::info!("No database configured, keeping jobs in memory");
            run(MemoryDataStore::default(), cli).await
        }
    }
}
