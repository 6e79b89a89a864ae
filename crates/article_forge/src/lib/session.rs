//! # Audio Stream Pipeline
//!
//! One live interview per connection, run as staged processing:
//!
//! ```text
//! client ─▶ ingest ─▶ transcribe ─▶ interviewer ─▶ synthesize ─▶ egress ─▶ client
//! ```
//!
//! Stages are linked by bounded queues. Ingest is the only stage that drops
//! work: under sustained overload it discards the oldest buffered audio
//! chunk and reports it. When the session ends, by the client or by losing
//! the connection, in-flight transcription is flushed and the finished
//! transcript is handed to [`JobManager::start`].

mod ingest;
mod resequencer;
mod stages;

use std::sync::{Arc, OnceLock};

use article_datastore::{DataStore, InterviewMessage, InterviewTranscript, Job, JobId, Speaker};
use serde::Serialize;
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    config::PipelineConfig,
    error::{JobError, SessionClosed},
    jobs::JobManager,
    llm::{gateway::AgentGateway, speech::SpeechBridge},
};

use ingest::IngestBuffer;
use stages::InterviewerStage;

/// Inbound traffic of a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Audio(Vec<u8>),
    /// The subject finished speaking.
    EndOfUtterance,
    EndSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionErrorCode {
    ChunkDropped,
    TranscriptionFailed,
    InterviewerFailed,
    SynthesisFailed,
    ProviderUnavailable,
    JobStartFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    ClientEnded,
    ConnectionLost,
    InterviewComplete,
    ProviderUnavailable,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::ClientEnded => "client_ended",
            EndReason::ConnectionLost => "connection_lost",
            EndReason::InterviewComplete => "interview_complete",
            EndReason::ProviderUnavailable => "provider_unavailable",
        }
    }

    /// Whether the interview was cut short rather than concluded.
    pub fn is_partial(&self) -> bool {
        matches!(self, EndReason::ConnectionLost | EndReason::ProviderUnavailable)
    }
}

/// Outbound traffic of a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A chunk of synthesized interviewer speech.
    Audio(Vec<u8>),
    TranscriptUpdate(InterviewMessage),
    /// Non-fatal errors leave the session open.
    Error {
        code: SessionErrorCode,
        message: String,
        fatal: bool,
    },
    /// Always the last event of a session.
    Closed { reason: EndReason },
}

/// Cooperative shutdown flag shared by all stages of one session. The
/// first trigger wins the reason.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    reason: Arc<OnceLock<EndReason>>,
}

impl Shutdown {
    pub fn trigger(&self, reason: EndReason) {
        if self.reason.set(reason).is_ok() {
            tracing::info!(reason = reason.as_str(), "Session shutting down");
        }
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<EndReason> {
        self.reason.get().copied()
    }

    pub async fn triggered(&self) {
        self.token.cancelled().await
    }
}

/// Best effort delivery of a non-fatal error; never blocks the caller.
fn report(events: &mpsc::Sender<SessionEvent>, code: SessionErrorCode, message: String) {
    let event = SessionEvent::Error {
        code,
        message,
        fatal: false,
    };
    if events.try_send(event).is_err() {
        tracing::debug!(?code, "Client event queue unavailable, error event not delivered");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub job_id: JobId,
    pub reason: EndReason,
    pub transcript: InterviewTranscript,
    /// The transcript was accepted by the job manager.
    pub job_started: bool,
}

pub struct AudioStreamPipeline<D, G, S> {
    manager: Arc<JobManager<D, G>>,
    speech: Arc<S>,
    config: PipelineConfig,
}

impl<D, G, S> AudioStreamPipeline<D, G, S>
where
    D: DataStore + Send + Sync + 'static,
    G: AgentGateway + Send + Sync + 'static,
    S: SpeechBridge + Send + Sync + 'static,
{
    pub fn new(manager: Arc<JobManager<D, G>>, speech: Arc<S>, config: PipelineConfig) -> Self {
        Self {
            manager,
            speech,
            config,
        }
    }

    /// Attaches a live session to a pending job, moving it to `interviewing`.
    #[tracing::instrument(skip(self))]
    pub async fn open(&self, job_id: JobId) -> Result<SessionHandle, JobError> {
        let job = self.manager.begin_interview(job_id).await?;

        let (frames_tx, frames_rx) = mpsc::channel(self.config.stage_capacity.max(1));
        let (events_tx, events_rx) = mpsc::channel(self.config.stage_capacity.max(1));

        let session = Session {
            job,
            manager: Arc::clone(&self.manager),
            speech: Arc::clone(&self.speech),
            config: self.config.clone(),
            shutdown: Shutdown::default(),
            events: events_tx,
        };
        let span = tracing::info_span!("session", %job_id);
        let task = tokio::spawn(session.run(frames_rx).instrument(span));

        Ok(SessionHandle {
            job_id,
            frames: frames_tx,
            events: events_rx,
            task,
        })
    }
}

/// The client side of a live session.
///
/// Dropping the handle, or calling [`SessionHandle::finish`] without
/// [`SessionHandle::end`], is treated as a lost connection.
pub struct SessionHandle {
    job_id: JobId,
    frames: mpsc::Sender<ClientFrame>,
    events: mpsc::Receiver<SessionEvent>,
    task: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub async fn send_audio(&self, data: Vec<u8>) -> Result<(), SessionClosed> {
        self.send(ClientFrame::Audio(data)).await
    }

    pub async fn end_utterance(&self) -> Result<(), SessionClosed> {
        self.send(ClientFrame::EndOfUtterance).await
    }

    pub async fn end(&self) -> Result<(), SessionClosed> {
        self.send(ClientFrame::EndSession).await
    }

    pub async fn send(&self, frame: ClientFrame) -> Result<(), SessionClosed> {
        self.frames.send(frame).await.map_err(|_| SessionClosed)
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Reads events until the interviewer has answered the latest utterance,
    /// passing each one to `observe`. A non-fatal interviewer failure counts
    /// as the answer. Returns false once the session is over.
    pub async fn next_reply(&mut self, mut observe: impl FnMut(SessionEvent)) -> bool {
        while let Some(event) = self.next_event().await {
            let replied = match &event {
                SessionEvent::TranscriptUpdate(message) => message.speaker == Speaker::Interviewer,
                SessionEvent::Error {
                    code, fatal: false, ..
                } => *code == SessionErrorCode::InterviewerFailed,
                _ => false,
            };
            let ended = matches!(
                event,
                SessionEvent::Closed { .. } | SessionEvent::Error { fatal: true, .. }
            );
            observe(event);
            if ended {
                return false;
            }
            if replied {
                return true;
            }
        }
        false
    }

    /// Waits for the session to close, returning its outcome and every
    /// event not yet consumed.
    pub async fn finish(self) -> Result<(SessionOutcome, Vec<SessionEvent>), JoinError> {
        let SessionHandle {
            frames,
            mut events,
            task,
            ..
        } = self;
        drop(frames);

        let mut remaining = Vec::new();
        while let Some(event) = events.recv().await {
            remaining.push(event);
        }
        task.await.map(|outcome| (outcome, remaining))
    }
}

struct Session<D, G, S> {
    job: Job,
    manager: Arc<JobManager<D, G>>,
    speech: Arc<S>,
    config: PipelineConfig,
    shutdown: Shutdown,
    events: mpsc::Sender<SessionEvent>,
}

impl<D, G, S> Session<D, G, S>
where
    D: DataStore + Send + Sync + 'static,
    G: AgentGateway + Send + Sync + 'static,
    S: SpeechBridge + Send + Sync + 'static,
{
    async fn run(self, frames: mpsc::Receiver<ClientFrame>) -> SessionOutcome {
        let capacity = self.config.stage_capacity.max(1);
        let retry = self.manager.config().retry.clone();
        let buffer = Arc::new(IngestBuffer::new(self.config.ingest_capacity));

        let (segments_tx, segments_rx) = mpsc::channel(capacity);
        let (speak_tx, speak_rx) = mpsc::channel(capacity);
        let (audio_tx, audio_rx) = mpsc::channel(capacity);

        let ingest = tokio::spawn(
            ingest::run(
                frames,
                Arc::clone(&buffer),
                self.shutdown.clone(),
                self.config.utterance_silence,
                self.events.clone(),
            )
            .in_current_span(),
        );

        let transcribe = tokio::spawn(
            stages::transcribe(
                buffer,
                Arc::clone(&self.speech),
                retry.clone(),
                self.config.transcribe_concurrency,
                segments_tx,
                self.events.clone(),
            )
            .in_current_span(),
        );

        let interviewer = tokio::spawn(
            InterviewerStage {
                gateway: Arc::clone(self.manager.gateway()),
                retry: retry.clone(),
                topic: self.job.topic.clone(),
                max_questions: self.config.max_questions,
                max_consecutive_failures: self.config.max_consecutive_turn_failures,
                open_with_greeting: self.config.open_with_greeting,
                shutdown: self.shutdown.clone(),
                events: self.events.clone(),
                speak: speak_tx,
                transcript: InterviewTranscript::new(),
                questions_asked: 0,
                consecutive_failures: 0,
            }
            .run(segments_rx)
            .in_current_span(),
        );

        let synthesize = tokio::spawn(
            stages::synthesize(
                Arc::clone(&self.speech),
                retry,
                speak_rx,
                audio_tx,
                self.events.clone(),
                self.shutdown.clone(),
            )
            .in_current_span(),
        );

        let egress = tokio::spawn(
            stages::egress(audio_rx, self.events.clone(), self.shutdown.clone()).in_current_span(),
        );

        let mut transcript = interviewer.await.unwrap_or_else(|e| {
            tracing::error!(error = %e, "Interviewer stage did not complete");
            InterviewTranscript::new()
        });

        let reason = self.shutdown.reason().unwrap_or(EndReason::ConnectionLost);
        transcript.partial = reason.is_partial();

        let job_id = self.job.id;
        let job_started = match self.manager.start(job_id, transcript.clone()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "Failed to hand transcript to job manager");
                let _ = self
                    .events
                    .send(SessionEvent::Error {
                        code: SessionErrorCode::JobStartFailed,
                        message: e.to_string(),
                        fatal: true,
                    })
                    .await;
                false
            }
        };

        for (stage, handle) in [
            ("ingest", ingest),
            ("transcribe", transcribe),
            ("synthesize", synthesize),
            ("egress", egress),
        ] {
            if let Err(e) = handle.await {
                tracing::error!(stage, error = %e, "Pipeline stage did not complete");
            }
        }

        tracing::info!(
            reason = reason.as_str(),
            messages = transcript.len(),
            partial = transcript.partial,
            job_started,
            "Session closed"
        );
        let _ = self.events.send(SessionEvent::Closed { reason }).await;

        SessionOutcome {
            job_id,
            reason,
            transcript,
            job_started,
        }
    }
}
