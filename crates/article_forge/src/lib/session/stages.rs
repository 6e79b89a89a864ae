//! Speech-to-text, interviewer turn, text-to-speech and egress stages.
//!
//! Stages are connected by bounded channels, so a slow stage holds back the
//! one feeding it. Each stage ends when its input closes, after finishing
//! the item in hand.

use std::sync::Arc;

use article_datastore::{InterviewTranscript, Speaker};
use futures::{stream::FuturesUnordered, StreamExt};
use itertools::Itertools;
use tokio::sync::mpsc;

use super::{
    ingest::{IngestBuffer, Ingested},
    report,
    resequencer::Resequencer,
    EndReason, SessionErrorCode, SessionEvent, Shutdown,
};
use crate::{
    config::RetryPolicy,
    error::GatewayError,
    llm::{
        gateway::{AgentGateway, InterviewContext, InterviewPhase},
        speech::{AudioChunk, SpeechBridge},
    },
    retry::with_retry,
};

/// Transcribed text in receive order, with utterance boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Segment {
    Text(String),
    UtteranceEnd,
}

async fn transcribe_chunk<S: SpeechBridge>(
    speech: &S,
    retry: &RetryPolicy,
    sequence: u64,
    chunk: AudioChunk,
) -> (u64, u64, Result<String, GatewayError>) {
    let result = with_retry(retry, "transcribe", || speech.transcribe(&chunk)).await;
    (sequence, chunk.index, result)
}

/// Runs up to `concurrency` transcriptions at once and re-sequences their
/// results so segments leave in the order the audio arrived.
#[tracing::instrument(name = "transcribe", skip_all)]
pub(super) async fn transcribe<S>(
    buffer: Arc<IngestBuffer>,
    speech: Arc<S>,
    retry: RetryPolicy,
    concurrency: usize,
    segments: mpsc::Sender<Segment>,
    events: mpsc::Sender<SessionEvent>,
) where
    S: SpeechBridge + Send + Sync,
{
    let concurrency = concurrency.max(1);
    let mut resequencer = Resequencer::new();
    let mut in_flight = FuturesUnordered::new();
    let mut next_sequence = 0u64;
    let mut input_open = true;

    loop {
        tokio::select! {
            item = buffer.pop(), if input_open && in_flight.len() < concurrency => match item {
                Some(Ingested::Chunk(chunk)) => {
                    in_flight.push(transcribe_chunk(speech.as_ref(), &retry, next_sequence, chunk));
                    next_sequence += 1;
                }
                Some(Ingested::UtteranceEnd) => {
                    resequencer.insert(next_sequence, Segment::UtteranceEnd);
                    next_sequence += 1;
                }
                None => input_open = false,
            },
            Some((sequence, index, result)) = in_flight.next(), if !in_flight.is_empty() => {
                let text = result.unwrap_or_else(|e| {
                    tracing::warn!(chunk = index, error = %e, "Transcription failed, skipping chunk");
                    report(
                        &events,
                        SessionErrorCode::TranscriptionFailed,
                        format!("audio chunk {index} could not be transcribed: {e}"),
                    );
                    String::new()
                });
                resequencer.insert(sequence, Segment::Text(text));
            },
            else => break,
        }

        while let Some(segment) = resequencer.pop_ready() {
            if segments.send(segment).await.is_err() {
                tracing::debug!("Interviewer stage gone, stopping transcription");
                return;
            }
        }
    }

    if resequencer.held_back() > 0 {
        tracing::warn!(held_back = resequencer.held_back(), "Transcription ended with gaps");
    }
}

/// Owns the session transcript. Appends each completed subject utterance
/// and answers it with one interviewer turn.
pub(super) struct InterviewerStage<G> {
    pub gateway: Arc<G>,
    pub retry: RetryPolicy,
    pub topic: String,
    pub max_questions: u32,
    pub max_consecutive_failures: u32,
    pub open_with_greeting: bool,
    pub shutdown: Shutdown,
    pub events: mpsc::Sender<SessionEvent>,
    pub speak: mpsc::Sender<String>,
    pub transcript: InterviewTranscript,
    pub questions_asked: u32,
    pub consecutive_failures: u32,
}

impl<G> InterviewerStage<G>
where
    G: AgentGateway + Send + Sync,
{
    #[tracing::instrument(name = "interviewer", skip_all)]
    pub async fn run(mut self, mut segments: mpsc::Receiver<Segment>) -> InterviewTranscript {
        let mut utterance: Vec<String> = Vec::new();

        if self.open_with_greeting && !self.shutdown.is_triggered() {
            self.take_turn().await;
        }

        while let Some(segment) = segments.recv().await {
            match segment {
                Segment::Text(text) => {
                    let text = text.trim();
                    if !text.is_empty() {
                        utterance.push(text.to_string());
                    }
                }
                Segment::UtteranceEnd => {
                    if utterance.is_empty() {
                        continue;
                    }
                    self.record(Speaker::Subject, utterance.drain(..).join(" "))
                        .await;
                    if !self.shutdown.is_triggered() {
                        self.take_turn().await;
                    }
                }
            }
        }

        if !utterance.is_empty() {
            self.record(Speaker::Subject, utterance.join(" ")).await;
        }

        tracing::info!(
            messages = self.transcript.len(),
            questions_asked = self.questions_asked,
            "Interview finished"
        );
        self.transcript
    }

    async fn record(&mut self, speaker: Speaker, text: String) -> String {
        let message = self.transcript.push(speaker, text).clone();
        let text = message.text.clone();
        // The transcript is authoritative; a departed client only misses the update.
        let _ = self
            .events
            .send(SessionEvent::TranscriptUpdate(message))
            .await;
        text
    }

    async fn ask(&self, phase: InterviewPhase) -> Result<String, GatewayError> {
        let context = InterviewContext {
            topic: self.topic.clone(),
            phase,
            questions_asked: self.questions_asked,
        };
        with_retry(&self.retry, "produce_interview_turn", || {
            self.gateway
                .produce_interview_turn(&context, &self.transcript)
        })
        .await
    }

    async fn say(&mut self, text: String) {
        let text = self.record(Speaker::Interviewer, text).await;
        if self.speak.send(text).await.is_err() {
            tracing::debug!("Synthesis stage gone, turn not spoken");
        }
    }

    async fn take_turn(&mut self) {
        let turn = self
            .ask(InterviewPhase::for_progress(self.questions_asked))
            .await;

        match turn {
            Ok(text) => {
                self.consecutive_failures = 0;
                self.questions_asked += 1;
                let limit_reached = self.questions_asked >= self.max_questions.max(1);
                if limit_reached {
                    tracing::info!(questions_asked = self.questions_asked, "Question limit reached");
                    self.shutdown.trigger(EndReason::InterviewComplete);
                }

                self.say(text).await;
                if limit_reached {
                    self.say_farewell().await;
                }
            }
            Err(e) => {
                self.consecutive_failures += 1;
                tracing::warn!(
                    error = %e,
                    consecutive_failures = self.consecutive_failures,
                    "Interviewer turn failed"
                );

                if self.consecutive_failures >= self.max_consecutive_failures.max(1) {
                    self.shutdown.trigger(EndReason::ProviderUnavailable);
                    let _ = self
                        .events
                        .send(SessionEvent::Error {
                            code: SessionErrorCode::ProviderUnavailable,
                            message: format!("interviewer unavailable: {e}"),
                            fatal: true,
                        })
                        .await;
                } else {
                    report(
                        &self.events,
                        SessionErrorCode::InterviewerFailed,
                        format!("interviewer turn failed: {e}"),
                    );
                }
            }
        }
    }

    /// Closing remarks after the last question. A failure here only costs
    /// the remarks; the interview is already complete.
    async fn say_farewell(&mut self) {
        match self.ask(InterviewPhase::Farewell).await {
            Ok(text) => self.say(text).await,
            Err(e) => {
                tracing::warn!(error = %e, "Closing remarks failed");
                report(
                    &self.events,
                    SessionErrorCode::InterviewerFailed,
                    format!("closing remarks failed: {e}"),
                );
            }
        }
    }
}

/// Streams synthesized audio for each interviewer turn as it is produced.
#[tracing::instrument(name = "synthesize", skip_all)]
pub(super) async fn synthesize<S>(
    speech: Arc<S>,
    retry: RetryPolicy,
    mut lines: mpsc::Receiver<String>,
    audio: mpsc::Sender<Vec<u8>>,
    events: mpsc::Sender<SessionEvent>,
    shutdown: Shutdown,
) where
    S: SpeechBridge + Send + Sync,
{
    while let Some(text) = lines.recv().await {
        if shutdown.reason() == Some(EndReason::ConnectionLost) {
            tracing::debug!("Client disconnected, skipping synthesis");
            continue;
        }

        let mut stream = match with_retry(&retry, "synthesize", || speech.synthesize(&text)).await {
            Ok(stream) => stream,
            Err(e) => {
                report(
                    &events,
                    SessionErrorCode::SynthesisFailed,
                    format!("speech synthesis failed: {e}"),
                );
                continue;
            }
        };

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    if audio.send(bytes).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Synthesis stream failed midway");
                    report(
                        &events,
                        SessionErrorCode::SynthesisFailed,
                        format!("speech synthesis interrupted: {e}"),
                    );
                    break;
                }
            }
        }
    }
}

/// Forwards synthesized audio to the client. Once the client is gone the
/// session is shut down and remaining audio is discarded.
#[tracing::instrument(name = "egress", skip_all)]
pub(super) async fn egress(
    mut audio: mpsc::Receiver<Vec<u8>>,
    events: mpsc::Sender<SessionEvent>,
    shutdown: Shutdown,
) {
    let mut connected = true;
    let mut sent = 0usize;

    while let Some(bytes) = audio.recv().await {
        if !connected {
            continue;
        }
        if events.send(SessionEvent::Audio(bytes)).await.is_err() {
            connected = false;
            shutdown.trigger(EndReason::ConnectionLost);
        } else {
            sent += 1;
        }
    }
    tracing::debug!(chunks = sent, "Egress stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::speech::AudioStream;
    use article_datastore::{ArticleDraft, EditorFeedback};
    use crate::llm::gateway::DraftRequest;
    use std::time::Duration;

    struct EchoSpeech;

    impl SpeechBridge for EchoSpeech {
        async fn transcribe(&self, chunk: &AudioChunk) -> Result<String, GatewayError> {
            // later chunks finish first
            tokio::time::sleep(Duration::from_millis(100 - chunk.index * 10)).await;
            if chunk.data.is_empty() {
                return Err(GatewayError::Provider("silence".into()));
            }
            Ok(String::from_utf8_lossy(&chunk.data).into_owned())
        }

        async fn synthesize(&self, text: &str) -> Result<AudioStream, GatewayError> {
            let chunks = text.bytes().map(|b| Ok(vec![b])).collect::<Vec<_>>();
            Ok(futures::stream::iter(chunks).boxed())
        }
    }

    struct ScriptedInterviewer;

    impl AgentGateway for ScriptedInterviewer {
        async fn produce_interview_turn(
            &self,
            context: &InterviewContext,
            _transcript: &InterviewTranscript,
        ) -> Result<String, GatewayError> {
            Ok(match context.phase {
                InterviewPhase::Farewell => "Thanks for your time".to_string(),
                _ => format!("Question {}", context.questions_asked + 1),
            })
        }

        async fn produce_draft(&self, _request: &DraftRequest<'_>) -> Result<ArticleDraft, GatewayError> {
            Err(GatewayError::Provider("unused".into()))
        }

        async fn produce_feedback(&self, _draft: &ArticleDraft) -> Result<EditorFeedback, GatewayError> {
            Err(GatewayError::Provider("unused".into()))
        }
    }

    fn no_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 0,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transcription_is_resequenced() {
        let buffer = Arc::new(IngestBuffer::new(16));
        for (index, word) in ["one", "two", "", "three"].into_iter().enumerate() {
            buffer.push_audio(AudioChunk {
                index: index as u64,
                data: word.as_bytes().to_vec(),
            });
        }
        buffer.push_marker();
        buffer.close();

        let (segments_tx, mut segments_rx) = mpsc::channel(16);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        transcribe(buffer, Arc::new(EchoSpeech), no_retry(), 4, segments_tx, events_tx).await;

        let mut segments = Vec::new();
        while let Some(segment) = segments_rx.recv().await {
            segments.push(segment);
        }
        assert_eq!(
            segments,
            vec![
                Segment::Text("one".into()),
                Segment::Text("two".into()),
                Segment::Text(String::new()),
                Segment::Text("three".into()),
                Segment::UtteranceEnd,
            ]
        );
        assert!(matches!(
            events_rx.recv().await,
            Some(SessionEvent::Error {
                code: SessionErrorCode::TranscriptionFailed,
                fatal: false,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_interviewer_answers_each_utterance_and_signs_off_at_limit() {
        let (segments_tx, segments_rx) = mpsc::channel(16);
        let (events_tx, mut events_rx) = mpsc::channel(32);
        let (speak_tx, mut speak_rx) = mpsc::channel(16);
        let shutdown = Shutdown::default();

        let stage = InterviewerStage {
            gateway: Arc::new(ScriptedInterviewer),
            retry: no_retry(),
            topic: "Remote Work".into(),
            max_questions: 2,
            max_consecutive_failures: 3,
            open_with_greeting: true,
            shutdown: shutdown.clone(),
            events: events_tx,
            speak: speak_tx,
            transcript: InterviewTranscript::new(),
            questions_asked: 0,
            consecutive_failures: 0,
        };

        for segment in [
            Segment::Text("We went".into()),
            Segment::Text("fully remote.".into()),
            Segment::UtteranceEnd,
            Segment::Text("It worked.".into()),
            Segment::UtteranceEnd,
        ] {
            segments_tx.send(segment).await.unwrap();
        }
        drop(segments_tx);

        let transcript = stage.run(segments_rx).await;
        let turns: Vec<_> = transcript
            .messages
            .iter()
            .map(|m| (m.speaker, m.text.as_str(), m.sequence))
            .collect();
        assert_eq!(
            turns,
            vec![
                (Speaker::Interviewer, "Question 1", 0),
                (Speaker::Subject, "We went fully remote.", 1),
                (Speaker::Interviewer, "Question 2", 2),
                (Speaker::Interviewer, "Thanks for your time", 3),
                (Speaker::Subject, "It worked.", 4),
            ]
        );
        assert_eq!(shutdown.reason(), Some(EndReason::InterviewComplete));
        assert_eq!(speak_rx.recv().await.as_deref(), Some("Question 1"));
        assert_eq!(speak_rx.recv().await.as_deref(), Some("Question 2"));
        assert_eq!(speak_rx.recv().await.as_deref(), Some("Thanks for your time"));

        let mut updates = 0;
        while let Ok(event) = events_rx.try_recv() {
            assert!(matches!(event, SessionEvent::TranscriptUpdate(_)));
            updates += 1;
        }
        assert_eq!(updates, 5);
    }

    #[tokio::test]
    async fn test_egress_detects_departed_client() {
        let (audio_tx, audio_rx) = mpsc::channel(4);
        let (events_tx, events_rx) = mpsc::channel(4);
        let shutdown = Shutdown::default();
        drop(events_rx);

        audio_tx.send(vec![1, 2, 3]).await.unwrap();
        drop(audio_tx);
        egress(audio_rx, events_tx, shutdown.clone()).await;

        assert_eq!(shutdown.reason(), Some(EndReason::ConnectionLost));
    }
}
