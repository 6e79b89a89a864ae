//! First pipeline stage: numbers inbound audio, detects utterance ends and
//! buffers work for transcription. Overload drops the oldest audio chunk
//! instead of letting latency grow.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::sync::{mpsc, Notify};

use super::{report, ClientFrame, EndReason, SessionErrorCode, SessionEvent, Shutdown};
use crate::llm::speech::AudioChunk;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Ingested {
    Chunk(AudioChunk),
    UtteranceEnd,
}

#[derive(Debug, Default)]
struct BufferState {
    items: VecDeque<Ingested>,
    chunks: usize,
    closed: bool,
}

/// Single-producer, single-consumer queue between ingest and transcription.
#[derive(Debug)]
pub(super) struct IngestBuffer {
    state: Mutex<BufferState>,
    notify: Notify,
    capacity: usize,
}

impl IngestBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `chunk`, returning the oldest buffered chunk if it had to be
    /// dropped to stay within capacity. Utterance markers are never dropped.
    pub fn push_audio(&self, chunk: AudioChunk) -> Option<AudioChunk> {
        let mut state = self.state();

        let mut dropped = None;
        if state.chunks >= self.capacity {
            let oldest = state
                .items
                .iter()
                .position(|item| matches!(item, Ingested::Chunk(_)));
            if let Some(Ingested::Chunk(chunk)) = oldest.and_then(|pos| state.items.remove(pos)) {
                state.chunks -= 1;
                dropped = Some(chunk);
            }
        }

        state.items.push_back(Ingested::Chunk(chunk));
        state.chunks += 1;
        drop(state);

        self.notify.notify_one();
        dropped
    }

    pub fn push_marker(&self) {
        self.state().items.push_back(Ingested::UtteranceEnd);
        self.notify.notify_one();
    }

    /// No more items will be pushed; `pop` returns `None` once drained.
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_one();
    }

    /// Cancel safe: an item is only removed when it is returned.
    pub async fn pop(&self) -> Option<Ingested> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state();
                if let Some(item) = state.items.pop_front() {
                    if matches!(item, Ingested::Chunk(_)) {
                        state.chunks -= 1;
                    }
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}

enum Inbound {
    Frame(ClientFrame),
    Silence,
    Disconnected,
}

async fn next_inbound(
    frames: &mut mpsc::Receiver<ClientFrame>,
    silence: Option<Duration>,
    utterance_open: bool,
) -> Inbound {
    match silence.filter(|_| utterance_open) {
        Some(gap) => match tokio::time::timeout(gap, frames.recv()).await {
            Ok(Some(frame)) => Inbound::Frame(frame),
            Ok(None) => Inbound::Disconnected,
            Err(_) => Inbound::Silence,
        },
        None => frames
            .recv()
            .await
            .map_or(Inbound::Disconnected, Inbound::Frame),
    }
}

#[tracing::instrument(name = "ingest", skip_all)]
pub(super) async fn run(
    mut frames: mpsc::Receiver<ClientFrame>,
    buffer: Arc<IngestBuffer>,
    shutdown: Shutdown,
    silence: Option<Duration>,
    events: mpsc::Sender<SessionEvent>,
) {
    let mut next_index = 0u64;
    let mut utterance_open = false;

    loop {
        let inbound = tokio::select! {
            biased;
            _ = shutdown.triggered() => break,
            _ = events.closed() => {
                shutdown.trigger(EndReason::ConnectionLost);
                break;
            }
            inbound = next_inbound(&mut frames, silence, utterance_open) => inbound,
        };

        match inbound {
            Inbound::Frame(ClientFrame::Audio(data)) => {
                let chunk = AudioChunk {
                    index: next_index,
                    data,
                };
                next_index += 1;
                utterance_open = true;

                if let Some(dropped) = buffer.push_audio(chunk) {
                    tracing::warn!(
                        chunk = dropped.index,
                        bytes = dropped.data.len(),
                        "Ingest buffer full, dropped oldest audio chunk"
                    );
                    report(
                        &events,
                        SessionErrorCode::ChunkDropped,
                        format!("audio chunk {} dropped under load", dropped.index),
                    );
                }
            }
            Inbound::Frame(ClientFrame::EndOfUtterance) | Inbound::Silence => {
                if utterance_open {
                    buffer.push_marker();
                    utterance_open = false;
                }
            }
            Inbound::Frame(ClientFrame::EndSession) => {
                shutdown.trigger(EndReason::ClientEnded);
                break;
            }
            Inbound::Disconnected => {
                shutdown.trigger(EndReason::ConnectionLost);
                break;
            }
        }
    }

    if utterance_open {
        buffer.push_marker();
    }
    buffer.close();
    tracing::debug!(chunks = next_index, "Ingest stopped");
}
