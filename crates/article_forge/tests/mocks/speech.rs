use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use article_forge::{AudioChunk, AudioStream, GatewayError, SpeechBridge};
use futures::StreamExt;

/// Transcribes audio bytes as UTF-8 text. Within every window of
/// `reorder_window` chunks, later chunks finish first.
#[derive(Clone)]
pub struct MockSpeech {
    pub step: Duration,
    pub reorder_window: u64,
    pub failing_chunks: HashSet<u64>,
    pub synth_chunk_size: usize,
    pub transcribed: Arc<Mutex<Vec<u64>>>,
    pub synthesized: Arc<Mutex<Vec<String>>>,
}

impl Default for MockSpeech {
    fn default() -> Self {
        Self {
            step: Duration::from_millis(10),
            reorder_window: 4,
            failing_chunks: HashSet::new(),
            synth_chunk_size: 4,
            transcribed: Arc::new(Mutex::new(Vec::new())),
            synthesized: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl MockSpeech {
    pub fn slow(step: Duration) -> Self {
        Self {
            step,
            ..Default::default()
        }
    }

    /// Fails transcription of the chunks with the given indices.
    pub fn failing(indices: impl IntoIterator<Item = u64>) -> Self {
        Self {
            failing_chunks: indices.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Order in which transcriptions completed.
    pub fn completion_order(&self) -> Vec<u64> {
        self.transcribed.lock().unwrap().clone()
    }
}

impl SpeechBridge for MockSpeech {
    async fn transcribe(&self, chunk: &AudioChunk) -> Result<String, GatewayError> {
        let window = self.reorder_window.max(1);
        let slot = window - chunk.index % window;
        tokio::time::sleep(self.step * slot as u32).await;

        self.transcribed.lock().unwrap().push(chunk.index);
        if self.failing_chunks.contains(&chunk.index) {
            return Err(GatewayError::Provider("connection reset".into()));
        }
        Ok(String::from_utf8_lossy(&chunk.data).into_owned())
    }

    async fn synthesize(&self, text: &str) -> Result<AudioStream, GatewayError> {
        self.synthesized.lock().unwrap().push(text.to_string());
        let chunks = text
            .as_bytes()
            .chunks(self.synth_chunk_size.max(1))
            .map(|bytes| Ok(bytes.to_vec()))
            .collect::<Vec<_>>();
        Ok(futures::stream::iter(chunks).boxed())
    }
}
