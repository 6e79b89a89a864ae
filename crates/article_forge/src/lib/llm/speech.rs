use std::future::Future;

use futures::stream::BoxStream;

use crate::error::GatewayError;

/// Synthesized audio, delivered as the provider produces it.
pub type AudioStream = BoxStream<'static, Result<Vec<u8>, GatewayError>>;

/// One inbound audio buffer, numbered in the order it was received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub index: u64,
    pub data: Vec<u8>,
}

/// Speech-to-text and text-to-speech capabilities of the speech provider.
pub trait SpeechBridge {
    fn transcribe(
        &self,
        chunk: &AudioChunk,
    ) -> impl Future<Output = Result<String, GatewayError>> + Send;

    /// Opens a synthesis stream; failures after the stream is open are
    /// reported through its items.
    fn synthesize(
        &self,
        text: &str,
    ) -> impl Future<Output = Result<AudioStream, GatewayError>> + Send;
}
