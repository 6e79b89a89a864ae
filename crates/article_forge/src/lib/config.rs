use std::time::Duration;

/// Bounded retry with exponential backoff, applied uniformly to every
/// provider call. `call_timeout` bounds each individual attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            multiplier: 2.0,
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let cap = self.max_backoff.as_secs_f64();

        if secs.is_finite() && secs < cap {
            Duration::from_secs_f64(secs)
        } else {
            self.max_backoff
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Upper bound on Writer invocations per job.
    pub max_iterations: u32,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Audio chunks buffered ahead of transcription before the oldest is dropped.
    pub ingest_capacity: usize,
    /// Capacity of every queue between the later stages.
    pub stage_capacity: usize,
    pub transcribe_concurrency: usize,
    /// Inbound silence that closes the current subject utterance. `None`
    /// waits for an explicit end-of-utterance frame.
    pub utterance_silence: Option<Duration>,
    pub max_questions: u32,
    pub open_with_greeting: bool,
    pub max_consecutive_turn_failures: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ingest_capacity: 64,
            stage_capacity: 16,
            transcribe_concurrency: 4,
            utterance_silence: Some(Duration::from_millis(1500)),
            max_questions: 8,
            open_with_greeting: true,
            max_consecutive_turn_failures: 3,
        }
    }
}
