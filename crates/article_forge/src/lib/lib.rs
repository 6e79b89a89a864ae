pub mod config;
mod error;
pub mod jobs;
mod llm;
pub mod parser;
pub mod reflection;
pub mod retry;
pub mod session;
pub mod tracing;

pub use config::{EngineConfig, PipelineConfig, RetryPolicy};
pub use error::{GatewayError, JobError, SessionClosed};
pub use jobs::{builder::JobManagerBuilder, ArticleResult, JobManager, JobProgress};
pub use llm::openai;
pub use llm::{
    gateway::{AgentGateway, DraftRequest, InterviewContext, InterviewPhase},
    speech::{AudioChunk, AudioStream, SpeechBridge},
};
pub use session::{
    AudioStreamPipeline, ClientFrame, EndReason, SessionErrorCode, SessionEvent, SessionHandle,
    SessionOutcome,
};
