use std::future::Future;

use article_datastore::{ArticleDraft, EditorFeedback, InterviewTranscript};
use serde::Serialize;

use crate::error::GatewayError;

/// The three role-specific capabilities of the language-model provider.
///
/// Implementations report transport failures as [`GatewayError::Provider`]
/// and malformed structured output as [`GatewayError::SchemaValidation`].
/// Retrying is the caller's concern.
pub trait AgentGateway {
    /// Next interviewer utterance given the conversation so far.
    fn produce_interview_turn(
        &self,
        context: &InterviewContext,
        transcript: &InterviewTranscript,
    ) -> impl Future<Output = Result<String, GatewayError>> + Send;

    fn produce_draft(
        &self,
        request: &DraftRequest<'_>,
    ) -> impl Future<Output = Result<ArticleDraft, GatewayError>> + Send;

    fn produce_feedback(
        &self,
        draft: &ArticleDraft,
    ) -> impl Future<Output = Result<EditorFeedback, GatewayError>> + Send;
}

/// Everything the Writer sees for one iteration. Only the immediately
/// preceding draft and its feedback are carried.
#[derive(Debug, Clone, Serialize)]
pub struct DraftRequest<'a> {
    pub topic: &'a str,
    pub target_audience: &'a str,
    pub version: u32,
    pub transcript: &'a InterviewTranscript,
    pub prior_draft: Option<&'a ArticleDraft>,
    pub prior_feedback: Option<&'a EditorFeedback>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterviewPhase {
    Introduction,
    Main,
    Closing,
    /// Closing remarks once the question limit is reached. Not a question.
    Farewell,
}

impl InterviewPhase {
    const MAIN_FROM: u32 = 2;
    const CLOSING_FROM: u32 = 6;

    /// Introduction for the first two questions, main until six, closing afterwards.
    pub fn for_progress(questions_asked: u32) -> Self {
        if questions_asked >= Self::CLOSING_FROM {
            InterviewPhase::Closing
        } else if questions_asked >= Self::MAIN_FROM {
            InterviewPhase::Main
        } else {
            InterviewPhase::Introduction
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InterviewPhase::Introduction => "introduction",
            InterviewPhase::Main => "main",
            InterviewPhase::Closing => "closing",
            InterviewPhase::Farewell => "farewell",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterviewContext {
    pub topic: String,
    pub phase: InterviewPhase,
    pub questions_asked: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_follows_question_count() {
        let phases: Vec<_> = (0..=8).map(InterviewPhase::for_progress).collect();
        assert_eq!(
            phases,
            vec![
                InterviewPhase::Introduction,
                InterviewPhase::Introduction,
                InterviewPhase::Main,
                InterviewPhase::Main,
                InterviewPhase::Main,
                InterviewPhase::Main,
                InterviewPhase::Closing,
                InterviewPhase::Closing,
                InterviewPhase::Closing,
            ]
        );
    }

    #[test]
    fn test_phase_is_independent_of_question_limit() {
        assert_eq!(InterviewPhase::for_progress(0), InterviewPhase::Introduction);
        assert_eq!(InterviewPhase::for_progress(9), InterviewPhase::Closing);
        assert_eq!(
            serde_json::to_value(InterviewPhase::Farewell).unwrap(),
            serde_json::json!("farewell")
        );
    }
}
