use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use article_datastore::{ArticleDraft, EditorFeedback, InterviewTranscript};
use article_forge::{AgentGateway, DraftRequest, GatewayError, InterviewContext, InterviewPhase};

pub const FAREWELL: &str = "Thank you, that was a great conversation.";

/// What the Writer was asked to do on one invocation.
#[derive(Debug, Clone)]
pub struct RecordedDraftRequest {
    pub version: u32,
    pub prior_draft_version: Option<u32>,
    pub prior_critiques: Vec<String>,
    pub transcript_messages: usize,
}

#[derive(Clone)]
pub struct MockGateway {
    /// Editor verdicts in order; `default_verdict` once exhausted.
    pub verdicts: Arc<Mutex<VecDeque<bool>>>,
    pub default_verdict: bool,
    pub draft_calls: Arc<Mutex<Vec<RecordedDraftRequest>>>,
    pub feedback_calls: Arc<Mutex<Vec<u32>>>,
    pub turn_calls: Arc<Mutex<Vec<InterviewContext>>>,
    /// Writer calls that fail before the Writer starts succeeding.
    pub transient_draft_failures: Arc<AtomicU32>,
    pub fail_drafts_with: Option<GatewayError>,
    pub fail_turns_with: Option<GatewayError>,
    pub panic_on_draft: bool,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self {
            verdicts: Arc::new(Mutex::new(VecDeque::new())),
            default_verdict: true,
            draft_calls: Arc::new(Mutex::new(Vec::new())),
            feedback_calls: Arc::new(Mutex::new(Vec::new())),
            turn_calls: Arc::new(Mutex::new(Vec::new())),
            transient_draft_failures: Arc::new(AtomicU32::new(0)),
            fail_drafts_with: None,
            fail_turns_with: None,
            panic_on_draft: false,
        }
    }
}

impl MockGateway {
    pub fn approving() -> Self {
        Self::default()
    }

    /// Editor rejects the first `rejections` drafts, then approves.
    pub fn rejecting_then_approving(rejections: usize) -> Self {
        Self {
            verdicts: Arc::new(Mutex::new(vec![false; rejections].into())),
            ..Default::default()
        }
    }

    pub fn never_approving() -> Self {
        Self {
            default_verdict: false,
            ..Default::default()
        }
    }

    pub fn failing(error: GatewayError) -> Self {
        Self {
            fail_drafts_with: Some(error),
            ..Default::default()
        }
    }

    /// Writer that panics instead of returning.
    pub fn panicking() -> Self {
        Self {
            panic_on_draft: true,
            ..Default::default()
        }
    }

    pub fn flaky_writer(failures: u32) -> Self {
        Self {
            transient_draft_failures: Arc::new(AtomicU32::new(failures)),
            ..Default::default()
        }
    }

    pub fn failing_interviewer(error: GatewayError) -> Self {
        Self {
            fail_turns_with: Some(error),
            ..Default::default()
        }
    }

    pub fn writer_calls(&self) -> usize {
        self.draft_calls.lock().unwrap().len()
    }
}

impl AgentGateway for MockGateway {
    async fn produce_interview_turn(
        &self,
        context: &InterviewContext,
        _transcript: &InterviewTranscript,
    ) -> Result<String, GatewayError> {
        self.turn_calls.lock().unwrap().push(context.clone());
        if let Some(ref error) = self.fail_turns_with {
            return Err(error.clone());
        }
        Ok(match context.phase {
            InterviewPhase::Farewell => FAREWELL.to_string(),
            _ => format!("Question {}?", context.questions_asked + 1),
        })
    }

    async fn produce_draft(&self, request: &DraftRequest<'_>) -> Result<ArticleDraft, GatewayError> {
        self.draft_calls.lock().unwrap().push(RecordedDraftRequest {
            version: request.version,
            prior_draft_version: request.prior_draft.map(|d| d.version),
            prior_critiques: request
                .prior_feedback
                .map(|f| f.critiques.clone())
                .unwrap_or_default(),
            transcript_messages: request.transcript.len(),
        });

        if self.panic_on_draft {
            panic!("writer blew up on version {}", request.version);
        }
        if let Some(ref error) = self.fail_drafts_with {
            return Err(error.clone());
        }
        let remaining = self.transient_draft_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_draft_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(GatewayError::SchemaValidation("missing field `title`".into()));
        }

        Ok(ArticleDraft {
            title: format!("{} for {}", request.topic, request.target_audience),
            content: format!("Draft number {}", request.version),
            version: request.version,
        })
    }

    async fn produce_feedback(&self, draft: &ArticleDraft) -> Result<EditorFeedback, GatewayError> {
        self.feedback_calls.lock().unwrap().push(draft.version);
        let is_approved = self
            .verdicts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_verdict);

        Ok(EditorFeedback {
            is_approved,
            critiques: if is_approved {
                vec![]
            } else {
                vec![format!("Revise draft {}", draft.version)]
            },
            draft_version: draft.version,
        })
    }
}
