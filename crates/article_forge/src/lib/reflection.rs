//! # Reflection Loop
//!
//! The Writer/Editor refinement cycle as an explicit finite-state machine.
//! [`ReflectionState::transition`] is pure: given a state and the outcome of
//! the provider call made in that state, it returns the next state.
//! [`ReflectionLoop::run`] performs the calls and persists every draft and
//! every piece of feedback as it is produced.

use std::{future::Future, sync::Arc};

use article_datastore::{ArticleDraft, DataStore, EditorFeedback, InterviewTranscript, JobId};

use crate::{
    config::{EngineConfig, RetryPolicy},
    llm::gateway::{AgentGateway, DraftRequest},
    retry::with_retry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Writing,
    Editing,
}

/// Notified before the loop starts work in a phase. An error aborts the loop.
pub trait PhaseObserver {
    fn on_phase(
        &self,
        phase: LoopPhase,
        iteration: u32,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectionOutcome {
    pub draft: ArticleDraft,
    /// The draft was never approved; the iteration cap ended the loop.
    pub max_iterations_exceeded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReflectionState {
    Writing {
        iteration: u32,
        prior: Option<(ArticleDraft, EditorFeedback)>,
    },
    Editing {
        iteration: u32,
        draft: ArticleDraft,
    },
    Done(ReflectionOutcome),
    Failed {
        iteration: u32,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReflectionEvent {
    DraftProduced(ArticleDraft),
    FeedbackReceived(EditorFeedback),
    Aborted(String),
}

impl ReflectionEvent {
    fn name(&self) -> &'static str {
        match self {
            ReflectionEvent::DraftProduced(_) => "draft",
            ReflectionEvent::FeedbackReceived(_) => "feedback",
            ReflectionEvent::Aborted(_) => "abort",
        }
    }
}

impl ReflectionState {
    pub fn initial() -> Self {
        ReflectionState::Writing {
            iteration: 1,
            prior: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReflectionState::Done(_) | ReflectionState::Failed { .. })
    }

    pub fn iteration(&self) -> u32 {
        match self {
            ReflectionState::Writing { iteration, .. }
            | ReflectionState::Editing { iteration, .. }
            | ReflectionState::Failed { iteration, .. } => *iteration,
            ReflectionState::Done(outcome) => outcome.draft.version,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ReflectionState::Writing { .. } => "writing",
            ReflectionState::Editing { .. } => "editing",
            ReflectionState::Done(_) => "done",
            ReflectionState::Failed { .. } => "failed",
        }
    }

    /// Terminal states absorb every event. The draft version and the
    /// feedback's draft version are stamped from the iteration counter, so
    /// versions advance by exactly one per Writer invocation.
    pub fn transition(self, event: ReflectionEvent, max_iterations: u32) -> Self {
        use ReflectionEvent::*;
        use ReflectionState::*;

        let max_iterations = max_iterations.max(1);

        match (self, event) {
            (state @ (Done(_) | Failed { .. }), _) => state,
            (Writing { iteration, .. }, DraftProduced(draft)) => Editing {
                iteration,
                draft: ArticleDraft {
                    version: iteration,
                    ..draft
                },
            },
            (Editing { iteration, draft }, FeedbackReceived(feedback)) => {
                if feedback.is_approved {
                    Done(ReflectionOutcome {
                        draft,
                        max_iterations_exceeded: false,
                    })
                } else if iteration < max_iterations {
                    Writing {
                        iteration: iteration + 1,
                        prior: Some((
                            draft,
                            EditorFeedback {
                                draft_version: iteration,
                                ..feedback
                            },
                        )),
                    }
                } else {
                    Done(ReflectionOutcome {
                        draft,
                        max_iterations_exceeded: true,
                    })
                }
            }
            (Writing { iteration, .. } | Editing { iteration, .. }, Aborted(reason)) => {
                Failed { iteration, reason }
            }
            (state, event) => Failed {
                iteration: state.iteration(),
                reason: format!("unexpected {} event while {}", event.name(), state.name()),
            },
        }
    }
}

pub struct ReflectionLoop<G, D> {
    gateway: Arc<G>,
    store: Arc<D>,
    max_iterations: u32,
    retry: RetryPolicy,
}

impl<G, D> ReflectionLoop<G, D>
where
    G: AgentGateway + Send + Sync,
    D: DataStore + Send + Sync,
{
    pub fn new(gateway: Arc<G>, store: Arc<D>, config: &EngineConfig) -> Self {
        Self {
            gateway,
            store,
            max_iterations: config.max_iterations,
            retry: config.retry.clone(),
        }
    }

    /// Drives the loop to a terminal state. Never returns a non-terminal state.
    #[tracing::instrument(skip(self, transcript, observer), fields(max_iterations = self.max_iterations))]
    pub async fn run<O>(
        &self,
        job_id: JobId,
        topic: &str,
        target_audience: &str,
        transcript: &InterviewTranscript,
        observer: &O,
    ) -> ReflectionState
    where
        O: PhaseObserver + Sync,
    {
        let mut state = ReflectionState::initial();

        while !state.is_terminal() {
            let event = self
                .step(&state, job_id, topic, target_audience, transcript, observer)
                .await;
            state = state.transition(event, self.max_iterations);
        }

        match &state {
            ReflectionState::Done(outcome) => tracing::info!(
                version = outcome.draft.version,
                max_iterations_exceeded = outcome.max_iterations_exceeded,
                "Reflection loop finished"
            ),
            ReflectionState::Failed { iteration, reason } => {
                tracing::error!(iteration, reason = %reason, "Reflection loop failed")
            }
            _ => {}
        }
        state
    }

    async fn step<O>(
        &self,
        state: &ReflectionState,
        job_id: JobId,
        topic: &str,
        target_audience: &str,
        transcript: &InterviewTranscript,
        observer: &O,
    ) -> ReflectionEvent
    where
        O: PhaseObserver + Sync,
    {
        match state {
            ReflectionState::Writing { iteration, prior } => {
                if let Err(e) = observer.on_phase(LoopPhase::Writing, *iteration).await {
                    return ReflectionEvent::Aborted(format!("failed to record writing status: {e:#}"));
                }

                let request = DraftRequest {
                    topic,
                    target_audience,
                    version: *iteration,
                    transcript,
                    prior_draft: prior.as_ref().map(|(draft, _)| draft),
                    prior_feedback: prior.as_ref().map(|(_, feedback)| feedback),
                };

                let draft = match with_retry(&self.retry, "produce_draft", || {
                    self.gateway.produce_draft(&request)
                })
                .await
                {
                    Ok(draft) => draft,
                    Err(e) => return ReflectionEvent::Aborted(format!("writer failed: {e}")),
                };

                if draft.version != *iteration {
                    tracing::debug!(
                        returned = draft.version,
                        expected = iteration,
                        "Writer returned a different version, renumbering"
                    );
                }
                let draft = ArticleDraft {
                    version: *iteration,
                    ..draft
                };

                if let Err(e) = self.store.append_draft(&job_id, &draft).await {
                    return ReflectionEvent::Aborted(format!("failed to store draft: {e:#}"));
                }
                tracing::info!(version = draft.version, title = %draft.title, "Draft produced");

                ReflectionEvent::DraftProduced(draft)
            }
            ReflectionState::Editing { iteration, draft } => {
                if let Err(e) = observer.on_phase(LoopPhase::Editing, *iteration).await {
                    return ReflectionEvent::Aborted(format!("failed to record editing status: {e:#}"));
                }

                let feedback = match with_retry(&self.retry, "produce_feedback", || {
                    self.gateway.produce_feedback(draft)
                })
                .await
                {
                    Ok(feedback) => EditorFeedback {
                        draft_version: *iteration,
                        ..feedback
                    },
                    Err(e) => return ReflectionEvent::Aborted(format!("editor failed: {e}")),
                };

                if let Err(e) = self.store.append_feedback(&job_id, &feedback).await {
                    return ReflectionEvent::Aborted(format!("failed to store feedback: {e:#}"));
                }
                tracing::info!(
                    version = feedback.draft_version,
                    approved = feedback.is_approved,
                    critiques = feedback.critiques.len(),
                    "Feedback received"
                );

                ReflectionEvent::FeedbackReceived(feedback)
            }
            ReflectionState::Done(_) | ReflectionState::Failed { .. } => {
                ReflectionEvent::Aborted("loop already terminated".into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(title: &str, version: u32) -> ArticleDraft {
        ArticleDraft {
            title: title.to_string(),
            content: "Body".to_string(),
            version,
        }
    }

    fn feedback(is_approved: bool) -> EditorFeedback {
        EditorFeedback {
            is_approved,
            critiques: if is_approved {
                vec![]
            } else {
                vec!["Needs a stronger lede".into()]
            },
            draft_version: 0,
        }
    }

    /// Feeds the machine drafts and editor verdicts until it terminates,
    /// counting Writer invocations.
    fn drive(verdicts: &[bool], max_iterations: u32) -> (ReflectionState, u32) {
        let mut state = ReflectionState::initial();
        let mut verdicts = verdicts.iter().copied();
        let mut writer_calls = 0;

        while !state.is_terminal() {
            let event = match &state {
                ReflectionState::Writing { .. } => {
                    writer_calls += 1;
                    ReflectionEvent::DraftProduced(draft("Remote Work", 99))
                }
                ReflectionState::Editing { .. } => {
                    ReflectionEvent::FeedbackReceived(feedback(verdicts.next().unwrap_or(false)))
                }
                _ => unreachable!(),
            };
            state = state.transition(event, max_iterations);
        }
        (state, writer_calls)
    }

    #[test]
    fn test_approval_after_k_rejections() {
        for k in 0..4 {
            let mut verdicts = vec![false; k];
            verdicts.push(true);

            let (state, writer_calls) = drive(&verdicts, 10);
            assert_eq!(writer_calls, k as u32 + 1);
            match state {
                ReflectionState::Done(outcome) => {
                    assert!(!outcome.max_iterations_exceeded);
                    assert_eq!(outcome.draft.version, k as u32 + 1);
                }
                other => panic!("Expected Done, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_never_approving_editor_stops_at_cap() {
        let (state, writer_calls) = drive(&[], 4);
        assert_eq!(writer_calls, 4);
        assert_eq!(
            state,
            ReflectionState::Done(ReflectionOutcome {
                draft: draft("Remote Work", 4),
                max_iterations_exceeded: true,
            })
        );
    }

    #[test]
    fn test_zero_cap_behaves_as_single_iteration() {
        let (_, writer_calls) = drive(&[], 0);
        assert_eq!(writer_calls, 1);
    }

    #[test]
    fn test_rejection_carries_only_latest_draft_and_feedback() {
        let state = ReflectionState::Editing {
            iteration: 2,
            draft: draft("Second", 2),
        };

        match state.transition(ReflectionEvent::FeedbackReceived(feedback(false)), 3) {
            ReflectionState::Writing { iteration, prior } => {
                assert_eq!(iteration, 3);
                let (prior_draft, prior_feedback) = prior.expect("prior draft");
                assert_eq!(prior_draft.title, "Second");
                assert_eq!(prior_feedback.draft_version, 2);
            }
            other => panic!("Expected Writing, got {other:?}"),
        }
    }

    #[test]
    fn test_abort_fails_from_any_active_state() {
        let writing = ReflectionState::initial()
            .transition(ReflectionEvent::Aborted("writer failed".into()), 3);
        assert_eq!(
            writing,
            ReflectionState::Failed {
                iteration: 1,
                reason: "writer failed".into()
            }
        );

        let editing = ReflectionState::Editing {
            iteration: 2,
            draft: draft("Second", 2),
        }
        .transition(ReflectionEvent::Aborted("editor failed".into()), 3);
        assert!(matches!(editing, ReflectionState::Failed { iteration: 2, .. }));
    }

    #[test]
    fn test_terminal_states_absorb_events() {
        let done = ReflectionState::Done(ReflectionOutcome {
            draft: draft("Final", 1),
            max_iterations_exceeded: false,
        });
        assert_eq!(
            done.clone()
                .transition(ReflectionEvent::DraftProduced(draft("Other", 7)), 3),
            done
        );
    }

    #[test]
    fn test_out_of_order_event_fails_the_loop() {
        let state = ReflectionState::initial()
            .transition(ReflectionEvent::FeedbackReceived(feedback(true)), 3);
        assert!(matches!(state, ReflectionState::Failed { iteration: 1, .. }));
    }
}
