use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of one interview-to-article workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Interviewing,
    Writing,
    Editing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Interviewing => "interviewing",
            JobStatus::Writing => "writing",
            JobStatus::Editing => "editing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether moving from `self` to `next` respects the lifecycle order
    /// `pending → interviewing → writing → editing → {writing | completed | failed}`.
    ///
    /// `failed` is reachable from any non-terminal status. Re-entering the
    /// current status is not a transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;

        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Pending, Interviewing) => true,
            (Interviewing, Writing) => true,
            (Writing, Editing) => true,
            (Editing, Writing) | (Editing, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct UnknownJobStatus(pub String);

impl fmt::Display for UnknownJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown job status: {}", self.0)
    }
}

impl std::error::Error for UnknownJobStatus {}

impl FromStr for JobStatus {
    type Err = UnknownJobStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "interviewing" => Ok(JobStatus::Interviewing),
            "writing" => Ok(JobStatus::Writing),
            "editing" => Ok(JobStatus::Editing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(UnknownJobStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub topic: String,
    pub target_audience: String,
    pub status: JobStatus,
    /// Current Writer iteration. While `writing`, the draft with this version
    /// is still being produced.
    pub iteration: u32,
    pub max_iterations_exceeded: bool,
    pub partial_transcript: bool,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(topic: impl Into<String>, target_audience: impl Into<String>) -> Self {
        let now = Utc::now();
        Job {
            id: JobId::new(),
            topic: topic.into(),
            target_audience: target_audience.into(),
            status: JobStatus::Pending,
            iteration: 0,
            max_iterations_exceeded: false,
            partial_transcript: false,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Interviewer,
    Subject,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::Interviewer => "interviewer",
            Speaker::Subject => "subject",
        }
    }
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Speaker {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interviewer" => Ok(Speaker::Interviewer),
            "subject" => Ok(Speaker::Subject),
            other => Err(format!("unknown speaker: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterviewMessage {
    pub speaker: Speaker,
    pub text: String,
    pub sequence: u32,
}

/// Ordered conversation between the interviewer and the subject.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterviewTranscript {
    pub messages: Vec<InterviewMessage>,
    /// Set when the interview ended before it was concluded (e.g. connection loss).
    #[serde(default)]
    pub partial: bool,
}

impl InterviewTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a transcript from whole turns, numbering them in order.
    pub fn from_turns<I, S>(turns: I) -> Self
    where
        I: IntoIterator<Item = (Speaker, S)>,
        S: Into<String>,
    {
        let mut transcript = Self::new();
        for (speaker, text) in turns {
            transcript.push(speaker, text);
        }
        transcript
    }

    /// Appends a message with the next sequence index and returns it.
    pub fn push(&mut self, speaker: Speaker, text: impl Into<String>) -> &InterviewMessage {
        let sequence = self
            .messages
            .last()
            .map(|m| m.sequence + 1)
            .unwrap_or(0);
        self.messages.push(InterviewMessage {
            speaker,
            text: text.into(),
            sequence,
        });
        &self.messages[self.messages.len() - 1]
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether sequence indices strictly increase from message to message.
    pub fn is_well_ordered(&self) -> bool {
        self.messages
            .iter()
            .tuple_windows()
            .all(|(a, b)| a.sequence < b.sequence)
    }

    pub fn count_by(&self, speaker: Speaker) -> usize {
        self.messages.iter().filter(|m| m.speaker == speaker).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleDraft {
    pub title: String,
    pub content: String,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditorFeedback {
    pub is_approved: bool,
    pub critiques: Vec<String>,
    pub draft_version: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_order_is_monotonic() {
        use JobStatus::*;

        assert!(Pending.can_transition_to(Interviewing));
        assert!(Interviewing.can_transition_to(Writing));
        assert!(Writing.can_transition_to(Editing));
        assert!(Editing.can_transition_to(Writing));
        assert!(Editing.can_transition_to(Completed));

        assert!(!Pending.can_transition_to(Writing));
        assert!(!Interviewing.can_transition_to(Editing));
        assert!(!Writing.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Writing));
        assert!(!Editing.can_transition_to(Editing));
    }

    #[test]
    fn test_failed_reachable_only_from_active_states() {
        use JobStatus::*;

        for status in [Pending, Interviewing, Writing, Editing] {
            assert!(status.can_transition_to(Failed), "{status} -> failed");
        }
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Interviewing,
            JobStatus::Writing,
            JobStatus::Editing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
        assert!("archived".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_transcript_push_assigns_increasing_sequence() {
        let mut transcript = InterviewTranscript::new();
        transcript.push(Speaker::Interviewer, "Why does this matter?");
        transcript.push(Speaker::Subject, "Because it affects everyone.");
        transcript.push(Speaker::Interviewer, "Go on.");

        let sequences: Vec<u32> = transcript.messages.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(transcript.count_by(Speaker::Interviewer), 2);
    }

    #[test]
    fn test_transcript_ordering_check() {
        let mut transcript = InterviewTranscript::from_turns([
            (Speaker::Interviewer, "Why?"),
            (Speaker::Subject, "Because."),
        ]);
        assert!(transcript.is_well_ordered());
        assert!(InterviewTranscript::new().is_well_ordered());

        transcript.messages[1].sequence = 0;
        assert!(!transcript.is_well_ordered());
    }

    #[test]
    fn test_transcript_deserializes_without_partial_flag() {
        let json = r#"{"messages":[{"speaker":"subject","text":"hi","sequence":0}]}"#;
        let transcript: InterviewTranscript = serde_json::from_str(json).unwrap();
        assert!(!transcript.partial);
        assert_eq!(transcript.messages[0].speaker, Speaker::Subject);
    }
}
