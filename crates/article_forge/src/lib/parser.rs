//! # Structured Reply Parser
//!
//! Language models asked for JSON frequently wrap it in Markdown fences or
//! surround it with prose. This module pulls the JSON object out of a raw
//! completion and validates it against the shapes the Writer and Editor
//! roles must produce. Anything that does not match is a
//! [`GatewayError::SchemaValidation`], which the caller retries.

use std::sync::LazyLock;

use article_datastore::{ArticleDraft, EditorFeedback};
use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;

use crate::error::GatewayError;

static CODE_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```").unwrap());

static SPEAKER_LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*\**\s*interviewer\s*\**\s*:\s*").unwrap());

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DraftReply {
    title: String,
    content: String,
    version: u32,
}

#[derive(Debug, Deserialize)]
struct FeedbackReply {
    is_approved: bool,
    critiques: Vec<String>,
}

/// Extracts the first JSON object from a model reply.
///
/// Fenced blocks win over bare objects; otherwise the span from the first
/// `{` to the last `}` is tried.
pub fn extract_json(raw: &str) -> Result<Value, GatewayError> {
    let candidate = CODE_FENCE_RE
        .captures(raw)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str())
        .or_else(|| {
            let start = raw.find('{')?;
            let end = raw.rfind('}')?;
            (start < end).then(|| &raw[start..=end])
        })
        .ok_or_else(|| GatewayError::SchemaValidation("Reply contains no JSON object".into()))?;

    serde_json::from_str(candidate)
        .map_err(|e| GatewayError::SchemaValidation(format!("Reply is not valid JSON: {e}")))
}

fn parse_as<T: DeserializeOwned>(raw: &str, shape: &str) -> Result<T, GatewayError> {
    let json = extract_json(raw)?;
    serde_json::from_value(json)
        .map_err(|e| GatewayError::SchemaValidation(format!("Reply does not match {shape}: {e}")))
}

/// Validates a Writer reply as `{title, content, version}`.
pub fn parse_draft(raw: &str) -> Result<ArticleDraft, GatewayError> {
    let DraftReply {
        title,
        content,
        version,
    } = parse_as(raw, "{title, content, version}")?;

    if title.trim().is_empty() || content.trim().is_empty() {
        return Err(GatewayError::SchemaValidation(
            "Draft title and content must not be empty".into(),
        ));
    }

    Ok(ArticleDraft {
        title: title.trim().to_string(),
        content,
        version,
    })
}

/// Validates an Editor reply as `{is_approved, critiques}` for `draft_version`.
pub fn parse_feedback(raw: &str, draft_version: u32) -> Result<EditorFeedback, GatewayError> {
    let FeedbackReply {
        is_approved,
        critiques,
    } = parse_as(raw, "{is_approved, critiques}")?;

    Ok(EditorFeedback {
        is_approved,
        critiques: critiques
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect(),
        draft_version,
    })
}

/// Normalises an interviewer reply to the bare utterance.
pub fn parse_interview_turn(raw: &str) -> Result<String, GatewayError> {
    let text = SPEAKER_LABEL_RE.replace(raw.trim(), "");
    let text = text.trim().trim_matches('"').trim();

    if text.is_empty() {
        return Err(GatewayError::SchemaValidation(
            "Interviewer reply is empty".into(),
        ));
    }
    Ok(text.to_string())
}
