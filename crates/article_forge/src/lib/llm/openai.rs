use std::time::Duration;

use article_datastore::{ArticleDraft, EditorFeedback, InterviewTranscript};
use futures::{StreamExt, TryStreamExt};
use itertools::Itertools;
use reqwest::Client;
use serde::Deserialize;

use crate::{
    error::GatewayError,
    llm::{
        gateway::{AgentGateway, DraftRequest, InterviewContext},
        speech::{AudioChunk, AudioStream, SpeechBridge},
    },
    parser,
};

/// How many of the latest transcript messages the interviewer sees.
const INTERVIEWER_CONTEXT_MESSAGES: usize = 10;

#[derive(Debug, Clone)]
pub struct OpenAIClient {
    client: Client,
    api_key: String,
    base_url: String,
    chat_model: String,
    voice: String,
    audio_file_name: String,
    audio_mime: String,
}

#[derive(Debug, thiserror::Error)]
pub enum OpenAIError {
    #[error("HTTP error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Response contained no message content")]
    EmptyResponse,
}

impl From<OpenAIError> for GatewayError {
    fn from(value: OpenAIError) -> Self {
        match value {
            empty @ OpenAIError::EmptyResponse => GatewayError::SchemaValidation(empty.to_string()),
            other => GatewayError::Provider(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: CompletionMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CompletionMessage {
    pub role: String,
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TranscribeResponse {
    pub text: String,
}

impl OpenAIClient {
    const INTERVIEWER_PROMPT: &str = include_str!("./prompts/interviewer.txt");
    const WRITER_PROMPT: &str = include_str!("./prompts/writer.txt");
    const EDITOR_PROMPT: &str = include_str!("./prompts/editor.txt");

    const CHAT_MODEL: &str = "gpt-4o";
    const TRANSCRIPTION_MODEL: &str = "whisper-1";
    const SPEECH_MODEL: &str = "tts-1";

    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".into(),
            chat_model: Self::CHAT_MODEL.into(),
            voice: "alloy".into(),
            audio_file_name: "chunk.wav".into(),
            audio_mime: "audio/wav".into(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_chat_model(mut self, model: impl Into<String>) -> Self {
        self.chat_model = model.into();
        self
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }

    /// Container format of inbound audio chunks, e.g. `("chunk.webm", "audio/webm")`.
    pub fn with_audio_format(
        mut self,
        file_name: impl Into<String>,
        mime: impl Into<String>,
    ) -> Self {
        self.audio_file_name = file_name.into();
        self.audio_mime = mime.into();
        self
    }

    async fn error_for_status(resp: reqwest::Response) -> Result<reqwest::Response, OpenAIError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let message = resp.text().await.unwrap_or_default();
        Err(OpenAIError::Api { status, message })
    }

    pub async fn send_completion_request(
        &self,
        system_prompt: &str,
        user_content: impl Into<String>,
        json_mode: bool,
    ) -> Result<String, OpenAIError> {
        let mut body = serde_json::json!({
            "model": self.chat_model,
            "messages": [
                {
                    "role": "system",
                    "content": system_prompt
                },
                {
                    "role": "user",
                    "content": user_content.into()
                }
            ]
        });
        if json_mode {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Failed to make http request"))?;

        let response = Self::error_for_status(resp)
            .await?
            .json::<CompletionResponse>()
            .await?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(OpenAIError::EmptyResponse)
    }

    pub async fn send_transcribe_request(
        &self,
        bytes: Vec<u8>,
    ) -> Result<TranscribeResponse, OpenAIError> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(self.audio_file_name.clone())
            .mime_str(&self.audio_mime)?;

        let form = reqwest::multipart::Form::new()
            .text("model", Self::TRANSCRIPTION_MODEL)
            .text("response_format", "json")
            .part("file", part);

        let resp = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Failed to make http request"))?;

        Ok(Self::error_for_status(resp)
            .await?
            .json::<TranscribeResponse>()
            .await?)
    }

    pub async fn send_speech_request(&self, text: &str) -> Result<reqwest::Response, OpenAIError> {
        let body = serde_json::json!({
            "model": Self::SPEECH_MODEL,
            "voice": self.voice,
            "input": text,
            "response_format": "mp3"
        });

        let resp = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Failed to make http request"))?;

        Self::error_for_status(resp).await
    }

    fn interviewer_prompt(context: &InterviewContext, transcript: &InterviewTranscript) -> String {
        let skip = transcript
            .messages
            .len()
            .saturating_sub(INTERVIEWER_CONTEXT_MESSAGES);
        let conversation = transcript
            .messages
            .iter()
            .skip(skip)
            .map(|m| format!("{}: {}", m.speaker, m.text))
            .join("\n");

        format!(
            "Interview topic: {}\nPhase: {}\nQuestions asked so far: {}\n\nConversation so far:\n{}\n\n\
             Generate the interviewer's next turn.",
            context.topic,
            context.phase.as_str(),
            context.questions_asked,
            if conversation.is_empty() {
                "(the interview has not started yet)"
            } else {
                conversation.as_str()
            }
        )
    }

    fn writer_prompt(request: &DraftRequest<'_>) -> Result<String, OpenAIError> {
        let mut prompt = String::new();
        if let Some(feedback) = request.prior_feedback.filter(|f| !f.critiques.is_empty()) {
            let critiques = feedback.critiques.iter().map(|c| format!("- {c}")).join("\n");
            prompt.push_str(&format!(
                "Editor feedback from previous version:\n{critiques}\n\nAddress all these points in your revision.\n\n"
            ));
        }
        prompt.push_str(&serde_json::to_string_pretty(request)?);
        Ok(prompt)
    }
}

impl AgentGateway for OpenAIClient {
    #[tracing::instrument(skip_all, fields(phase = context.phase.as_str()))]
    async fn produce_interview_turn(
        &self,
        context: &InterviewContext,
        transcript: &InterviewTranscript,
    ) -> Result<String, GatewayError> {
        let reply = self
            .send_completion_request(
                Self::INTERVIEWER_PROMPT,
                Self::interviewer_prompt(context, transcript),
                false,
            )
            .await?;

        parser::parse_interview_turn(&reply)
    }

    #[tracing::instrument(skip_all, fields(version = request.version))]
    async fn produce_draft(&self, request: &DraftRequest<'_>) -> Result<ArticleDraft, GatewayError> {
        let prompt = Self::writer_prompt(request)?;
        let reply = self
            .send_completion_request(Self::WRITER_PROMPT, prompt, true)
            .await?;

        parser::parse_draft(&reply)
    }

    #[tracing::instrument(skip_all, fields(version = draft.version))]
    async fn produce_feedback(&self, draft: &ArticleDraft) -> Result<EditorFeedback, GatewayError> {
        let prompt = serde_json::to_string_pretty(draft).map_err(OpenAIError::from)?;
        let reply = self
            .send_completion_request(Self::EDITOR_PROMPT, prompt, true)
            .await?;

        parser::parse_feedback(&reply, draft.version)
    }
}

impl SpeechBridge for OpenAIClient {
    #[tracing::instrument(skip_all, fields(chunk = chunk.index))]
    async fn transcribe(&self, chunk: &AudioChunk) -> Result<String, GatewayError> {
        let response = self
            .send_transcribe_request(chunk.data.clone())
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Failed to transcribe audio"))?;

        Ok(response.text.trim().to_string())
    }

    #[tracing::instrument(skip_all)]
    async fn synthesize(&self, text: &str) -> Result<AudioStream, GatewayError> {
        let resp = self
            .send_speech_request(text)
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Failed to synthesize speech"))?;

        Ok(resp
            .bytes_stream()
            .map_ok(|bytes| bytes.to_vec())
            .map_err(|e| GatewayError::Provider(e.to_string()))
            .boxed())
    }
}
