//! Voice input.
//!
//! Audio is turned into text before it reaches the agent loop. A failed
//! transcription is reported to the user and never ends the session.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;
use thiserror::Error;

use crate::config::TranscriptionConfig;
use crate::inference::config::resolve_api_key;

/// Shown to the user whenever audio cannot be turned into text.
pub const TRANSCRIPTION_FAILED_MESSAGE: &str = "Could not transcribe audio.";

const TRANSCRIPTION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error("failed to read audio {path}: {reason}")]
    Audio { path: String, reason: String },

    #[error("transcription request failed: {reason}")]
    Request { reason: String },

    #[error("transcription endpoint returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transcription was empty")]
    Empty,

    #[error("transcription config error: {reason}")]
    Config { reason: String },
}

/// Speech-to-text capability.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &Path) -> Result<String, TranscriptionError>;
}

/// Client for a Whisper-compatible `/audio/transcriptions` endpoint.
pub struct WhisperClient {
    http: reqwest::Client,
    config: TranscriptionConfig,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl WhisperClient {
    pub fn from_config(config: TranscriptionConfig) -> Result<Self, TranscriptionError> {
        let api_key = resolve_api_key(&config.api_key_env).map_err(|e| {
            TranscriptionError::Config {
                reason: e.to_string(),
            }
        })?;
        let http = reqwest::Client::builder()
            .timeout(TRANSCRIPTION_TIMEOUT)
            .build()
            .map_err(|e| TranscriptionError::Config {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            config,
            api_key,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/audio/transcriptions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl Transcriber for WhisperClient {
    async fn transcribe(&self, audio: &Path) -> Result<String, TranscriptionError> {
        let bytes = tokio::fs::read(audio)
            .await
            .map_err(|e| TranscriptionError::Audio {
                path: audio.display().to_string(),
                reason: e.to_string(),
            })?;
        let file_name = audio
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());

        tracing::info!(file = %file_name, bytes = bytes.len(), model = %self.config.model, "transcribing audio");

        let part = multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime_for(audio))
            .map_err(|e| TranscriptionError::Request {
                reason: e.to_string(),
            })?;
        let form = multipart::Form::new()
            .text("model", self.config.model.clone())
            .part("file", part);

        let mut req = self.http.post(self.endpoint()).multipart(form);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|e| TranscriptionError::Request {
            reason: e.to_string(),
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TranscriptionError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TranscriptionResponse =
            response
                .json()
                .await
                .map_err(|e| TranscriptionError::Request {
                    reason: format!("invalid response: {e}"),
                })?;
        let text = parsed.text.trim().to_string();
        if text.is_empty() {
            return Err(TranscriptionError::Empty);
        }
        Ok(text)
    }
}

/// Transcribe, or return the user-facing failure message.
pub async fn transcribe_or_notice(
    transcriber: &dyn Transcriber,
    audio: &Path,
) -> Result<String, String> {
    transcriber.transcribe(audio).await.map_err(|e| {
        tracing::warn!(path = %audio.display(), error = %e, "transcription failed");
        TRANSCRIPTION_FAILED_MESSAGE.to_string()
    })
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("ogg" | "oga" | "opus") => "audio/ogg",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("m4a" | "mp4") => "audio/mp4",
        Some("webm") => "audio/webm",
        Some("flac") => "audio/flac",
        _ => "application/octet-stream",
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
