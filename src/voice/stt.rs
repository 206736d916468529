//! Speech-to-text (STT) processing

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use crate::{Error, Result};

/// Default `OpenAI` transcription model
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-transcribe";

/// Default Deepgram model
pub const DEFAULT_DEEPGRAM_MODEL: &str = "nova-2";

/// Turns a recorded utterance into text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe the WAV file at `audio`
    ///
    /// # Errors
    ///
    /// Returns `Error::Transcription` on service or network failure
    async fn transcribe(&self, audio: &Path) -> Result<String>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

/// Transcription backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum TranscriberKind {
    /// `OpenAI` audio transcriptions endpoint
    #[default]
    Openai,
    /// Deepgram listen endpoint
    Deepgram,
}

impl TranscriberKind {
    /// Default model for this backend
    #[must_use]
    pub const fn default_model(self) -> &'static str {
        match self {
            Self::Openai => DEFAULT_OPENAI_MODEL,
            Self::Deepgram => DEFAULT_DEEPGRAM_MODEL,
        }
    }

    /// Build the backend
    ///
    /// # Errors
    ///
    /// Returns error if the backend's API key is missing
    pub fn build(
        self,
        openai_key: Option<&str>,
        deepgram_key: Option<&str>,
        model: Option<&str>,
    ) -> Result<Box<dyn Transcriber>> {
        let model = model.unwrap_or_else(|| self.default_model()).to_string();
        Ok(match self {
            Self::Openai => Box::new(OpenAiTranscriber::new(
                openai_key.unwrap_or_default().to_string(),
                model,
            )?),
            Self::Deepgram => Box::new(DeepgramTranscriber::new(
                deepgram_key.unwrap_or_default().to_string(),
                model,
            )?),
        })
    }
}

/// Response from `OpenAI` transcription API
#[derive(Deserialize)]
struct OpenAiTranscription {
    text: String,
}

/// Response from Deepgram transcription API
#[derive(Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// Transcribes through the `OpenAI` API
pub struct OpenAiTranscriber {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiTranscriber {
    /// Create a new `OpenAI` transcriber
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: String, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "OpenAI API key required for transcription".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url: "https://api.openai.com".to_string(),
        })
    }

    /// Point at a different API host
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl Transcriber for OpenAiTranscriber {
    async fn transcribe(&self, audio: &Path) -> Result<String> {
        let bytes = tokio::fs::read(audio).await?;
        tracing::debug!(audio_bytes = bytes.len(), model = %self.model, "starting transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Transcription(e.to_string()))?,
            )
            .text("model", self.model.clone());

        let response = self
            .client
            .post(format!("{}/v1/audio/transcriptions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Transcription(format!("request failed: {e}")))?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "transcription API error");
            return Err(Error::Transcription(format!(
                "OpenAI API error {status}: {body}"
            )));
        }

        let result: OpenAiTranscription = response
            .json()
            .await
            .map_err(|e| Error::Transcription(format!("invalid response: {e}")))?;

        tracing::info!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Transcribes through Deepgram
pub struct DeepgramTranscriber {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl DeepgramTranscriber {
    /// Create a new Deepgram transcriber
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: String, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("Deepgram API key required".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
        })
    }
}

#[async_trait]
impl Transcriber for DeepgramTranscriber {
    async fn transcribe(&self, audio: &Path) -> Result<String> {
        let bytes = tokio::fs::read(audio).await?;
        tracing::debug!(audio_bytes = bytes.len(), "starting Deepgram transcription");

        let url = format!(
            "https://api.deepgram.com/v1/listen?model={}&punctuate=true",
            self.model
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", "audio/wav")
            .body(bytes)
            .send()
            .await
            .map_err(|e| Error::Transcription(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Deepgram API error");
            return Err(Error::Transcription(format!(
                "Deepgram API error {status}: {body}"
            )));
        }

        let result: DeepgramResponse = response
            .json()
            .await
            .map_err(|e| Error::Transcription(format!("invalid Deepgram response: {e}")))?;

        let transcript = result
            .results
            .channels
            .first()
            .and_then(|c| c.alternatives.first())
            .map(|a| a.transcript.clone())
            .unwrap_or_default();

        tracing::info!(transcript = %transcript, "transcription complete");
        Ok(transcript)
    }

    fn name(&self) -> &'static str {
        "deepgram"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_keys_rejected() {
        assert!(matches!(
            TranscriberKind::Openai.build(None, None, None),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            TranscriberKind::Deepgram.build(Some("sk-test"), None, None),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_build_with_key() {
        let backend = TranscriberKind::Deepgram.build(None, Some("dg"), None).unwrap();
        assert_eq!(backend.name(), "deepgram");
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let backend = OpenAiTranscriber::new("sk-test".to_string(), "m".to_string()).unwrap();
        let err = backend
            .transcribe(Path::new("/nonexistent/utterance.wav"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_deepgram_response_parsing() {
        let json = r#"{"results":{"channels":[{"alternatives":[{"transcript":"hello there"}]}]}}"#;
        let parsed: DeepgramResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.results.channels[0].alternatives[0].transcript, "hello there");
    }
}
