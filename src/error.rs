//! Error types for echoloop

use thiserror::Error;

/// Result type alias for echoloop operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the conversation loop
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone could not be opened or stopped delivering audio
    #[error("capture error: {0}")]
    Capture(String),

    /// Asset decode or output device failure
    #[error("playback error: {0}")]
    Playback(String),

    /// Speech-to-text error
    #[error("transcription error: {0}")]
    Transcription(String),

    /// Chat completion error
    #[error("responder error: {0}")]
    Responder(String),

    /// Text-to-speech error
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WAV encode/decode error
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
}

impl Error {
    /// Whether the conversation loop may continue with the next turn
    ///
    /// Everything except a configuration problem only abandons the
    /// current turn.
    #[must_use]
    pub const fn is_turn_recoverable(&self) -> bool {
        !matches!(self, Self::Config(_))
    }
}
