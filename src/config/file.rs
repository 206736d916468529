//! TOML configuration file loading
//!
//! Supports `~/.config/echoloop/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::voice::{PlaybackBackendKind, SynthesisMode, TranscriberKind, VadKind};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct EcholoopConfigFile {
    /// Capture and turn timing
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Speech-to-text backend
    #[serde(default)]
    pub transcription: TranscriptionFileConfig,

    /// Reply generation
    #[serde(default)]
    pub responder: ResponderFileConfig,

    /// Speech synthesis
    #[serde(default)]
    pub synthesis: SynthesisFileConfig,

    /// Audio output
    #[serde(default)]
    pub playback: PlaybackFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,

    /// Directory for `generatedN.txt` reply files
    pub result_dir: Option<String>,
}

/// Capture configuration; durations are in milliseconds
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    pub sample_rate: Option<u32>,
    pub chunk_ms: Option<u64>,
    pub silence_timeout_ms: Option<u64>,
    pub window_ms: Option<u64>,
    pub settle_delay_ms: Option<u64>,
    pub vad: Option<VadKind>,
    /// Where finished utterances are written before transcription
    pub asset_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TranscriptionFileConfig {
    pub backend: Option<TranscriberKind>,
    pub model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResponderFileConfig {
    /// Chat model (e.g. "gpt-4o-mini")
    pub model: Option<String>,

    /// System prompt file (e.g. "InitPrompt.txt")
    pub prompt_file: Option<String>,
}

/// Synthesis configuration
#[derive(Debug, Default, Deserialize)]
pub struct SynthesisFileConfig {
    pub mode: Option<SynthesisMode>,
    pub language: Option<String>,
    pub speed: Option<f32>,
    /// Voice sample or voice name
    pub voice: Option<String>,
    /// Optional voice model
    pub model: Option<String>,
    pub narrator: Option<bool>,
    pub narrator_voice: Option<String>,
    pub alltalk_url: Option<String>,
    pub clone_url: Option<String>,
    pub output_dir: Option<String>,
    /// `OpenAI` voice re-voiced by the clone server
    pub clone_base_voice: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    pub backend: Option<PlaybackBackendKind>,
    pub raw_sample_rate: Option<u32>,
    pub raw_channels: Option<u16>,
    pub remove_after_play: Option<bool>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub deepgram: Option<String>,
    /// File holding the `OpenAI` key (e.g. "key.txt")
    pub key_file: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `EcholoopConfigFile::default()` if the file doesn't exist or can't be parsed.
#[must_use]
pub fn load_config_file() -> EcholoopConfigFile {
    config_file_path().map_or_else(EcholoopConfigFile::default, |path| load_from(&path))
}

/// Load a config file from `path`, falling back to defaults
#[must_use]
pub fn load_from(path: &Path) -> EcholoopConfigFile {
    if !path.exists() {
        return EcholoopConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                EcholoopConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            EcholoopConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/echoloop/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("echoloop").join("config.toml"))
}
