//! Configuration management for echoloop
//!
//! Layers, lowest precedence first: built-in defaults, the TOML file,
//! environment variables, then command-line overrides.

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::responder::DEFAULT_MODEL;
use crate::voice::{
    CHUNK_DURATION, PlaybackBackendKind, ROLLING_WINDOW, RawFormat, RecorderConfig,
    SAMPLE_RATE, SILENCE_TIMEOUT, SynthesisMode, SynthesisRequest, TranscriberKind, VadKind,
};
use crate::{Error, Result};

pub use file::{EcholoopConfigFile, config_file_path, load_config_file};

/// Default key file, read when `OPENAI_API_KEY` is unset
pub const DEFAULT_KEY_FILE: &str = "key.txt";

/// Default system prompt file
pub const DEFAULT_PROMPT_FILE: &str = "InitPrompt.txt";

/// Pause after dispatching playback before listening again
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Fastest speed multiplier accepted
pub const MAX_SPEED: f32 = 4.0;

/// echoloop configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Capture and turn timing
    pub audio: AudioConfig,

    /// Speech-to-text backend
    pub transcription: TranscriptionConfig,

    /// Reply generation
    pub responder: ResponderConfig,

    /// Speech synthesis
    pub synthesis: SynthesisConfig,

    /// Audio output
    pub playback: PlaybackConfig,

    /// API keys
    pub api_keys: ApiKeys,

    /// Directory for numbered reply files; `None` disables the reply log
    pub result_dir: Option<PathBuf>,
}

/// Capture configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub chunk: Duration,
    pub silence_timeout: Duration,
    pub window: Duration,
    /// Delay after playback dispatch before the next listen
    pub settle_delay: Duration,
    pub vad: VadKind,
    pub asset_dir: PathBuf,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            chunk: CHUNK_DURATION,
            silence_timeout: SILENCE_TIMEOUT,
            window: ROLLING_WINDOW,
            settle_delay: SETTLE_DELAY,
            vad: VadKind::default(),
            asset_dir: std::env::temp_dir(),
        }
    }
}

impl AudioConfig {
    /// Recorder settings derived from this config
    #[must_use]
    pub fn recorder_config(&self) -> RecorderConfig {
        RecorderConfig {
            sample_rate: self.sample_rate,
            chunk: self.chunk,
            silence_timeout: self.silence_timeout,
            window: self.window,
            asset_dir: self.asset_dir.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TranscriptionConfig {
    pub backend: TranscriberKind,
    /// Overrides the backend's default model
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResponderConfig {
    pub model: String,
    /// Contents of the prompt file (empty when it is missing)
    pub system_prompt: String,
}

/// Speech synthesis configuration
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    pub mode: SynthesisMode,
    pub language: String,
    /// Speed multiplier in (0, 4]
    pub speed: f32,
    /// Voice sample path or voice name
    pub voice: Option<String>,
    /// Optional voice model
    pub model: Option<String>,
    pub narrator: bool,
    pub narrator_voice: Option<String>,
    /// AllTalk server base URL
    pub alltalk_url: String,
    /// CloneVoice server base URL
    pub clone_url: String,
    /// Directory synthesized assets land in
    pub output_dir: PathBuf,
    /// `OpenAI` voice the clone server converts from
    pub clone_base_voice: String,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            mode: SynthesisMode::default(),
            language: "English".to_string(),
            speed: 1.0,
            voice: None,
            model: None,
            narrator: false,
            narrator_voice: None,
            alltalk_url: "http://127.0.0.1:7851".to_string(),
            clone_url: "http://127.0.0.1:9988".to_string(),
            output_dir: PathBuf::from("output"),
            clone_base_voice: "onyx".to_string(),
        }
    }
}

impl SynthesisConfig {
    /// Build a synthesis request for `text` with these settings
    #[must_use]
    pub fn request(&self, text: &str) -> SynthesisRequest {
        SynthesisRequest {
            text: text.to_string(),
            language: self.language.clone(),
            speed: self.speed,
            voice: self.voice.clone(),
            model: self.model.clone(),
            narrator: self.narrator,
            narrator_voice: self.narrator_voice.clone(),
        }
    }
}

/// Audio output configuration
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub backend: PlaybackBackendKind,
    /// Layout assumed for raw PCM assets
    pub raw_format: RawFormat,
    /// Delete each asset once its session ends
    pub remove_after_play: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            backend: PlaybackBackendKind::default(),
            raw_format: RawFormat::default(),
            remove_after_play: true,
        }
    }
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    pub openai: Option<String>,
    pub deepgram: Option<String>,
}

/// Values supplied on the command line
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub language: Option<String>,
    pub speed: Option<f32>,
    pub voice: Option<String>,
    pub model: Option<String>,
    pub synthesis: Option<SynthesisMode>,
    pub transcriber: Option<TranscriberKind>,
    pub narrator: bool,
    pub narrator_voice: Option<String>,
    pub vad: Option<VadKind>,
    pub playback: Option<PlaybackBackendKind>,
    pub key_file: Option<PathBuf>,
    pub prompt_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the config file, environment and overrides
    ///
    /// # Errors
    ///
    /// Returns error if the key or prompt file exists but cannot be read
    pub fn load(overrides: Overrides) -> Result<Self> {
        let file = load_config_file();
        Self::from_sources(file, |name| std::env::var(name).ok(), overrides)
    }

    /// Merge an already-parsed file with an environment lookup and overrides
    ///
    /// # Errors
    ///
    /// Returns error if the key or prompt file exists but cannot be read
    pub fn from_sources(
        fc: EcholoopConfigFile,
        env: impl Fn(&str) -> Option<String>,
        overrides: Overrides,
    ) -> Result<Self> {
        let audio_defaults = AudioConfig::default();
        let ms = |v: Option<u64>, default: Duration| v.map_or(default, Duration::from_millis);

        let audio = AudioConfig {
            sample_rate: fc.audio.sample_rate.unwrap_or(audio_defaults.sample_rate),
            chunk: ms(fc.audio.chunk_ms, audio_defaults.chunk),
            silence_timeout: ms(fc.audio.silence_timeout_ms, audio_defaults.silence_timeout),
            window: ms(fc.audio.window_ms, audio_defaults.window),
            settle_delay: ms(fc.audio.settle_delay_ms, audio_defaults.settle_delay),
            vad: overrides
                .vad
                .or(fc.audio.vad)
                .unwrap_or(audio_defaults.vad),
            asset_dir: fc
                .audio
                .asset_dir
                .map_or(audio_defaults.asset_dir, PathBuf::from),
        };

        let transcription = TranscriptionConfig {
            backend: overrides
                .transcriber
                .or(fc.transcription.backend)
                .unwrap_or_default(),
            model: fc.transcription.model,
        };

        let prompt_file = overrides
            .prompt_file
            .or_else(|| env("ECHOLOOP_PROMPT_FILE").map(PathBuf::from))
            .or_else(|| fc.responder.prompt_file.map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PROMPT_FILE));

        let responder = ResponderConfig {
            model: fc
                .responder
                .model
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            system_prompt: read_prompt_file(&prompt_file)?,
        };

        let syn_defaults = SynthesisConfig::default();
        let synthesis = SynthesisConfig {
            mode: overrides
                .synthesis
                .or(fc.synthesis.mode)
                .unwrap_or(syn_defaults.mode),
            language: overrides
                .language
                .or(fc.synthesis.language)
                .unwrap_or(syn_defaults.language),
            speed: overrides
                .speed
                .or(fc.synthesis.speed)
                .unwrap_or(syn_defaults.speed),
            voice: overrides.voice.or(fc.synthesis.voice),
            model: overrides
                .model
                .or(fc.synthesis.model)
                .filter(|m| !m.is_empty()),
            narrator: overrides.narrator || fc.synthesis.narrator.unwrap_or(false),
            narrator_voice: overrides.narrator_voice.or(fc.synthesis.narrator_voice),
            alltalk_url: env("ECHOLOOP_ALLTALK_URL")
                .or(fc.synthesis.alltalk_url)
                .unwrap_or(syn_defaults.alltalk_url),
            clone_url: env("ECHOLOOP_CLONE_URL")
                .or(fc.synthesis.clone_url)
                .unwrap_or(syn_defaults.clone_url),
            output_dir: fc
                .synthesis
                .output_dir
                .map_or(syn_defaults.output_dir, PathBuf::from),
            clone_base_voice: fc
                .synthesis
                .clone_base_voice
                .unwrap_or(syn_defaults.clone_base_voice),
        };

        let raw_defaults = RawFormat::default();
        let playback = PlaybackConfig {
            backend: overrides
                .playback
                .or(fc.playback.backend)
                .unwrap_or_default(),
            raw_format: RawFormat {
                sample_rate: fc
                    .playback
                    .raw_sample_rate
                    .unwrap_or(raw_defaults.sample_rate),
                channels: fc.playback.raw_channels.unwrap_or(raw_defaults.channels),
            },
            remove_after_play: fc.playback.remove_after_play.unwrap_or(true),
        };

        let key_file = overrides
            .key_file
            .or_else(|| env("ECHOLOOP_KEY_FILE").map(PathBuf::from))
            .or_else(|| fc.api_keys.key_file.map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_KEY_FILE));

        let openai = match env("OPENAI_API_KEY").or(fc.api_keys.openai) {
            Some(key) => Some(key),
            None => read_key_file(&key_file)?,
        };

        let api_keys = ApiKeys {
            openai,
            deepgram: env("DEEPGRAM_API_KEY").or(fc.api_keys.deepgram),
        };

        Ok(Self {
            audio,
            transcription,
            responder,
            synthesis,
            playback,
            api_keys,
            result_dir: Some(fc.result_dir.map_or_else(|| PathBuf::from("result"), PathBuf::from)),
        })
    }

    /// Check settings that would otherwise fail mid-conversation
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid setting
    pub fn validate(&self) -> Result<()> {
        let syn = &self.synthesis;

        if syn.mode.requires_voice() && syn.voice.as_deref().is_none_or(str::is_empty) {
            return Err(Error::Config(format!(
                "synthesis mode {:?} requires --voice",
                syn.mode
            )));
        }

        if !(syn.speed > 0.0 && syn.speed <= MAX_SPEED) {
            return Err(Error::Config(format!(
                "speed must be in (0, {MAX_SPEED}], got {}",
                syn.speed
            )));
        }

        let chunk_us = self.audio.chunk.as_micros();
        if chunk_us == 0 {
            return Err(Error::Config("chunk duration must be non-zero".to_string()));
        }
        if u128::from(self.audio.sample_rate) * chunk_us % 1_000_000 != 0 {
            return Err(Error::Config(format!(
                "{} ms chunks do not hold a whole number of samples at {} Hz",
                self.audio.chunk.as_millis(),
                self.audio.sample_rate
            )));
        }

        if self.audio.window < self.audio.chunk {
            return Err(Error::Config(
                "rolling window must be at least one chunk long".to_string(),
            ));
        }

        Ok(())
    }
}

/// Read the `OpenAI` key from `path`; a missing file yields `None`
///
/// # Errors
///
/// Returns error if the file exists but cannot be read
pub fn read_key_file(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let key = content.trim().to_string();
            tracing::debug!(path = %path.display(), "API key read from file");
            Ok((!key.is_empty()).then_some(key))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Config(format!(
            "cannot read key file {}: {e}",
            path.display()
        ))),
    }
}

/// Read the system prompt from `path`; a missing file yields an empty prompt
///
/// # Errors
///
/// Returns error if the file exists but cannot be read
pub fn read_prompt_file(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "prompt file not found, using empty prompt");
            Ok(String::new())
        }
        Err(e) => Err(Error::Config(format!(
            "cannot read prompt file {}: {e}",
            path.display()
        ))),
    }
}
