//! Text-to-speech (TTS) processing
//!
//! Every backend produces an audio file on disk and returns its path.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use crate::assets::AssetStore;
use crate::config::SynthesisConfig;
use crate::{Error, Result};

/// Parameters for one synthesis call
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    /// Text to speak
    pub text: String,
    /// Language name or code ("english", "en")
    pub language: String,
    /// Speed multiplier
    pub speed: f32,
    /// Voice reference (sample file or voice name)
    pub voice: Option<String>,
    /// Backend-specific model hint
    pub model: Option<String>,
    /// Speak narration in a secondary voice (ignored by most backends)
    pub narrator: bool,
    /// Secondary voice for narration
    pub narrator_voice: Option<String>,
}

/// Synthesizes speech from text into an audio asset
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize `request.text`, returning the produced file
    ///
    /// # Errors
    ///
    /// Returns `Error::Synthesis` if the backend fails or produces nothing
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<PathBuf>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

/// Synthesis backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SynthesisMode {
    /// Text replies only
    None,
    /// `OpenAI` TTS re-voiced through a CloneVoice server
    Clone,
    /// Local espeak engine
    LocalTts,
    /// AllTalk TTS server
    #[default]
    RemoteTts,
}

impl SynthesisMode {
    /// Whether this mode needs a voice reference
    #[must_use]
    pub const fn requires_voice(self) -> bool {
        matches!(self, Self::Clone | Self::RemoteTts)
    }

    /// Build the backend, or `None` for text-only mode
    ///
    /// # Errors
    ///
    /// Returns error if a required key or local engine is missing
    pub fn build(
        self,
        config: &SynthesisConfig,
        openai_key: Option<&str>,
    ) -> Result<Option<Box<dyn Synthesizer>>> {
        Ok(match self {
            Self::None => None,
            Self::RemoteTts => Some(Box::new(AllTalkSynthesizer::new(
                &config.alltalk_url,
                &config.output_dir,
            ))),
            Self::Clone => Some(Box::new(CloneVoiceSynthesizer::new(
                openai_key.unwrap_or_default().to_string(),
                &config.clone_url,
                &config.clone_base_voice,
                &config.output_dir,
            )?)),
            Self::LocalTts => Some(Box::new(LocalTtsSynthesizer::new(&config.output_dir)?)),
        })
    }
}

/// Map a language name to the short code TTS servers expect
#[must_use]
pub fn language_code(language: &str) -> String {
    let lower = language.trim().to_ascii_lowercase();
    let code = match lower.as_str() {
        "english" => "en",
        "spanish" => "es",
        "french" => "fr",
        "german" => "de",
        "italian" => "it",
        "portuguese" => "pt",
        "polish" => "pl",
        "turkish" => "tr",
        "russian" => "ru",
        "dutch" => "nl",
        "czech" => "cs",
        "arabic" => "ar",
        "chinese" => "zh-cn",
        "japanese" => "ja",
        "hungarian" => "hu",
        "korean" => "ko",
        _ => return lower,
    };
    code.to_string()
}

/// AllTalk TTS server backend
pub struct AllTalkSynthesizer {
    client: reqwest::Client,
    base_url: String,
    store: AssetStore,
}

#[derive(Deserialize)]
struct AllTalkResponse {
    #[serde(default)]
    output_file_path: String,
}

impl AllTalkSynthesizer {
    /// Create a backend for the server at `base_url`
    ///
    /// `output_dir` is searched when the server does not report a path.
    #[must_use]
    pub fn new(base_url: &str, output_dir: &Path) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            store: AssetStore::new(output_dir, "wav"),
        }
    }

    /// Form fields for a generate request
    #[must_use]
    pub fn form(request: &SynthesisRequest) -> Vec<(&'static str, String)> {
        let character = request.voice.clone().unwrap_or_default();
        let narrator = request
            .narrator_voice
            .clone()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| character.clone());

        vec![
            ("text_input", request.text.clone()),
            ("text_filtering", "none".to_string()),
            ("character_voice_gen", character),
            ("narrator_enabled", request.narrator.to_string()),
            ("narrator_voice_gen", narrator),
            ("text_not_inside", "character".to_string()),
            ("language", language_code(&request.language)),
            ("output_file_name", "output".to_string()),
            ("output_file_timestamp", "true".to_string()),
            ("autoplay", "false".to_string()),
            ("autoplay_volume", "0.8".to_string()),
        ]
    }
}

#[async_trait]
impl Synthesizer for AllTalkSynthesizer {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<PathBuf> {
        let url = format!("{}/api/tts-generate", self.base_url);
        tracing::debug!(url = %url, narrator = request.narrator, "AllTalk request");

        let response = self
            .client
            .post(&url)
            .form(&Self::form(request))
            .send()
            .await
            .map_err(|e| Error::Synthesis(format!("AllTalk request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Synthesis(format!("AllTalk error {status}: {body}")));
        }

        let result: AllTalkResponse = response
            .json()
            .await
            .map_err(|e| Error::Synthesis(format!("invalid AllTalk response: {e}")))?;

        if !result.output_file_path.is_empty() {
            return Ok(PathBuf::from(result.output_file_path));
        }

        tracing::debug!(dir = %self.store.dir().display(), "no path reported, using newest file");
        self.store
            .latest()?
            .ok_or_else(|| Error::Synthesis("no audio file generated".to_string()))
    }

    fn name(&self) -> &'static str {
        "remote-tts"
    }
}

/// JSON envelope returned by the CloneVoice server
#[derive(Deserialize)]
struct CloneVoiceReply {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    filename: Option<String>,
}

impl CloneVoiceReply {
    fn ok(self, stage: &str) -> Result<Self> {
        if self.code == 0 {
            Ok(self)
        } else {
            Err(Error::Synthesis(format!(
                "CloneVoice {stage} failed (code {}): {}",
                self.code,
                self.msg.unwrap_or_default()
            )))
        }
    }
}

/// `OpenAI` speech re-voiced by a CloneVoice speech-to-speech server
pub struct CloneVoiceSynthesizer {
    client: reqwest::Client,
    api_key: String,
    server_url: String,
    tts_model: String,
    base_voice: String,
    output_dir: PathBuf,
}

impl CloneVoiceSynthesizer {
    /// Create a clone backend
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(
        api_key: String,
        server_url: &str,
        base_voice: &str,
        output_dir: &Path,
    ) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            server_url: server_url.trim_end_matches('/').to_string(),
            tts_model: "tts-1".to_string(),
            base_voice: base_voice.to_string(),
            output_dir: output_dir.to_path_buf(),
        })
    }

    /// Voice model name the server should convert into
    ///
    /// The model hint wins; otherwise the voice reference's file name.
    #[must_use]
    pub fn target_voice(request: &SynthesisRequest) -> Option<String> {
        request
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .or_else(|| {
                request.voice.as_deref().map(|v| {
                    Path::new(v)
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or(v)
                        .to_string()
                })
            })
    }

    /// Synthesize using `OpenAI` TTS
    async fn base_speech(&self, request: &SynthesisRequest) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
            response_format: &'a str,
        }

        let body = TtsRequest {
            model: &self.tts_model,
            input: &request.text,
            voice: &self.base_voice,
            speed: request.speed,
            response_format: "mp3",
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Synthesis(format!("OpenAI TTS request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Synthesis(format!("OpenAI TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        Ok(audio.to_vec())
    }

    async fn upload(&self, wav: Vec<u8>) -> Result<String> {
        let form = reqwest::multipart::Form::new()
            .part(
                "audio",
                reqwest::multipart::Part::bytes(wav)
                    .file_name("reply.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Synthesis(e.to_string()))?,
            )
            .text("save_dir", "ttslist");

        let reply: CloneVoiceReply = self
            .client
            .post(format!("{}/upload", self.server_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Synthesis(format!("CloneVoice upload failed: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Synthesis(format!("invalid CloneVoice reply: {e}")))?;

        reply
            .ok("upload")?
            .data
            .ok_or_else(|| Error::Synthesis("CloneVoice upload returned no name".to_string()))
    }

    async fn convert(&self, voice: &str, uploaded: &str) -> Result<PathBuf> {
        let reply: CloneVoiceReply = self
            .client
            .post(format!("{}/sts", self.server_url))
            .form(&[("voice", voice), ("name", uploaded)])
            .send()
            .await
            .map_err(|e| Error::Synthesis(format!("CloneVoice sts failed: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Synthesis(format!("invalid CloneVoice reply: {e}")))?;

        reply
            .ok("sts")?
            .filename
            .map(PathBuf::from)
            .ok_or_else(|| Error::Synthesis("CloneVoice sts returned no file".to_string()))
    }
}

#[async_trait]
impl Synthesizer for CloneVoiceSynthesizer {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<PathBuf> {
        let voice = Self::target_voice(request)
            .ok_or_else(|| Error::Config("clone synthesis requires a voice".to_string()))?;

        let mp3 = self.base_speech(request).await?;
        let wav = mp3_to_wav(&mp3)?;
        let uploaded = self.upload(wav).await?;
        let cloned = self.convert(&voice, &uploaded).await?;
        tracing::debug!(voice = %voice, cloned = %cloned.display(), "voice cloned");

        std::fs::create_dir_all(&self.output_dir)?;
        let target = tempfile::Builder::new()
            .prefix("clone-")
            .suffix(".wav")
            .tempfile_in(&self.output_dir)?;
        let (_, path) = target.keep().map_err(|e| Error::Io(e.error))?;

        if let Err(e) = tokio::fs::copy(&cloned, &path).await {
            let _ = std::fs::remove_file(&path);
            return Err(Error::Synthesis(format!(
                "cannot copy {}: {e}",
                cloned.display()
            )));
        }

        Ok(path)
    }

    fn name(&self) -> &'static str {
        "clone"
    }
}

/// Re-encode MP3 bytes as 16-bit WAV, keeping rate and channels
fn mp3_to_wav(mp3: &[u8]) -> Result<Vec<u8>> {
    let clip = super::playback::decode_mp3(mp3).map_err(|e| Error::Synthesis(e.to_string()))?;

    let spec = hound::WavSpec {
        channels: clip.channels,
        sample_rate: clip.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in &clip.samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32768.0).clamp(-32768.0, 32767.0) as i16;
            writer.write_sample(sample_i16)?;
        }
        writer.finalize()?;
    }

    Ok(cursor.into_inner())
}

/// espeak default speaking rate in words per minute
const ESPEAK_WPM: f32 = 175.0;

/// Local espeak-ng/espeak backend
pub struct LocalTtsSynthesizer {
    program: PathBuf,
    output_dir: PathBuf,
}

impl LocalTtsSynthesizer {
    /// Locate a local TTS engine on `PATH`
    ///
    /// # Errors
    ///
    /// Returns error if neither espeak-ng nor espeak is installed
    pub fn new(output_dir: &Path) -> Result<Self> {
        let program = which::which("espeak-ng")
            .or_else(|_| which::which("espeak"))
            .map_err(|_| {
                Error::Config("local TTS needs espeak-ng or espeak on PATH".to_string())
            })?;

        tracing::debug!(program = %program.display(), "local TTS engine found");
        Ok(Self::with_program(program, output_dir))
    }

    /// Use a specific engine binary
    #[must_use]
    pub fn with_program(program: PathBuf, output_dir: &Path) -> Self {
        Self {
            program,
            output_dir: output_dir.to_path_buf(),
        }
    }

    /// Command-line arguments for one request (excluding the output path)
    ///
    /// The text itself is fed on stdin so a leading `-` is never parsed as
    /// an option.
    #[must_use]
    pub fn args(request: &SynthesisRequest) -> Vec<String> {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let wpm = (ESPEAK_WPM * request.speed).round().max(80.0) as u32;

        let mut args = vec!["-s".to_string(), wpm.to_string()];
        let language = language_code(&request.language);
        if !language.is_empty() {
            args.push("-v".to_string());
            args.push(language);
        }
        args.push("--stdin".to_string());
        args
    }

    async fn run(&self, path: &Path, request: &SynthesisRequest) -> Result<()> {
        let mut child = tokio::process::Command::new(&self.program)
            .arg("-w")
            .arg(path)
            .args(Self::args(request))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Synthesis(format!("cannot run {}: {e}", self.program.display())))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.text.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let out = child.wait_with_output().await?;
        if out.status.success() {
            Ok(())
        } else {
            Err(Error::Synthesis(format!(
                "{} exited with {}: {}",
                self.program.display(),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl Synthesizer for LocalTtsSynthesizer {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)?;
        let target = tempfile::Builder::new()
            .prefix("local-")
            .suffix(".wav")
            .tempfile_in(&self.output_dir)?;
        let (_, path) = target.keep().map_err(|e| Error::Io(e.error))?;

        if let Err(e) = self.run(&path, request).await {
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }
        Ok(path)
    }

    fn name(&self) -> &'static str {
        "local-tts"
    }
}
