//! Utterance recording
//!
//! Pulls frames from a [`FrameSource`], gates them through a
//! [`VoiceActivityGate`], and stops once speech has been followed by more
//! than `ceil(silence_timeout / chunk)` silent frames.

use std::path::{Path, PathBuf};
use std::time::Duration;

use super::capture::{
    CHUNK_DURATION, FrameSource, SAMPLE_RATE, StopSignal, encode_wav, samples_per_chunk,
};
use super::gate::{RollingBuffer, VoiceActivityGate};
use crate::{Error, Result};

/// Silence after speech that ends an utterance
pub const SILENCE_TIMEOUT: Duration = Duration::from_millis(500);

/// Length of the trailing window the gate classifies
pub const ROLLING_WINDOW: Duration = Duration::from_millis(1500);

/// Recorder timing and output settings
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Capture sample rate
    pub sample_rate: u32,
    /// Duration of one frame
    pub chunk: Duration,
    /// Silence after speech that ends the utterance
    pub silence_timeout: Duration,
    /// Trailing window handed to the classifier
    pub window: Duration,
    /// Directory that receives finished utterance files
    pub asset_dir: PathBuf,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            chunk: CHUNK_DURATION,
            silence_timeout: SILENCE_TIMEOUT,
            window: ROLLING_WINDOW,
            asset_dir: std::env::temp_dir(),
        }
    }
}

impl RecorderConfig {
    /// Number of silent frames tolerated after speech
    ///
    /// Recording stops on the first frame that pushes the counter past
    /// this value.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn max_silence_chunks(&self) -> usize {
        let chunk = self.chunk.as_micros().max(1);
        self.silence_timeout.as_micros().div_ceil(chunk) as usize
    }

    /// Samples per frame
    #[must_use]
    pub fn frame_len(&self) -> usize {
        samples_per_chunk(self.sample_rate, self.chunk)
    }
}

/// Recorder lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    /// Stream not opened
    Idle,
    /// Stream open, no speech yet
    Listening,
    /// Last frame contained speech
    SpeechDetected,
    /// Counting silent frames after speech
    Silence,
    /// Stream closing, asset being written
    Finalizing,
    /// Utterance handed off
    Done,
    /// Listening ended without a finished utterance
    NoSpeech,
}

/// A finished recording persisted as a WAV file
#[derive(Debug)]
pub struct Utterance {
    path: PathBuf,
    frames: usize,
    samples: usize,
    sample_rate: u32,
}

impl Utterance {
    /// Location of the WAV file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of captured frames
    #[must_use]
    pub const fn frames(&self) -> usize {
        self.frames
    }

    /// Number of captured samples
    #[must_use]
    pub const fn samples(&self) -> usize {
        self.samples
    }

    /// Length of the recording
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples as f64 / f64::from(self.sample_rate))
    }

    /// Delete the file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be removed
    pub fn remove(self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

/// Result of one recording attempt
#[derive(Debug)]
pub enum RecordingOutcome {
    /// Speech followed by the silence timeout
    Done(Utterance),
    /// Nothing to hand off; the caller should listen again
    NoSpeech,
}

impl RecordingOutcome {
    /// The utterance, if one was recorded
    #[must_use]
    pub fn into_utterance(self) -> Option<Utterance> {
        match self {
            Self::Done(u) => Some(u),
            Self::NoSpeech => None,
        }
    }
}

/// Raw audio gathered before finalizing
struct Captured {
    samples: Vec<i16>,
    frames: usize,
}

/// Records one utterance per call from a frame source
pub struct UtteranceRecorder<S: FrameSource> {
    source: S,
    gate: VoiceActivityGate,
    config: RecorderConfig,
    stop: StopSignal,
    state: RecorderState,
}

impl<S: FrameSource> UtteranceRecorder<S> {
    /// Create a recorder
    #[must_use]
    pub fn new(source: S, gate: VoiceActivityGate, config: RecorderConfig) -> Self {
        Self {
            source,
            gate,
            config,
            stop: StopSignal::new(),
            state: RecorderState::Idle,
        }
    }

    /// Abort listening when `stop` is raised
    #[must_use]
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Current lifecycle state
    #[must_use]
    pub const fn state(&self) -> RecorderState {
        self.state
    }

    /// Recorder settings
    #[must_use]
    pub const fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Borrow the frame source
    #[must_use]
    pub const fn source(&self) -> &S {
        &self.source
    }

    /// Record until speech ends, the source runs dry, or stop is raised
    ///
    /// Blocks the calling thread on frame reads. The stream is closed on
    /// every exit path.
    ///
    /// # Errors
    ///
    /// Returns `Error::Capture` if the device fails, or an IO/WAV error if
    /// the utterance cannot be written
    pub fn record(&mut self) -> Result<RecordingOutcome> {
        if let Err(e) = self.source.start() {
            self.state = RecorderState::Idle;
            return Err(e);
        }
        self.state = RecorderState::Listening;
        tracing::info!("recording, speak now");

        let captured = self.listen();

        self.state = RecorderState::Finalizing;
        self.source.stop();

        let captured = match captured {
            Ok(Some(captured)) => captured,
            Ok(None) => {
                self.state = RecorderState::NoSpeech;
                return Ok(RecordingOutcome::NoSpeech);
            }
            Err(e) => {
                self.state = RecorderState::Idle;
                return Err(e);
            }
        };

        match self.persist(&captured) {
            Ok(utterance) => {
                self.state = RecorderState::Done;
                tracing::debug!(
                    path = %utterance.path().display(),
                    frames = utterance.frames(),
                    "utterance saved"
                );
                Ok(RecordingOutcome::Done(utterance))
            }
            Err(e) => {
                self.state = RecorderState::Idle;
                Err(e)
            }
        }
    }

    fn listen(&mut self) -> Result<Option<Captured>> {
        let max_silence = self.config.max_silence_chunks();
        let mut window = RollingBuffer::for_window(self.config.sample_rate, self.config.window);
        let mut recorded: Vec<i16> = Vec::new();
        let mut frames = 0usize;
        let mut silence_counter = 0usize;
        let mut speech_detected = false;

        loop {
            if self.stop.is_stopped() {
                tracing::debug!(speech_detected, "recording interrupted");
                return Ok(None);
            }

            let Some(frame) = self.source.read_frame()? else {
                if speech_detected {
                    tracing::debug!(frames, "stream ended mid-utterance, discarding");
                } else {
                    tracing::info!("no speech detected");
                }
                return Ok(None);
            };

            recorded.extend_from_slice(frame.samples());
            frames += 1;
            window.extend(&frame.to_f32());

            if self.gate.is_speech(&mut window) {
                silence_counter = 0;
                if !speech_detected {
                    tracing::info!("speech detected");
                    speech_detected = true;
                }
                self.state = RecorderState::SpeechDetected;
            } else if speech_detected {
                silence_counter += 1;
                self.state = RecorderState::Silence;
            }

            if speech_detected && silence_counter > max_silence {
                tracing::info!(frames, "silence detected, stopping");
                return Ok(Some(Captured {
                    samples: recorded,
                    frames,
                }));
            }
        }
    }

    fn persist(&self, captured: &Captured) -> Result<Utterance> {
        let mut file = tempfile::Builder::new()
            .prefix("utterance-")
            .suffix(".wav")
            .tempfile_in(&self.config.asset_dir)?;

        encode_wav(
            std::io::BufWriter::new(file.as_file_mut()),
            &captured.samples,
            self.config.sample_rate,
        )?;

        let (_, path) = file.keep().map_err(|e| Error::Io(e.error))?;

        Ok(Utterance {
            path,
            frames: captured.frames,
            samples: captured.samples.len(),
            sample_rate: self.config.sample_rate,
        })
    }
}
