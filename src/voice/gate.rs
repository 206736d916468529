//! Voice activity gating
//!
//! Speech presence is re-classified from scratch over a trailing window on
//! every frame. A classifier returns speech regions; the gate only decides
//! "any region" (speech frame) versus "no region" (silence frame).

use std::collections::VecDeque;
use std::time::Duration;

use serde::Deserialize;
use webrtc_vad::{SampleRate, Vad, VadMode};

use crate::{Error, Result};

/// Minimum audio energy threshold to consider speech
const ENERGY_THRESHOLD: f32 = 0.03;

/// Length of one classification sub-frame
const ANALYSIS_FRAME: Duration = Duration::from_millis(30);

/// One detected region of speech, `[start, end)` in samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeechTimestamp {
    pub start: usize,
    pub end: usize,
}

impl SpeechTimestamp {
    /// Length of the region in samples
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the region is empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// The most recent `capacity` normalized samples
///
/// Appending past the cap evicts the oldest samples first.
#[derive(Debug, Clone)]
pub struct RollingBuffer {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl RollingBuffer {
    /// Create a buffer holding at most `capacity` samples
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Create a buffer sized to `window` of audio at `sample_rate`
    #[must_use]
    pub fn for_window(sample_rate: u32, window: Duration) -> Self {
        Self::new(super::capture::samples_per_chunk(sample_rate, window))
    }

    /// Append samples, trimming the oldest ones past the cap
    pub fn extend(&mut self, samples: &[f32]) {
        // Only the tail of an oversized append can survive
        let keep = &samples[samples.len().saturating_sub(self.capacity)..];
        self.samples.extend(keep.iter().copied());

        let excess = self.samples.len().saturating_sub(self.capacity);
        self.samples.drain(..excess);
    }

    /// Current contents, oldest first
    pub fn as_slice(&mut self) -> &[f32] {
        self.samples.make_contiguous()
    }

    /// Number of buffered samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the buffer is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Maximum number of samples retained
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A speech classification model
///
/// Given a normalized window of audio, returns every region that contains
/// speech. The result depends only on `samples`; no state carries over
/// from one call to the next.
pub trait SpeechClassifier {
    /// Find speech regions in `samples`
    fn speech_timestamps(&mut self, samples: &[f32], sample_rate: u32) -> Vec<SpeechTimestamp>;

    /// Classifier name for logging
    fn name(&self) -> &'static str;
}

/// Conventions for turning per-frame decisions into regions
#[derive(Debug, Clone, Copy)]
pub struct TimestampParams {
    /// Regions shorter than this are dropped
    pub min_speech: Duration,
    /// Gaps shorter than this do not split a region
    pub min_silence: Duration,
    /// Padding added to both ends of each region
    pub speech_pad: Duration,
}

impl Default for TimestampParams {
    fn default() -> Self {
        Self {
            min_speech: Duration::from_millis(250),
            min_silence: Duration::from_millis(100),
            speech_pad: Duration::from_millis(30),
        }
    }
}

/// Build speech regions from per-frame decisions
///
/// `flags[i]` covers samples `[i * frame_len, (i + 1) * frame_len)`, with
/// the final frame clipped to `total_len`.
#[must_use]
pub fn timestamps_from_flags(
    flags: &[bool],
    frame_len: usize,
    total_len: usize,
    sample_rate: u32,
    params: TimestampParams,
) -> Vec<SpeechTimestamp> {
    let to_samples = |d: Duration| super::capture::samples_per_chunk(sample_rate, d);
    let min_speech = to_samples(params.min_speech);
    let min_silence = to_samples(params.min_silence);
    let pad = to_samples(params.speech_pad);

    let mut runs: Vec<SpeechTimestamp> = Vec::new();
    for (i, &is_speech) in flags.iter().enumerate() {
        if !is_speech {
            continue;
        }
        let start = i * frame_len;
        let end = ((i + 1) * frame_len).min(total_len);

        match runs.last_mut() {
            Some(last) if start.saturating_sub(last.end) < min_silence.max(1) => {
                last.end = end;
            }
            _ => runs.push(SpeechTimestamp { start, end }),
        }
    }

    runs.into_iter()
        .filter(|r| r.len() >= min_speech)
        .map(|r| SpeechTimestamp {
            start: r.start.saturating_sub(pad),
            end: (r.end + pad).min(total_len),
        })
        .collect()
}

/// RMS energy classifier
pub struct EnergyClassifier {
    threshold: f32,
    params: TimestampParams,
}

impl EnergyClassifier {
    /// Create an energy classifier with the default threshold
    #[must_use]
    pub fn new() -> Self {
        Self::with_threshold(ENERGY_THRESHOLD)
    }

    /// Create an energy classifier with a custom RMS threshold
    #[must_use]
    pub fn with_threshold(threshold: f32) -> Self {
        Self {
            threshold,
            params: TimestampParams::default(),
        }
    }
}

impl Default for EnergyClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechClassifier for EnergyClassifier {
    fn speech_timestamps(&mut self, samples: &[f32], sample_rate: u32) -> Vec<SpeechTimestamp> {
        let frame_len = super::capture::samples_per_chunk(sample_rate, ANALYSIS_FRAME).max(1);
        let flags: Vec<bool> = samples
            .chunks(frame_len)
            .map(|chunk| calculate_energy(chunk) > self.threshold)
            .collect();

        timestamps_from_flags(&flags, frame_len, samples.len(), sample_rate, self.params)
    }

    fn name(&self) -> &'static str {
        "energy"
    }
}

/// WebRTC voice activity classifier
///
/// A fresh detector is built for every window, so its adaptive noise
/// floor never carries over from earlier windows.
pub struct WebRtcClassifier {
    sample_rate: u32,
    params: TimestampParams,
}

impl WebRtcClassifier {
    /// Create a WebRTC classifier for `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if the rate is not 8, 16, 32 or 48 kHz
    pub fn new(sample_rate: u32) -> Result<Self> {
        if vad_rate(sample_rate).is_none() {
            return Err(Error::Config(format!(
                "WebRTC VAD does not support {sample_rate} Hz"
            )));
        }

        Ok(Self {
            sample_rate,
            params: TimestampParams::default(),
        })
    }
}

fn vad_rate(sample_rate: u32) -> Option<SampleRate> {
    match sample_rate {
        8000 => Some(SampleRate::Rate8kHz),
        16000 => Some(SampleRate::Rate16kHz),
        32000 => Some(SampleRate::Rate32kHz),
        48000 => Some(SampleRate::Rate48kHz),
        _ => None,
    }
}

impl SpeechClassifier for WebRtcClassifier {
    #[allow(clippy::cast_possible_truncation)]
    fn speech_timestamps(&mut self, samples: &[f32], sample_rate: u32) -> Vec<SpeechTimestamp> {
        if sample_rate != self.sample_rate {
            tracing::warn!(
                expected = self.sample_rate,
                got = sample_rate,
                "sample rate mismatch, skipping classification"
            );
            return Vec::new();
        }

        let Some(rate) = vad_rate(sample_rate) else {
            return Vec::new();
        };
        let mut vad = Vad::new_with_rate_and_mode(rate, VadMode::Aggressive);

        let frame_len = super::capture::samples_per_chunk(sample_rate, ANALYSIS_FRAME);
        let pcm: Vec<i16> = samples
            .iter()
            .map(|&s| (s * 32768.0).clamp(-32768.0, 32767.0) as i16)
            .collect();

        // Partial trailing frames are not classified
        let flags: Vec<bool> = pcm
            .chunks_exact(frame_len)
            .map(|frame| vad.is_voice_segment(frame).unwrap_or(false))
            .collect();

        timestamps_from_flags(&flags, frame_len, samples.len(), sample_rate, self.params)
    }

    fn name(&self) -> &'static str {
        "webrtc"
    }
}

/// Which classifier backs the gate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum VadKind {
    /// WebRTC voice activity detector
    #[default]
    Webrtc,
    /// RMS energy threshold
    Energy,
}

impl VadKind {
    /// Construct the classifier for this kind
    ///
    /// # Errors
    ///
    /// Returns error if the classifier cannot be initialized
    pub fn build(self, sample_rate: u32) -> Result<Box<dyn SpeechClassifier>> {
        Ok(match self {
            Self::Webrtc => Box::new(WebRtcClassifier::new(sample_rate)?),
            Self::Energy => Box::new(EnergyClassifier::new()),
        })
    }
}

/// Binary speech/silence decision over a rolling buffer
pub struct VoiceActivityGate {
    classifier: Box<dyn SpeechClassifier>,
    sample_rate: u32,
}

impl VoiceActivityGate {
    /// Wrap a pre-loaded classifier
    #[must_use]
    pub fn new(classifier: Box<dyn SpeechClassifier>, sample_rate: u32) -> Self {
        tracing::debug!(classifier = classifier.name(), sample_rate, "voice gate ready");
        Self {
            classifier,
            sample_rate,
        }
    }

    /// Classify the buffer contents, returning all speech regions
    pub fn detect(&mut self, buffer: &mut RollingBuffer) -> Vec<SpeechTimestamp> {
        let samples = buffer.as_slice();
        if samples.is_empty() {
            return Vec::new();
        }
        self.classifier.speech_timestamps(samples, self.sample_rate)
    }

    /// Whether the buffer currently counts as a speech frame
    pub fn is_speech(&mut self, buffer: &mut RollingBuffer) -> bool {
        !self.detect(buffer).is_empty()
    }

    /// Sample rate the gate classifies at
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
