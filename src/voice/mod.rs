//! Voice processing module
//!
//! Handles audio capture, voice activity gating, utterance recording,
//! playback, and the STT/TTS backends.

mod capture;
mod gate;
mod output;
mod playback;
mod recorder;
pub mod stt;
pub mod tts;

pub use capture::{
    AudioFrame, CHUNK_DURATION, FrameSource, MicrophoneSource, SAMPLE_RATE, StopSignal,
    encode_wav, samples_per_chunk, samples_to_wav,
};
pub use gate::{
    EnergyClassifier, RollingBuffer, SpeechClassifier, SpeechTimestamp, TimestampParams,
    VadKind, VoiceActivityGate, WebRtcClassifier, timestamps_from_flags,
};
pub use output::CpalOutput;
pub use playback::{
    Clip, OutputDevice, OutputStream, PlaybackBackend, PlaybackBackendKind, PlaybackController,
    RawFormat,
};
pub use recorder::{
    ROLLING_WINDOW, RecorderConfig, RecorderState, RecordingOutcome, SILENCE_TIMEOUT,
    Utterance, UtteranceRecorder,
};
pub use stt::{Transcriber, TranscriberKind};
pub use tts::{SynthesisMode, SynthesisRequest, Synthesizer};
