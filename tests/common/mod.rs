//! Shared test utilities
//!
//! Scripted stand-ins for the microphone, the speech model, the speaker,
//! and the network collaborators.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use echoloop::voice::{
    AudioFrame, Clip, FrameSource, OutputDevice, OutputStream, SAMPLE_RATE, SpeechClassifier,
    SpeechTimestamp, SynthesisRequest, Synthesizer, Transcriber, samples_to_wav,
};
use echoloop::{Error, Responder, Result};

/// Samples in one 30 ms frame at 16 kHz
pub const FRAME_LEN: usize = 480;

/// A frame of constant amplitude
#[must_use]
pub fn frame(value: i16) -> AudioFrame {
    AudioFrame::new(vec![value; FRAME_LEN])
}

/// Frame source that replays a fixed list of frames, then runs dry
pub struct ScriptedSource {
    frames: VecDeque<AudioFrame>,
    active: bool,
    pub starts: usize,
    pub stops: usize,
    pub fail_start: bool,
}

impl ScriptedSource {
    #[must_use]
    pub fn new(frames: Vec<AudioFrame>) -> Self {
        Self {
            frames: frames.into(),
            active: false,
            starts: 0,
            stops: 0,
            fail_start: false,
        }
    }

    /// `speech` loud frames followed by `silence` quiet ones
    #[must_use]
    pub fn speech_then_silence(speech: usize, silence: usize) -> Self {
        let mut frames = vec![frame(8000); speech];
        frames.extend(std::iter::repeat_n(frame(0), silence));
        Self::new(frames)
    }

    /// Append another `speech` loud frames followed by `silence` quiet ones
    pub fn extend_script(&mut self, speech: usize, silence: usize) {
        self.frames.extend(std::iter::repeat_n(frame(8000), speech));
        self.frames.extend(std::iter::repeat_n(frame(0), silence));
    }

    /// Frames not yet read
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for ScriptedSource {
    fn start(&mut self) -> Result<()> {
        if self.fail_start {
            return Err(Error::Capture("no input device".to_string()));
        }
        self.starts += 1;
        self.active = true;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<AudioFrame>> {
        assert!(self.active, "read_frame on a closed source");
        Ok(self.frames.pop_front())
    }

    fn stop(&mut self) {
        if self.active {
            self.stops += 1;
        }
        self.active = false;
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

/// Classifier that follows a per-call script of speech decisions
///
/// Calls past the end of the script report silence.
pub struct ScriptedClassifier {
    script: Vec<bool>,
    calls: usize,
}

impl ScriptedClassifier {
    /// Speech for the first `speech_calls` calls
    #[must_use]
    pub fn new(speech_calls: usize) -> Self {
        Self::from_script(vec![true; speech_calls])
    }

    #[must_use]
    pub const fn from_script(script: Vec<bool>) -> Self {
        Self { script, calls: 0 }
    }
}

impl SpeechClassifier for ScriptedClassifier {
    fn speech_timestamps(&mut self, samples: &[f32], _sample_rate: u32) -> Vec<SpeechTimestamp> {
        let speech = self.script.get(self.calls).copied().unwrap_or(false);
        self.calls += 1;
        if speech {
            vec![SpeechTimestamp {
                start: 0,
                end: samples.len(),
            }]
        } else {
            Vec::new()
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Device lifecycle events seen by [`RecordingDevice`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Open(usize),
    Release(usize),
}

/// Output device that logs opens and releases instead of making sound
#[derive(Clone)]
pub struct RecordingDevice {
    events: Arc<Mutex<Vec<DeviceEvent>>>,
    opened: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
    play_time: Duration,
    pub fail_open: bool,
}

impl RecordingDevice {
    /// Each stream finishes `play_time` after opening
    #[must_use]
    pub fn new(play_time: Duration) -> Self {
        Self {
            events: Arc::default(),
            opened: Arc::default(),
            live: Arc::default(),
            max_live: Arc::default(),
            play_time,
            fail_open: false,
        }
    }

    #[must_use]
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Most streams ever open at the same time
    #[must_use]
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl OutputDevice for RecordingDevice {
    fn open(&self, _clip: Clip) -> Result<Box<dyn OutputStream>> {
        if self.fail_open {
            return Err(Error::Playback("device busy".to_string()));
        }

        let id = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
        self.events.lock().unwrap().push(DeviceEvent::Open(id));

        Ok(Box::new(FakeStream {
            id,
            done_at: Instant::now() + self.play_time,
            events: Arc::clone(&self.events),
            live: Arc::clone(&self.live),
        }))
    }
}

struct FakeStream {
    id: usize,
    done_at: Instant,
    events: Arc<Mutex<Vec<DeviceEvent>>>,
    live: Arc<AtomicUsize>,
}

impl OutputStream for FakeStream {
    fn is_finished(&self) -> bool {
        Instant::now() >= self.done_at
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.events.lock().unwrap().push(DeviceEvent::Release(self.id));
    }
}

/// Write a short 16-bit tone to `dir/name`
pub fn write_tone(dir: &Path, name: &str) -> PathBuf {
    let samples: Vec<f32> = (0..1600)
        .map(|i| (i as f32 * 0.05).sin() * 0.3)
        .collect();
    let path = dir.join(name);
    std::fs::write(&path, samples_to_wav(&samples, SAMPLE_RATE).unwrap()).unwrap();
    path
}

/// Transcriber returning canned text
pub struct FakeTranscriber {
    text: String,
    fail: bool,
    /// (path, existed at call time)
    pub seen: Arc<Mutex<Vec<(PathBuf, bool)>>>,
}

impl FakeTranscriber {
    #[must_use]
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            fail: false,
            seen: Arc::default(),
        }
    }

    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new("")
        }
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, audio: &Path) -> Result<String> {
        self.seen
            .lock()
            .unwrap()
            .push((audio.to_path_buf(), audio.exists()));
        if self.fail {
            return Err(Error::Transcription("service unavailable".to_string()));
        }
        Ok(self.text.clone())
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Responder returning canned text and recording its inputs
pub struct FakeResponder {
    reply: String,
    /// (system prompt, user text)
    pub seen: Arc<Mutex<Vec<(String, String)>>>,
}

impl FakeResponder {
    #[must_use]
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            seen: Arc::default(),
        }
    }
}

#[async_trait]
impl Responder for FakeResponder {
    async fn respond(&self, system_prompt: &str, user_text: &str) -> Result<String> {
        self.seen
            .lock()
            .unwrap()
            .push((system_prompt.to_string(), user_text.to_string()));
        Ok(self.reply.clone())
    }
}

/// Synthesizer writing a tone file per request
pub struct FakeSynthesizer {
    dir: PathBuf,
    count: AtomicUsize,
    broken: usize,
    pub requests: Arc<Mutex<Vec<SynthesisRequest>>>,
}

impl FakeSynthesizer {
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            count: AtomicUsize::new(0),
            broken: 0,
            requests: Arc::default(),
        }
    }

    /// The first `broken` requests produce files that do not decode
    #[must_use]
    pub fn with_broken(mut self, broken: usize) -> Self {
        self.broken = broken;
        self
    }
}

#[async_trait]
impl Synthesizer for FakeSynthesizer {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<PathBuf> {
        self.requests.lock().unwrap().push(request.clone());
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.broken {
            let path = self.dir.join(format!("reply{n}.wav"));
            std::fs::write(&path, b"not audio")?;
            return Ok(path);
        }
        Ok(write_tone(&self.dir, &format!("reply{n}.wav")))
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}
