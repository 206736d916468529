//! Audio playback with preemption
//!
//! [`PlaybackController`] owns what is audible right now. Each `play` stops
//! the previous session and waits for its device handle to be released
//! before opening the next one. Playback itself runs on a per-session
//! thread so the caller is not blocked until completion.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Deserialize;

use super::capture::StopSignal;
use super::output::CpalOutput;
use crate::{Error, Result};

/// How often a session checks for stop or completion
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Decoded audio ready for an output device
#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    /// Interleaved samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Must be played at exactly this format, without conversion
    pub exact_format: bool,
}

impl Clip {
    /// Number of frames (samples per channel)
    #[must_use]
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }

    /// Playing time
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.frames() as f64 / f64::from(self.sample_rate.max(1)))
    }
}

/// Sample layout of raw PCM assets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for RawFormat {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            channels: 1,
        }
    }
}

/// How an asset is turned into samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackBackend {
    /// Container formats (WAV, MP3) decoded in software
    Decoded,
    /// Little-endian 16-bit PCM already in the output's native format
    Raw(RawFormat),
}

impl PlaybackBackend {
    /// Load `path` into a clip
    ///
    /// # Errors
    ///
    /// Returns `Error::Playback` if the asset cannot be read or decoded
    pub fn load(&self, path: &Path) -> Result<Clip> {
        let bytes = std::fs::read(path)
            .map_err(|e| Error::Playback(format!("cannot read {}: {e}", path.display())))?;

        match self {
            Self::Decoded => {
                let ext = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(str::to_ascii_lowercase)
                    .unwrap_or_default();

                match ext.as_str() {
                    "wav" | "wave" => decode_wav(&bytes),
                    "mp3" => decode_mp3(&bytes),
                    other => Err(Error::Playback(format!("unsupported audio format: {other:?}"))),
                }
            }
            Self::Raw(format) => decode_raw(&bytes, *format),
        }
    }
}

/// Backend selection policy from configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PlaybackBackendKind {
    /// Raw for `.pcm`/`.raw` files, decoded otherwise
    #[default]
    Auto,
    /// Always decode
    Decoded,
    /// Always treat as raw PCM
    Raw,
}

impl PlaybackBackendKind {
    /// Pick the backend for one asset
    #[must_use]
    pub fn resolve(self, path: &Path, raw: RawFormat) -> PlaybackBackend {
        match self {
            Self::Decoded => PlaybackBackend::Decoded,
            Self::Raw => PlaybackBackend::Raw(raw),
            Self::Auto => {
                let is_raw = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("pcm") || e.eq_ignore_ascii_case("raw"));
                if is_raw {
                    PlaybackBackend::Raw(raw)
                } else {
                    PlaybackBackend::Decoded
                }
            }
        }
    }
}

/// An audio output that can open one stream per clip
///
/// `open` is called on the session thread; the returned stream lives and
/// is dropped on that thread. Dropping it must release the device.
pub trait OutputDevice: Send + Sync + 'static {
    /// Start playing `clip`
    ///
    /// # Errors
    ///
    /// Returns `Error::Playback` if the device cannot be opened
    fn open(&self, clip: Clip) -> Result<Box<dyn OutputStream>>;
}

/// A playing output stream
pub trait OutputStream {
    /// Whether every sample has been played
    fn is_finished(&self) -> bool;
}

/// One active playback
struct PlaybackSession {
    id: u64,
    path: PathBuf,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl PlaybackSession {
    fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop and wait until the device handle is released
    fn halt(self) {
        self.stop.store(true, Ordering::SeqCst);
        if self.handle.join().is_err() {
            tracing::warn!(session = self.id, "playback thread panicked");
        }
    }
}

/// Serializes playback so only one session is ever audible
pub struct PlaybackController {
    device: Arc<dyn OutputDevice>,
    active: Mutex<Option<PlaybackSession>>,
    next_id: AtomicU64,
    remove_after_play: bool,
}

impl PlaybackController {
    /// Create a controller over `device`
    #[must_use]
    pub fn new(device: Arc<dyn OutputDevice>) -> Self {
        Self {
            device,
            active: Mutex::new(None),
            next_id: AtomicU64::new(1),
            remove_after_play: false,
        }
    }

    /// Create a controller on the default cpal output device
    #[must_use]
    pub fn with_default_output() -> Self {
        Self::new(Arc::new(CpalOutput))
    }

    /// Delete each asset once its playback ends
    #[must_use]
    pub fn remove_after_play(mut self, remove: bool) -> Self {
        self.remove_after_play = remove;
        self
    }

    /// Play `path`, preempting any active session
    ///
    /// Returns once the new session's device is open. The lock is released
    /// on every exit path.
    ///
    /// # Errors
    ///
    /// Returns `Error::Playback` if decoding or opening the device fails
    pub fn play(&self, path: &Path, backend: PlaybackBackend) -> Result<u64> {
        let clip = match backend.load(path) {
            Ok(clip) => clip,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot decode asset");
                self.discard(path);
                return Err(e);
            }
        };

        let mut active = self.lock();

        if let Some(previous) = active.take() {
            tracing::debug!(
                session = previous.id,
                path = %previous.path.display(),
                "preempting playback"
            );
            previous.halt();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = self.spawn_session(id, path, clip)?;
        tracing::info!(session = id, path = %path.display(), "playing");
        *active = Some(session);

        Ok(id)
    }

    /// Stop the active session, if any
    pub fn stop(&self) {
        if let Some(session) = self.lock().take() {
            tracing::debug!(session = session.id, "stopping playback");
            session.halt();
        }
    }

    /// Whether a session is currently producing audio
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.lock().as_ref().is_some_and(PlaybackSession::is_active)
    }

    /// Id of the session currently producing audio
    #[must_use]
    pub fn active_session(&self) -> Option<u64> {
        self.lock()
            .as_ref()
            .filter(|s| s.is_active())
            .map(|s| s.id)
    }

    /// Block until the active session finishes on its own
    pub fn wait_done(&self) {
        while self.is_playing() {
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Block until the active session finishes or `stop` is raised
    ///
    /// A raised signal cuts the session short.
    pub fn wait_done_or_stopped(&self, stop: &StopSignal) {
        while self.is_playing() {
            if stop.is_stopped() {
                self.stop();
                return;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<PlaybackSession>> {
        // A panicked session must not block later playback
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn discard(&self, path: &Path) {
        if self.remove_after_play {
            remove_asset(path);
        }
    }

    fn spawn_session(&self, id: u64, path: &Path, clip: Clip) -> Result<PlaybackSession> {
        let (opened_tx, opened_rx) = std::sync::mpsc::sync_channel::<Result<()>>(1);
        let stop = Arc::new(AtomicBool::new(false));

        let device = Arc::clone(&self.device);
        let thread_stop = Arc::clone(&stop);
        let asset = path.to_path_buf();
        let remove = self.remove_after_play;

        let handle = std::thread::Builder::new()
            .name(format!("playback-{id}"))
            .spawn(move || {
                let stream = match device.open(clip) {
                    Ok(stream) => {
                        let _ = opened_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = opened_tx.send(Err(e));
                        if remove {
                            remove_asset(&asset);
                        }
                        return;
                    }
                };

                while !thread_stop.load(Ordering::SeqCst) && !stream.is_finished() {
                    std::thread::sleep(POLL_INTERVAL);
                }

                drop(stream);
                tracing::debug!(
                    session = id,
                    interrupted = thread_stop.load(Ordering::SeqCst),
                    "playback ended"
                );

                if remove {
                    remove_asset(&asset);
                }
            })
            .map_err(|e| Error::Playback(format!("cannot spawn playback thread: {e}")))?;

        let opened = opened_rx
            .recv()
            .unwrap_or_else(|_| Err(Error::Playback("playback thread exited early".to_string())));

        match opened {
            Ok(()) => Ok(PlaybackSession {
                id,
                path: path.to_path_buf(),
                stop,
                handle,
            }),
            Err(e) => {
                let _ = handle.join();
                tracing::warn!(session = id, error = %e, "cannot open output device");
                Err(e)
            }
        }
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.stop();
    }
}

fn remove_asset(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "cannot remove played asset");
    }
}

/// Decode WAV bytes to interleaved f32 samples
#[allow(clippy::cast_precision_loss)]
fn decode_wav(bytes: &[u8]) -> Result<Clip> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| Error::Playback(format!("WAV decode error: {e}")))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Playback(format!("WAV decode error: {e}")))?,
        hound::SampleFormat::Int if spec.bits_per_sample <= 16 => {
            let scale = f32::from(1u16 << (spec.bits_per_sample - 1));
            reader
                .into_samples::<i16>()
                .map(|s| s.map(|v| f32::from(v) / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Playback(format!("WAV decode error: {e}")))?
        }
        hound::SampleFormat::Int => {
            let scale = (1u64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Playback(format!("WAV decode error: {e}")))?
        }
    };

    Ok(Clip {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        exact_format: false,
    })
}

/// Decode MP3 bytes to interleaved f32 samples
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn decode_mp3(mp3_data: &[u8]) -> Result<Clip> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0u32;
    let mut channels = 0u16;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = frame.sample_rate as u32;
                channels = frame.channels as u16;
                samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Playback(format!("MP3 decode error: {e}"))),
        }
    }

    if channels == 0 {
        return Err(Error::Playback("MP3 contains no audio frames".to_string()));
    }

    Ok(Clip {
        samples,
        sample_rate,
        channels,
        exact_format: false,
    })
}

/// Interpret bytes as little-endian i16 PCM
fn decode_raw(bytes: &[u8], format: RawFormat) -> Result<Clip> {
    let frame_bytes = 2 * usize::from(format.channels.max(1));
    if bytes.len() % frame_bytes != 0 {
        return Err(Error::Playback(format!(
            "raw PCM length {} is not a multiple of {frame_bytes} bytes",
            bytes.len()
        )));
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
        .collect();

    Ok(Clip {
        samples,
        sample_rate: format.sample_rate,
        channels: format.channels,
        exact_format: true,
    })
}
