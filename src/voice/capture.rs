//! Audio capture from microphone

use std::collections::VecDeque;
use std::io::{Seek, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};

use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Duration of one captured frame
pub const CHUNK_DURATION: Duration = Duration::from_millis(30);

/// How long `read_frame` waits for device data before giving up
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// One fixed-length block of signed 16-bit mono samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
}

impl AudioFrame {
    /// Wrap raw samples as a frame
    #[must_use]
    pub const fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    /// Raw samples
    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Number of samples in the frame
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the frame holds no samples
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples normalized to [-1.0, 1.0]
    #[must_use]
    pub fn to_f32(&self) -> Vec<f32> {
        self.samples.iter().map(|&s| f32::from(s) / 32768.0).collect()
    }
}

/// Number of samples in one frame of `chunk` at `sample_rate`
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn samples_per_chunk(sample_rate: u32, chunk: Duration) -> usize {
    (u128::from(sample_rate) * chunk.as_micros() / 1_000_000) as usize
}

/// Shared flag raised by an external interrupt
///
/// Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Create a lowered signal
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the signal has been raised
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A blocking source of fixed-size audio frames
pub trait FrameSource {
    /// Open the underlying stream
    ///
    /// # Errors
    ///
    /// Returns `Error::Capture` if the device is unavailable
    fn start(&mut self) -> Result<()>;

    /// Block until exactly one frame is available
    ///
    /// Returns `Ok(None)` once the source is exhausted or was stopped.
    ///
    /// # Errors
    ///
    /// Returns `Error::Capture` if the stream failed
    fn read_frame(&mut self) -> Result<Option<AudioFrame>>;

    /// Close the stream and release the device
    fn stop(&mut self);

    /// Whether the stream is open
    fn is_active(&self) -> bool;
}

#[derive(Default)]
struct SharedQueue {
    samples: VecDeque<i16>,
    failed: Option<String>,
}

/// Captures frames from the default input device
pub struct MicrophoneSource {
    sample_rate: u32,
    frame_len: usize,
    queue: Arc<(Mutex<SharedQueue>, Condvar)>,
    stream: Option<Stream>,
}

impl MicrophoneSource {
    /// Create a microphone source producing frames of `chunk` duration
    #[must_use]
    pub fn new(sample_rate: u32, chunk: Duration) -> Self {
        Self {
            sample_rate,
            frame_len: samples_per_chunk(sample_rate, chunk),
            queue: Arc::new((Mutex::new(SharedQueue::default()), Condvar::new())),
            stream: None,
        }
    }

    /// Get the sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn stream_config(&self) -> Result<(cpal::Device, StreamConfig)> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Capture("no input device available".to_string()))?;

        let supported_config = device
            .supported_input_configs()
            .map_err(|e| Error::Capture(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(self.sample_rate)
                    && c.max_sample_rate() >= SampleRate(self.sample_rate)
            })
            .ok_or_else(|| Error::Capture("no suitable audio config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(self.sample_rate))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = self.sample_rate,
            frame_len = self.frame_len,
            "audio capture initialized"
        );

        Ok((device, config))
    }
}

impl FrameSource for MicrophoneSource {
    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let (device, config) = self.stream_config()?;

        {
            let (lock, _) = &*self.queue;
            let mut queue = lock
                .lock()
                .map_err(|_| Error::Capture("capture queue poisoned".to_string()))?;
            queue.samples.clear();
            queue.failed = None;
        }

        let data_queue = Arc::clone(&self.queue);
        let error_queue = Arc::clone(&self.queue);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let (lock, ready) = &*data_queue;
                    if let Ok(mut queue) = lock.lock() {
                        #[allow(clippy::cast_possible_truncation)]
                        queue.samples.extend(
                            data.iter()
                                .map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16),
                        );
                        ready.notify_one();
                    }
                },
                move |err| {
                    tracing::error!(error = %err, "audio capture error");
                    let (lock, ready) = &*error_queue;
                    if let Ok(mut queue) = lock.lock() {
                        queue.failed = Some(err.to_string());
                        ready.notify_one();
                    }
                },
                None,
            )
            .map_err(|e| Error::Capture(e.to_string()))?;

        stream.play().map_err(|e| Error::Capture(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio capture started");
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<AudioFrame>> {
        if self.stream.is_none() {
            return Ok(None);
        }

        let frame_len = self.frame_len;
        let (lock, ready) = &*self.queue;
        let guard = lock
            .lock()
            .map_err(|_| Error::Capture("capture queue poisoned".to_string()))?;

        let (mut queue, timeout) = ready
            .wait_timeout_while(guard, READ_TIMEOUT, |q| {
                q.samples.len() < frame_len && q.failed.is_none()
            })
            .map_err(|_| Error::Capture("capture queue poisoned".to_string()))?;

        if let Some(reason) = queue.failed.take() {
            return Err(Error::Capture(reason));
        }
        if timeout.timed_out() {
            return Err(Error::Capture("no audio received from input device".to_string()));
        }

        let samples: Vec<i16> = queue.samples.drain(..frame_len).collect();
        Ok(Some(AudioFrame::new(samples)))
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }

    fn is_active(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Encode 16-bit mono samples as WAV into `writer`
///
/// # Errors
///
/// Returns error if encoding or writing fails
pub fn encode_wav<W: Write + Seek>(writer: W, samples: &[i16], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::new(writer, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;

    Ok(())
}

/// Convert f32 samples to 16-bit WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;

        for &sample in samples {
            // Convert f32 [-1.0, 1.0] to i16
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer.write_sample(sample_i16)?;
        }

        writer.finalize()?;
    }

    Ok(cursor.into_inner())
}
