//! Audio output to speakers via cpal

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};

use super::playback::{Clip, OutputDevice, OutputStream};
use crate::{Error, Result};

/// Grace period after the last sample so the device buffer drains
const DRAIN_TAIL: Duration = Duration::from_millis(100);

/// The default output device of the default host
pub struct CpalOutput;

impl OutputDevice for CpalOutput {
    fn open(&self, clip: Clip) -> Result<Box<dyn OutputStream>> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Playback("no output device available".to_string()))?;

        let config = select_config(&device, &clip)?;
        let channels = config.channels;
        let rate = config.sample_rate.0;

        let samples = if clip.sample_rate == rate && clip.channels == channels {
            clip.samples
        } else {
            adapt(&clip, rate, channels)?
        };

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = rate,
            channels,
            samples = samples.len(),
            "opening output stream"
        );

        let finished = Arc::new(AtomicBool::new(samples.is_empty()));
        let callback_finished = Arc::clone(&finished);
        let mut position = 0usize;

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for out in data.iter_mut() {
                        *out = samples.get(position).copied().unwrap_or(0.0);
                        position += 1;
                    }
                    if position >= samples.len() {
                        callback_finished.store(true, Ordering::SeqCst);
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Playback(e.to_string()))?;

        stream.play().map_err(|e| Error::Playback(e.to_string()))?;

        Ok(Box::new(CpalStream {
            _stream: stream,
            finished,
            drained_at: Cell::new(None),
        }))
    }
}

/// A playing cpal stream; dropping it closes the device
struct CpalStream {
    _stream: Stream,
    finished: Arc<AtomicBool>,
    drained_at: Cell<Option<Instant>>,
}

impl OutputStream for CpalStream {
    fn is_finished(&self) -> bool {
        if !self.finished.load(Ordering::SeqCst) {
            return false;
        }
        let since = self.drained_at.get().unwrap_or_else(|| {
            let now = Instant::now();
            self.drained_at.set(Some(now));
            now
        });
        since.elapsed() >= DRAIN_TAIL
    }
}

/// Pick an output config for the clip
///
/// Prefers the clip's own format; raw clips must get it exactly.
fn select_config(device: &cpal::Device, clip: &Clip) -> Result<StreamConfig> {
    let native = device
        .supported_output_configs()
        .map_err(|e| Error::Playback(e.to_string()))?
        .find(|c| {
            c.channels() == clip.channels
                && c.min_sample_rate() <= SampleRate(clip.sample_rate)
                && c.max_sample_rate() >= SampleRate(clip.sample_rate)
        });

    if let Some(range) = native {
        return Ok(range.with_sample_rate(SampleRate(clip.sample_rate)).config());
    }

    if clip.exact_format {
        return Err(Error::Playback(format!(
            "output device cannot play raw audio at {} Hz with {} channel(s)",
            clip.sample_rate, clip.channels
        )));
    }

    device
        .default_output_config()
        .map(|c| c.config())
        .map_err(|e| Error::Playback(e.to_string()))
}

/// Convert a clip to the device's rate and channel count
fn adapt(clip: &Clip, rate: u32, channels: u16) -> Result<Vec<f32>> {
    let mono = downmix(&clip.samples, clip.channels);
    let mono = if clip.sample_rate == rate {
        mono
    } else {
        resample_audio(&mono, clip.sample_rate, rate)?
    };

    let channels = usize::from(channels.max(1));
    Ok(mono
        .iter()
        .flat_map(|&s| std::iter::repeat_n(s, channels))
        .collect())
}

/// Average interleaved channels down to mono
#[allow(clippy::cast_precision_loss)]
fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = usize::from(channels.max(1));
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Resample audio using rubato
#[allow(clippy::cast_possible_truncation)]
fn resample_audio(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    let chunk_size = 1024;
    let sub_chunks = 2;

    let mut resampler =
        FftFixedIn::<f64>::new(from_rate as usize, to_rate as usize, chunk_size, sub_chunks, 1)
            .map_err(|e| Error::Playback(format!("resampler init failed: {e}")))?;

    let input: Vec<f64> = samples.iter().map(|&s| f64::from(s)).collect();
    let mut output = Vec::new();

    for chunk in input.chunks(chunk_size) {
        // Pad the tail so the last partial chunk is not lost
        let mut block = chunk.to_vec();
        block.resize(chunk_size, 0.0);

        let result = resampler
            .process(&[block], None)
            .map_err(|e| Error::Playback(format!("resample failed: {e}")))?;
        output.extend_from_slice(&result[0]);
    }

    let expected = samples.len() * to_rate as usize / from_rate.max(1) as usize;
    output.truncate(expected);

    Ok(output.iter().map(|&s| s as f32).collect())
}
