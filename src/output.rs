//! Audio output: device clock, playout queue, and cpal device binding
//!
//! The scheduler never talks to the audio thread directly. It pushes mono
//! samples into a lock-free SPSC ring ([`PlayoutQueue`]); the device
//! callback pops them ([`PlayoutConsumer`]), duplicates mono to the device
//! channel count, applies the gain/mute signal, advances the frame clock,
//! and records the rendered loudness. The callback reads atomics and the
//! ring only; control-plane structures never cross this boundary.
//!
//! [`PlayoutQueue::detached`] builds the queue pair without a device so the
//! scheduler is fully testable without audio hardware; [`AudioOutput`]
//! wires the consumer to a real cpal stream.

use crate::error::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Monotonic frame counter advanced by the output callback.
///
/// The playback analogue of the hardware clock: one unit is one mono frame
/// at the session output rate. The counter advances whether the callback
/// rendered audio or silence.
#[derive(Debug, Clone)]
pub struct DeviceClock {
    frames: Arc<AtomicU64>,
    sample_rate: u32,
}

impl DeviceClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            frames: Arc::new(AtomicU64::new(0)),
            sample_rate,
        }
    }

    /// Current device time in frames.
    pub fn position(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub(crate) fn advance(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::AcqRel);
    }
}

/// Signals shared between the producer and consumer sides of the queue.
#[derive(Debug)]
struct PlayoutShared {
    muted: AtomicBool,
    /// Output gain as f32 bits; one-way control → audio thread.
    gain: AtomicU32,
    /// RMS of the most recently rendered callback buffer, as f32 bits.
    level: AtomicU32,
}

impl PlayoutShared {
    fn new() -> Self {
        Self {
            muted: AtomicBool::new(false),
            gain: AtomicU32::new(1.0f32.to_bits()),
            level: AtomicU32::new(0),
        }
    }
}

/// Producer side of the playout ring; owned by the scheduler.
pub struct PlayoutQueue {
    producer: HeapProd<f32>,
    clock: DeviceClock,
    shared: Arc<PlayoutShared>,
}

impl PlayoutQueue {
    /// Build a queue/consumer pair without an audio device.
    ///
    /// Used by [`AudioOutput`] internally and by tests, which drive the
    /// consumer (and therefore the clock) by hand.
    pub fn detached(sample_rate: u32, capacity_samples: usize) -> (PlayoutQueue, PlayoutConsumer) {
        let rb = HeapRb::<f32>::new(capacity_samples.max(1));
        let (producer, consumer) = rb.split();
        let clock = DeviceClock::new(sample_rate);
        let shared = Arc::new(PlayoutShared::new());

        let queue = PlayoutQueue {
            producer,
            clock: clock.clone(),
            shared: Arc::clone(&shared),
        };
        let consumer = PlayoutConsumer {
            consumer,
            clock,
            shared,
            scratch: Vec::new(),
        };
        (queue, consumer)
    }

    pub fn clock(&self) -> DeviceClock {
        self.clock.clone()
    }

    /// Device frame at which the next pushed sample will play.
    pub fn write_frame(&self) -> u64 {
        self.clock.position() + self.producer.occupied_len() as u64
    }

    /// Push samples; returns how many were accepted (ring may be full).
    pub fn push(&mut self, samples: &[f32]) -> usize {
        self.producer.push_slice(samples)
    }

    /// Push up to `count` frames of silence; returns how many fit.
    pub fn push_silence(&mut self, count: usize) -> usize {
        const ZERO: [f32; 256] = [0.0; 256];
        let mut remaining = count;
        while remaining > 0 {
            let chunk = remaining.min(ZERO.len());
            let pushed = self.producer.push_slice(&ZERO[..chunk]);
            remaining -= pushed;
            if pushed < chunk {
                break;
            }
        }
        count - remaining
    }

    /// Samples queued and not yet rendered.
    pub fn queued(&self) -> usize {
        self.producer.occupied_len()
    }

    pub fn vacant(&self) -> usize {
        self.producer.vacant_len()
    }

    /// Best-effort hard stop: rendered output becomes silence while the
    /// already queued samples drain at real-time rate.
    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Acquire)
    }

    pub fn set_gain(&self, gain: f32) {
        self.shared
            .gain
            .store(gain.clamp(0.0, 1.0).to_bits(), Ordering::Release);
    }

    pub fn gain(&self) -> f32 {
        f32::from_bits(self.shared.gain.load(Ordering::Acquire))
    }

    /// RMS of the last rendered callback buffer (the signal that actually
    /// reached the device).
    pub fn rendered_level(&self) -> f32 {
        f32::from_bits(self.shared.level.load(Ordering::Acquire))
    }
}

/// Consumer side of the playout ring; lives inside the device callback.
pub struct PlayoutConsumer {
    consumer: HeapCons<f32>,
    clock: DeviceClock,
    shared: Arc<PlayoutShared>,
    /// Reused mono scratch buffer; grows to the callback size once.
    scratch: Vec<f32>,
}

impl PlayoutConsumer {
    /// Render `frames` mono frames into an interleaved output slice with
    /// the given channel count. Underrun yields silence, never an error.
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = out.len() / channels;

        if self.scratch.len() < frames {
            self.scratch.resize(frames, 0.0);
        }
        let mono = &mut self.scratch[..frames];

        let popped = self.consumer.pop_slice(mono);
        mono[popped..].fill(0.0);

        let muted = self.shared.muted.load(Ordering::Acquire);
        let gain = f32::from_bits(self.shared.gain.load(Ordering::Acquire));

        let mut sum_sq = 0.0f32;
        for (frame_idx, sample) in mono.iter().enumerate() {
            let value = if muted {
                0.0
            } else {
                (sample * gain).clamp(-1.0, 1.0)
            };
            sum_sq += value * value;

            let base = frame_idx * channels;
            for ch in 0..channels {
                out[base + ch] = value;
            }
        }

        let rms = if frames > 0 {
            (sum_sq / frames as f32).sqrt()
        } else {
            0.0
        };
        self.shared.level.store(rms.to_bits(), Ordering::Release);
        self.clock.advance(frames as u64);
    }

    /// Render as i16 for devices without f32 output.
    pub fn render_i16(&mut self, out: &mut [i16], channels: usize) {
        let channels = channels.max(1);
        let frames = out.len() / channels;
        if self.scratch.len() < frames {
            self.scratch.resize(frames, 0.0);
        }
        let mono = &mut self.scratch[..frames];
        let popped = self.consumer.pop_slice(mono);
        mono[popped..].fill(0.0);

        let muted = self.shared.muted.load(Ordering::Acquire);
        let gain = f32::from_bits(self.shared.gain.load(Ordering::Acquire));

        let mut sum_sq = 0.0f32;
        for (frame_idx, sample) in mono.iter().enumerate() {
            let value = if muted {
                0.0
            } else {
                (sample * gain).clamp(-1.0, 1.0)
            };
            sum_sq += value * value;

            let quantized = (value * i16::MAX as f32) as i16;
            let base = frame_idx * channels;
            for ch in 0..channels {
                out[base + ch] = quantized;
            }
        }

        let rms = if frames > 0 {
            (sum_sq / frames as f32).sqrt()
        } else {
            0.0
        };
        self.shared.level.store(rms.to_bits(), Ordering::Release);
        self.clock.advance(frames as u64);
    }
}

/// cpal-backed audio output consuming a [`PlayoutConsumer`].
///
/// Keep this alive for as long as the session plays; dropping it stops the
/// stream.
pub struct AudioOutput {
    stream: Option<Stream>,
    device_name: String,
    sample_rate: u32,
    channels: u16,
}

impl AudioOutput {
    /// Open the default output device and start the stream.
    ///
    /// Returns the output handle and the producer queue for the scheduler.
    /// Prefers a stereo f32 configuration at `sample_rate`; falls back to
    /// the device default configuration (with a warning when the rate
    /// differs, since scheduling assumes the session output rate).
    pub fn open(sample_rate: u32, ring_capacity_samples: usize) -> Result<(AudioOutput, PlayoutQueue)> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Output("No default output device found".to_string()))?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        info!("Using default audio device: {}", device_name);

        let (config, sample_format) = Self::get_best_config(&device, sample_rate)?;
        if config.sample_rate.0 != sample_rate {
            warn!(
                device_rate = config.sample_rate.0,
                session_rate = sample_rate,
                "device does not support the session output rate; playback speed will be off"
            );
        }
        debug!(
            "Audio config: sample_rate={}, channels={}, format={:?}",
            config.sample_rate.0, config.channels, sample_format
        );

        let (queue, consumer) = PlayoutQueue::detached(sample_rate, ring_capacity_samples);
        let channels = config.channels;

        let stream = match sample_format {
            SampleFormat::F32 => Self::build_stream_f32(&device, &config, consumer)?,
            SampleFormat::I16 => Self::build_stream_i16(&device, &config, consumer)?,
            other => {
                return Err(Error::Output(format!(
                    "Unsupported sample format: {:?}",
                    other
                )));
            }
        };

        stream
            .play()
            .map_err(|e| Error::Output(format!("Failed to start stream: {}", e)))?;
        info!("Audio stream started");

        Ok((
            AudioOutput {
                stream: Some(stream),
                device_name,
                sample_rate: config.sample_rate.0,
                channels,
            },
            queue,
        ))
    }

    fn get_best_config(
        device: &cpal::Device,
        sample_rate: u32,
    ) -> Result<(StreamConfig, SampleFormat)> {
        let supported = device
            .supported_output_configs()
            .map_err(|e| Error::Output(format!("Failed to get device configs: {}", e)))?;

        let preferred = supported.into_iter().find(|config| {
            config.channels() >= 1
                && config.min_sample_rate().0 <= sample_rate
                && config.max_sample_rate().0 >= sample_rate
                && config.sample_format() == SampleFormat::F32
        });

        if let Some(supported_config) = preferred {
            let sample_format = supported_config.sample_format();
            let config = supported_config
                .with_sample_rate(cpal::SampleRate(sample_rate))
                .config();
            return Ok((config, sample_format));
        }

        let supported_config = device
            .default_output_config()
            .map_err(|e| Error::Output(format!("Failed to get default config: {}", e)))?;
        let sample_format = supported_config.sample_format();
        Ok((supported_config.config(), sample_format))
    }

    fn build_stream_f32(
        device: &cpal::Device,
        config: &StreamConfig,
        mut consumer: PlayoutConsumer,
    ) -> Result<Stream> {
        let channels = config.channels as usize;
        device
            .build_output_stream(
                config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    consumer.render(data, channels);
                },
                move |err| {
                    warn!("Audio stream error: {}", err);
                },
                None,
            )
            .map_err(|e| Error::Output(format!("Failed to build stream: {}", e)))
    }

    fn build_stream_i16(
        device: &cpal::Device,
        config: &StreamConfig,
        mut consumer: PlayoutConsumer,
    ) -> Result<Stream> {
        let channels = config.channels as usize;
        device
            .build_output_stream(
                config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    consumer.render_i16(data, channels);
                },
                move |err| {
                    warn!("Audio stream error: {}", err);
                },
                None,
            )
            .map_err(|e| Error::Output(format!("Failed to build stream: {}", e)))
    }

    pub fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            stream
                .pause()
                .map_err(|e| Error::Output(format!("Failed to pause stream: {}", e)))?;
        }
        Ok(())
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_frame_tracks_clock_and_occupancy() {
        let (mut queue, mut consumer) = PlayoutQueue::detached(1000, 64);
        assert_eq!(queue.write_frame(), 0);

        assert_eq!(queue.push(&[0.5; 10]), 10);
        assert_eq!(queue.write_frame(), 10);

        let mut out = vec![0.0f32; 4];
        consumer.render(&mut out, 1);
        assert_eq!(queue.clock().position(), 4);
        assert_eq!(queue.queued(), 6);
        assert_eq!(queue.write_frame(), 10);
    }

    #[test]
    fn test_render_duplicates_mono_to_channels() {
        let (mut queue, mut consumer) = PlayoutQueue::detached(1000, 64);
        queue.push(&[0.25, -0.25]);

        let mut out = vec![0.0f32; 4];
        consumer.render(&mut out, 2);
        assert_eq!(out, vec![0.25, 0.25, -0.25, -0.25]);
    }

    #[test]
    fn test_underrun_renders_silence_and_advances_clock() {
        let (queue, mut consumer) = PlayoutQueue::detached(1000, 64);

        let mut out = vec![1.0f32; 8];
        consumer.render(&mut out, 1);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(queue.clock().position(), 8);
        assert_eq!(queue.rendered_level(), 0.0);
    }

    #[test]
    fn test_mute_silences_but_consumes() {
        let (mut queue, mut consumer) = PlayoutQueue::detached(1000, 64);
        queue.push(&[0.8; 8]);
        queue.set_muted(true);

        let mut out = vec![0.5f32; 8];
        consumer.render(&mut out, 1);
        assert!(out.iter().all(|&s| s == 0.0));
        // Samples were still consumed (drain under mute).
        assert_eq!(queue.queued(), 0);
        assert_eq!(queue.rendered_level(), 0.0);
    }

    #[test]
    fn test_rendered_level_reflects_signal() {
        let (mut queue, mut consumer) = PlayoutQueue::detached(1000, 64);
        queue.push(&[0.5; 4]);

        let mut out = vec![0.0f32; 4];
        consumer.render(&mut out, 1);
        assert!((queue.rendered_level() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_gain_applied_in_render() {
        let (mut queue, mut consumer) = PlayoutQueue::detached(1000, 64);
        queue.push(&[0.5; 2]);
        queue.set_gain(0.5);

        let mut out = vec![0.0f32; 2];
        consumer.render(&mut out, 1);
        assert!((out[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_push_silence_counts() {
        let (mut queue, _consumer) = PlayoutQueue::detached(1000, 8);
        assert_eq!(queue.push_silence(6), 6);
        // Ring capacity caps the second push.
        assert_eq!(queue.push_silence(6), 2);
        assert_eq!(queue.queued(), 8);
    }

    #[test]
    fn test_render_i16_quantizes() {
        let (mut queue, mut consumer) = PlayoutQueue::detached(1000, 8);
        queue.push(&[1.0, -1.0]);

        let mut out = vec![0i16; 2];
        consumer.render_i16(&mut out, 1);
        assert_eq!(out[0], i16::MAX);
        assert_eq!(out[1], -i16::MAX);
    }
}
