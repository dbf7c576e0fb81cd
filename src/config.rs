//! Configuration for the playback pipeline
//!
//! Built-in defaults are defined in code; a TOML file (or string) may
//! override individual fields. The defaults mirror the timing constants the
//! pipeline was tuned with: a 25 ms scheduler tick, a 5 s lookahead window,
//! and a 100 ms lead-in to absorb arrival jitter at the start of a playback
//! session.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;

/// Playback pipeline configuration.
///
/// All fields have built-in defaults; a partial TOML document is enough to
/// override any subset.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackConfig {
    /// Fixed output sample rate (Hz). All decoded audio is resampled to
    /// this rate before scheduling.
    #[serde(default = "default_output_sample_rate")]
    pub output_sample_rate: u32,

    /// Scheduler tick interval in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// How far ahead of the device clock buffers may be committed (ms).
    #[serde(default = "default_lookahead_ms")]
    pub lookahead_ms: u64,

    /// Lead-in before the first unit of a fresh playback session (ms).
    #[serde(default = "default_lead_in_ms")]
    pub lead_in_ms: u64,

    /// Target depth of audio kept in the device ring (ms). Committed units
    /// beyond this depth stay cancellable.
    #[serde(default = "default_feed_depth_ms")]
    pub feed_depth_ms: u64,

    /// Capacity of the device ring buffer (ms).
    #[serde(default = "default_ring_capacity_ms")]
    pub ring_capacity_ms: u64,

    /// Mute in-flight audio on barge-in instead of letting the already
    /// started unit finish.
    #[serde(default = "default_hard_stop_on_barge_in")]
    pub hard_stop_on_barge_in: bool,

    /// Smoothing factor for the amplitude signal, in (0, 1]. Higher values
    /// track the raw level faster.
    #[serde(default = "default_amplitude_smoothing")]
    pub amplitude_smoothing: f32,

    /// Event bus channel capacity.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_output_sample_rate() -> u32 {
    48_000
}

fn default_tick_interval_ms() -> u64 {
    25
}

fn default_lookahead_ms() -> u64 {
    5_000
}

fn default_lead_in_ms() -> u64 {
    100
}

fn default_feed_depth_ms() -> u64 {
    200
}

fn default_ring_capacity_ms() -> u64 {
    1_000
}

fn default_hard_stop_on_barge_in() -> bool {
    true
}

fn default_amplitude_smoothing() -> f32 {
    0.3
}

fn default_event_capacity() -> usize {
    256
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            output_sample_rate: default_output_sample_rate(),
            tick_interval_ms: default_tick_interval_ms(),
            lookahead_ms: default_lookahead_ms(),
            lead_in_ms: default_lead_in_ms(),
            feed_depth_ms: default_feed_depth_ms(),
            ring_capacity_ms: default_ring_capacity_ms(),
            hard_stop_on_barge_in: default_hard_stop_on_barge_in(),
            amplitude_smoothing: default_amplitude_smoothing(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl PlaybackConfig {
    /// Parse configuration from a TOML string, applying built-in defaults
    /// for missing fields.
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        let config: PlaybackConfig = toml::from_str(toml_str)
            .map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Validate field relationships.
    pub fn validate(&self) -> Result<()> {
        if self.output_sample_rate == 0 {
            return Err(Error::Config("output_sample_rate must be non-zero".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::Config("tick_interval_ms must be non-zero".into()));
        }
        if self.lookahead_ms <= self.lead_in_ms {
            return Err(Error::Config(
                "lookahead_ms must be greater than lead_in_ms".into(),
            ));
        }
        if self.ring_capacity_ms < self.feed_depth_ms {
            return Err(Error::Config(
                "ring_capacity_ms must be at least feed_depth_ms".into(),
            ));
        }
        if !(self.amplitude_smoothing > 0.0 && self.amplitude_smoothing <= 1.0) {
            return Err(Error::Config(
                "amplitude_smoothing must be in (0, 1]".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("event_capacity must be non-zero".into()));
        }
        Ok(())
    }

    /// Convert a millisecond duration to device frames at the output rate.
    pub fn frames(&self, ms: u64) -> u64 {
        ms * self.output_sample_rate as u64 / 1000
    }

    /// Ring capacity in samples.
    pub fn ring_capacity_samples(&self) -> usize {
        self.frames(self.ring_capacity_ms) as usize
    }

    /// Feed depth in samples.
    pub fn feed_depth_samples(&self) -> usize {
        self.frames(self.feed_depth_ms) as usize
    }
}
