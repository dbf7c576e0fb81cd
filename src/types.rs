//! Core data types for the audio pipeline
//!
//! Defines the fragment and buffer structures passed between the receiver,
//! decoder, ordering buffer and scheduler.
//!
//! **Format:**
//! - Decoded samples are mono f32 in [-1.0, 1.0]
//! - All buffers are resampled to the session's fixed output rate before
//!   they reach the scheduler

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of one continuous assistant utterance.
///
/// Assigned by the transport peer; the pipeline only ever compares these
/// for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UtteranceId(String);

impl UtteranceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UtteranceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UtteranceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UtteranceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Wire encoding of a fragment payload, as declared by the utterance
/// announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", rename_all = "snake_case")]
pub enum FragmentEncoding {
    /// Raw signed 16-bit little-endian PCM at the given source rate.
    RawPcm16 { sample_rate: u32 },

    /// Streaming MP3: frames may span fragment boundaries, so decode is
    /// stateful across fragments of one utterance.
    Mp3Stream,
}

/// One inbound audio fragment, immutable once received.
///
/// Produced by the chunk receiver; consumed exactly once by the decoder or
/// discarded by the interruption gate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFragment {
    /// Monotonically increasing per connection.
    pub sequence: u64,

    /// Utterance this fragment belongs to.
    pub utterance: UtteranceId,

    /// Declared wire encoding.
    pub encoding: FragmentEncoding,

    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

/// Decoded audio ready for ordering and scheduling.
///
/// Owned exclusively by the ordering buffer until handed to the scheduler,
/// at which point ownership transfers to a scheduled playback unit.
#[derive(Debug, Clone)]
pub struct DecodedBuffer {
    /// Sequence of the fragment that produced (or completed) these samples.
    pub sequence: u64,

    /// Owning utterance.
    pub utterance: UtteranceId,

    /// Mono f32 samples in [-1.0, 1.0], at `sample_rate`.
    pub samples: Vec<f32>,

    /// Sample rate of `samples` (the session output rate after decode).
    pub sample_rate: u32,
}

impl DecodedBuffer {
    pub fn new(
        sequence: u64,
        utterance: UtteranceId,
        samples: Vec<f32>,
        sample_rate: u32,
    ) -> Self {
        Self {
            sequence,
            utterance,
            samples,
            sample_rate,
        }
    }

    /// Number of sample frames (mono, so frames == samples).
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in milliseconds at this buffer's rate.
    pub fn duration_ms(&self) -> u64 {
        (self.samples.len() as u64 * 1000) / self.sample_rate as u64
    }
}
