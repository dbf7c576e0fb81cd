//! # Companion Audio (companion-audio)
//!
//! Real-time speech playback pipeline for a virtual-companion chat client.
//!
//! **Purpose:** Receive out-of-order synthesized-speech fragments, decode
//! raw PCM16 and streaming MP3 payloads, schedule gapless playback ahead of
//! the device clock, and support sub-second barge-in interruption.
//!
//! **Architecture:** Single-stream audio pipeline using symphonia + rubato
//! + cpal; an `AudioSession` façade owns the scheduler tick task and the
//! transport-facing contract.

pub mod amplitude;
pub mod config;
pub mod decode;
pub mod error;
pub mod events;
pub mod interrupt;
pub mod ordering;
pub mod output;
pub mod receiver;
pub mod scheduler;
pub mod session;
pub mod types;

pub use config::PlaybackConfig;
pub use error::{Error, Result};
pub use events::SessionEvent;
pub use session::{AudioSession, DiagnosticsSnapshot, SessionStatus};
pub use types::{AudioFragment, DecodedBuffer, FragmentEncoding, UtteranceId};
