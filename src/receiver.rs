//! Chunk receiver
//!
//! First stage of the pipeline. The transport delivers an announcement
//! control message (utterance id + encoding) followed by the binary
//! payloads that belong to it; the receiver pairs each payload with the
//! most recent announcement by arrival order and assigns a per-connection
//! sequence number. Sequence numbers never reset between utterances, only
//! on a full session flush.

use crate::types::{AudioFragment, FragmentEncoding, UtteranceId};
use tracing::debug;

/// Why a payload could not be tagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagRejection {
    /// Zero-length payload (keepalive or transport artifact).
    Empty,
    /// Payload arrived before any announcement.
    Unannounced,
}

#[derive(Debug, Default)]
pub struct ChunkReceiver {
    announced: Option<(UtteranceId, FragmentEncoding)>,
    next_sequence: u64,
}

impl ChunkReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the utterance/encoding the following payloads belong to.
    pub fn announce(&mut self, utterance: UtteranceId, encoding: FragmentEncoding) {
        debug!(utterance = %utterance, ?encoding, "utterance announced");
        self.announced = Some((utterance, encoding));
    }

    /// Tag a raw payload with sequence and utterance identity.
    pub fn tag(&mut self, payload: Vec<u8>) -> Result<AudioFragment, TagRejection> {
        if payload.is_empty() {
            return Err(TagRejection::Empty);
        }
        let (utterance, encoding) = self.announced.as_ref().ok_or(TagRejection::Unannounced)?;

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Ok(AudioFragment {
            sequence,
            utterance: utterance.clone(),
            encoding: *encoding,
            payload,
        })
    }

    /// Currently announced utterance, if any.
    pub fn announced(&self) -> Option<&UtteranceId> {
        self.announced.as_ref().map(|(id, _)| id)
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Fresh-session reset: forgets the announcement and restarts the
    /// sequence counter.
    pub fn reset(&mut self) {
        self.announced = None;
        self.next_sequence = 0;
    }
}
