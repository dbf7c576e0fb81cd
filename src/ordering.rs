//! Ordering buffer for decoded audio
//!
//! Holds decoded buffers keyed by sequence number and re-sorts late
//! arrivals before they reach the scheduler. Fragments arrive nearly in
//! order, so insertion is a linear scan from the tail; observed disorder is
//! shallow and a general priority queue would be over-engineering.
//!
//! A committed-sequence watermark enforces the scheduling invariant: once a
//! sequence number has been handed to the scheduler, no smaller sequence is
//! ever accepted again.

use crate::types::DecodedBuffer;
use std::collections::VecDeque;
use tracing::trace;

/// Outcome of an insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,

    /// Sequence at or below the committed watermark; a larger sequence has
    /// already been scheduled.
    Late,

    /// Same sequence already buffered.
    Duplicate,
}

/// Min-ordered collection of decoded buffers keyed by sequence.
#[derive(Debug, Default)]
pub struct OrderingBuffer {
    entries: VecDeque<DecodedBuffer>,

    /// Highest sequence handed to the scheduler so far.
    committed: Option<u64>,
}

impl OrderingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a decoded buffer in sequence position.
    pub fn insert(&mut self, buffer: DecodedBuffer) -> InsertOutcome {
        if let Some(committed) = self.committed {
            if buffer.sequence <= committed {
                return InsertOutcome::Late;
            }
        }

        // Scan from the tail: the common case appends in O(1).
        let mut idx = self.entries.len();
        while idx > 0 {
            let prev = self.entries[idx - 1].sequence;
            if prev == buffer.sequence {
                return InsertOutcome::Duplicate;
            }
            if prev < buffer.sequence {
                break;
            }
            idx -= 1;
        }

        trace!(sequence = buffer.sequence, position = idx, "buffer ordered");
        self.entries.insert(idx, buffer);
        InsertOutcome::Inserted
    }

    /// Hand the oldest buffer to the scheduler, advancing the watermark.
    pub fn pop_ready(&mut self) -> Option<DecodedBuffer> {
        let buffer = self.entries.pop_front()?;
        self.committed = Some(buffer.sequence);
        Some(buffer)
    }

    /// Discard all buffered entries (stale-utterance purge). The committed
    /// watermark survives: sequences are per-connection, not per-utterance.
    pub fn purge(&mut self) -> usize {
        let purged = self.entries.len();
        self.entries.clear();
        purged
    }

    /// Full reset for a fresh session, watermark included.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.committed = None;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn committed(&self) -> Option<u64> {
        self.committed
    }
}
