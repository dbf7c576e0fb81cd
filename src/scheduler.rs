//! Lookahead playback scheduler
//!
//! Turns ordered decoded buffers into playback units planned against the
//! device frame clock. A recurring tick (driven by the session) retires
//! finished units, commits ready buffers whose chained start falls inside
//! the lookahead window, and feeds the playout queue a shallow slice of the
//! committed audio. Keeping the device ring shallow is what makes committed
//! units cancellable on barge-in: audio the ring has not seen yet can be
//! dropped without touching the audio thread.
//!
//! Ticks are idempotent; a tick with nothing to do changes no state.

use crate::config::PlaybackConfig;
use crate::ordering::{InsertOutcome, OrderingBuffer};
use crate::output::PlayoutQueue;
use crate::types::{DecodedBuffer, UtteranceId};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// One decoded buffer planned onto the device timeline.
#[derive(Debug)]
pub struct PlaybackUnit {
    pub sequence: u64,
    pub utterance: UtteranceId,
    pub samples: Vec<f32>,
    /// Device frame at which the first sample plays.
    pub start_frame: u64,
    /// Device frame one past the last sample.
    pub end_frame: u64,
    /// Samples already pushed to the playout queue.
    pub fed: usize,
}

impl PlaybackUnit {
    fn remaining(&self) -> usize {
        self.samples.len() - self.fed
    }
}

/// What a tick observed; the session turns this into events.
#[derive(Debug, Default)]
pub struct TickReport {
    /// An utterance began reaching the device this tick.
    pub started: Option<UtteranceId>,
    /// The last in-flight unit completed with nothing left buffered.
    pub became_idle: bool,
    /// Raw RMS of the most recently rendered device buffer.
    pub raw_level: f32,
}

pub struct Scheduler {
    queue: PlayoutQueue,
    buffer: OrderingBuffer,
    units: VecDeque<PlaybackUnit>,
    lookahead_frames: u64,
    lead_in_frames: u64,
    feed_depth: usize,
    /// Utterance currently audible, as last reported.
    playing: Option<UtteranceId>,
    active: bool,
}

impl Scheduler {
    pub fn new(queue: PlayoutQueue, config: &PlaybackConfig) -> Self {
        Self {
            queue,
            buffer: OrderingBuffer::new(),
            units: VecDeque::new(),
            lookahead_frames: config.frames(config.lookahead_ms),
            lead_in_frames: config.frames(config.lead_in_ms),
            feed_depth: config.feed_depth_samples(),
            playing: None,
            active: false,
        }
    }

    /// Accept a decoded buffer into the ordering stage.
    pub fn insert(&mut self, buffer: DecodedBuffer) -> InsertOutcome {
        self.buffer.insert(buffer)
    }

    /// One scheduling pass. Call from the tick task or directly in tests.
    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        // A hard stop leaves the queue muted while the ring drains; lift the
        // mute once nothing muted remains so the next utterance is audible.
        if self.queue.is_muted() && self.queue.queued() == 0 {
            self.queue.set_muted(false);
        }

        let clock = self.queue.clock().position();

        self.retire(clock);
        self.commit(clock);
        self.feed();

        // Audible-unit edge: the front unit whose window spans the clock.
        let audible = self
            .units
            .front()
            .filter(|u| u.start_frame <= clock)
            .map(|u| u.utterance.clone());
        if let Some(utterance) = audible {
            if self.playing.as_ref() != Some(&utterance) {
                debug!(utterance = %utterance, frame = clock, "utterance reached device");
                self.playing = Some(utterance.clone());
                report.started = Some(utterance);
            }
        }

        if self.active && self.units.is_empty() && self.buffer.is_empty() {
            debug!(frame = clock, "pipeline idle");
            self.active = false;
            self.playing = None;
            report.became_idle = true;
        }

        report.raw_level = self.queue.rendered_level();
        report
    }

    fn retire(&mut self, clock: u64) {
        while self.units.front().map_or(false, |u| u.end_frame <= clock) {
            if let Some(unit) = self.units.pop_front() {
                trace!(
                    sequence = unit.sequence,
                    end_frame = unit.end_frame,
                    "unit retired"
                );
            }
        }
    }

    fn commit(&mut self, clock: u64) {
        let horizon = clock + self.lookahead_frames;
        while !self.buffer.is_empty() {
            let chain_end = self.units.back().map(|u| u.end_frame);
            let start = match chain_end {
                Some(end) if end > clock => end,
                _ => clock + self.lead_in_frames,
            };
            if start >= horizon {
                break;
            }
            let Some(buffer) = self.buffer.pop_ready() else {
                break;
            };
            let end = start + buffer.samples.len() as u64;
            trace!(
                sequence = buffer.sequence,
                start_frame = start,
                end_frame = end,
                "unit committed"
            );
            self.units.push_back(PlaybackUnit {
                sequence: buffer.sequence,
                utterance: buffer.utterance,
                samples: buffer.samples,
                start_frame: start,
                end_frame: end,
                fed: 0,
            });
            self.active = true;
        }
    }

    fn feed(&mut self) {
        // A hard stop leaves the old fed tail draining under mute. Feeding
        // the next utterance now would keep the ring occupied and the mute
        // in place forever; hold new audio back until the tail is gone.
        if self.queue.is_muted() {
            return;
        }
        let mut budget = self.feed_depth.saturating_sub(self.queue.queued());
        for unit in self.units.iter_mut() {
            if budget == 0 {
                break;
            }
            if unit.remaining() == 0 {
                continue;
            }

            // Pad silence up to the unit's next unfed frame. Back-to-back
            // chains have no gap; the pad realizes the lead-in and any gap
            // left by a truncated predecessor.
            let next_frame = unit.start_frame + unit.fed as u64;
            let write_frame = self.queue.write_frame();
            if next_frame > write_frame {
                let gap = (next_frame - write_frame) as usize;
                let pad = gap.min(budget);
                let pushed = self.queue.push_silence(pad);
                budget -= pushed;
                if pushed < gap {
                    break;
                }
            }

            let take = unit.remaining().min(budget);
            let pushed = self
                .queue
                .push(&unit.samples[unit.fed..unit.fed + take]);
            unit.fed += pushed;
            budget -= pushed;
            if pushed < take {
                break;
            }
        }
    }

    /// Barge-in cancellation for one utterance.
    ///
    /// Buffered (pre-commit) audio is purged wholesale; committed units of
    /// the utterance are dropped if unfed, or truncated at the samples
    /// already handed to the ring. With `hard_stop` the queue is muted so
    /// the fed tail drains silently. Returns how many units were cancelled
    /// or truncated.
    pub fn cancel(&mut self, utterance: &UtteranceId, hard_stop: bool) -> usize {
        let purged = self.buffer.purge();
        let clock = self.queue.clock().position();

        let mut affected = 0;
        self.units.retain_mut(|unit| {
            if &unit.utterance != utterance {
                return true;
            }
            affected += 1;
            if unit.fed == 0 {
                return false;
            }
            // Keep only what the ring already has.
            unit.samples.truncate(unit.fed);
            unit.end_frame = unit.start_frame + unit.fed as u64;
            true
        });

        // Units after a truncation keep their planned frames; re-chain any
        // unfed ones so the next utterance does not inherit stale gaps.
        let mut prev_end: Option<u64> = None;
        for unit in self.units.iter_mut() {
            if unit.fed == 0 {
                let start = match prev_end {
                    Some(end) if end > clock => end,
                    _ => clock + self.lead_in_frames,
                };
                unit.end_frame = start + unit.samples.len() as u64;
                unit.start_frame = start;
            }
            prev_end = Some(unit.end_frame);
        }

        if hard_stop && self.queue.queued() > 0 {
            self.queue.set_muted(true);
        }

        debug!(
            utterance = %utterance,
            purged_buffers = purged,
            affected_units = affected,
            hard_stop,
            "utterance cancelled"
        );
        affected + purged
    }

    /// Purge buffered audio on an utterance transition. Committed units
    /// drain naturally; anything still waiting to be committed is stale.
    pub fn purge_stale(&mut self) -> usize {
        self.buffer.purge()
    }

    /// Full teardown for a fresh session: drop everything, reset the
    /// sequence watermark, and mute the ring tail.
    pub fn flush(&mut self) {
        self.units.clear();
        self.buffer.reset();
        self.playing = None;
        self.active = false;
        if self.queue.queued() > 0 {
            self.queue.set_muted(true);
        }
    }

    /// Whether any unit is in flight or buffered.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn in_flight(&self) -> usize {
        self.units.len()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn committed_sequence(&self) -> Option<u64> {
        self.buffer.committed()
    }

    #[cfg(test)]
    pub(crate) fn units(&self) -> &VecDeque<PlaybackUnit> {
        &self.units
    }
}
