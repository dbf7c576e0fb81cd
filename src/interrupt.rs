//! Interruption (barge-in) state machine
//!
//! Tracks which utterance is allowed to play and which one was interrupted,
//! and decides when the streaming decoder state may be reset.
//!
//! The reset timing is the delicate part: when the user barges in, the
//! streaming decoder is *not* reset immediately, because header context may
//! still be needed to decode the tail of fragments already in flight.
//! The reset is deferred to the first accepted fragment header of the next
//! utterance, which is the only moment that is neither too early (context
//! destroyed while old fragments still arrive) nor too late (new utterance
//! decoded with stale context).
//!
//! Transition rules:
//! - `notify_user_activity(id)`: interrupted = id, decoder_reset_pending = true
//! - `notify_fragment_header(id)`:
//!   - id == interrupted → Skip (and every later fragment of id)
//!   - id == current → continuation, no transition
//!   - otherwise → accept; perform the pending decoder reset now, then
//!     current = id, interrupted/pending cleared

use crate::types::UtteranceId;

/// Interruption bookkeeping, mutated only by the controller.
#[derive(Debug, Clone, Default)]
pub struct InterruptionState {
    /// Utterance currently allowed to play.
    pub current: Option<UtteranceId>,

    /// Utterance whose remaining fragments must be dropped.
    pub interrupted: Option<UtteranceId>,

    /// A decoder reset is owed at the next utterance boundary.
    pub decoder_reset_pending: bool,
}

/// Verdict for an inbound fragment payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Decode and schedule this fragment.
    Decode,

    /// Drop silently (stale or interrupted utterance).
    Drop,
}

/// Verdict for an utterance announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderAction {
    /// Accept the announcement.
    Accept {
        /// The deferred decoder reset must be performed before decoding
        /// this utterance's fragments.
        reset_decoder: bool,

        /// This announcement changed the current utterance (as opposed to
        /// re-announcing it).
        changed: bool,

        /// Previous current utterance, for transition events.
        previous: Option<UtteranceId>,
    },

    /// The utterance was interrupted; drop this and all its fragments.
    Skip,
}

/// The interruption controller: a small state machine gating the decode
/// path.
#[derive(Debug, Default)]
pub struct InterruptionController {
    state: InterruptionState,
}

impl InterruptionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// User began speaking over assistant output.
    ///
    /// Records the interruption and schedules the deferred decoder reset.
    /// Returns the interrupted utterance was actually the current one
    /// (callers may still cancel pending playback either way).
    pub fn notify_user_activity(&mut self, utterance: UtteranceId) -> bool {
        let was_current = self.state.current.as_ref() == Some(&utterance);
        self.state.interrupted = Some(utterance);
        self.state.decoder_reset_pending = true;
        was_current
    }

    /// First control-bearing fragment of an utterance arrived.
    pub fn notify_fragment_header(&mut self, utterance: UtteranceId) -> HeaderAction {
        if self.state.interrupted.as_ref() == Some(&utterance) {
            return HeaderAction::Skip;
        }

        if self.state.current.as_ref() == Some(&utterance) {
            // Continuation of the utterance already playing.
            return HeaderAction::Accept {
                reset_decoder: false,
                changed: false,
                previous: self.state.current.clone(),
            };
        }

        let reset_decoder = self.state.decoder_reset_pending;
        let previous = self.state.current.replace(utterance);
        self.state.decoder_reset_pending = false;
        self.state.interrupted = None;

        HeaderAction::Accept {
            reset_decoder,
            changed: true,
            previous,
        }
    }

    /// Should a fragment of this utterance be decoded at all?
    pub fn gate(&self, utterance: &UtteranceId) -> Gate {
        if self.state.interrupted.as_ref() == Some(utterance) {
            return Gate::Drop;
        }
        if self.state.current.as_ref() != Some(utterance) {
            // Superseded or never announced.
            return Gate::Drop;
        }
        Gate::Decode
    }

    /// Re-check used after an async decode completes: has this utterance
    /// been interrupted in the meantime?
    pub fn is_interrupted(&self, utterance: &UtteranceId) -> bool {
        self.state.interrupted.as_ref() == Some(utterance)
            || self.state.current.as_ref() != Some(utterance)
    }

    pub fn current(&self) -> Option<&UtteranceId> {
        self.state.current.as_ref()
    }

    pub fn state(&self) -> &InterruptionState {
        &self.state
    }

    /// Reset for a fresh session (flush).
    pub fn reset(&mut self) {
        self.state = InterruptionState::default();
    }
}
