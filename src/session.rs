//! Playback session façade
//!
//! `AudioSession` wires the receiver, interruption controller, decoder,
//! scheduler and amplitude tap together and exposes the inbound transport
//! contract (announce / payload / user activity) plus the outbound signals
//! (events, amplitude, diagnostics).
//!
//! Error philosophy: nothing a misbehaving transport sends can tear the
//! session down. Malformed, stale, late and duplicate fragments degrade to
//! logged drops with a diagnostic counter; only construction-time device
//! errors surface as `Err`.

use crate::amplitude::AmplitudeTap;
use crate::config::PlaybackConfig;
use crate::decode::FragmentDecoder;
use crate::error::{Error, Result};
use crate::events::{EventBus, SessionEvent};
use crate::interrupt::{Gate, HeaderAction, InterruptionController};
use crate::ordering::InsertOutcome;
use crate::output::{AudioOutput, PlayoutConsumer, PlayoutQueue};
use crate::receiver::{ChunkReceiver, TagRejection};
use crate::scheduler::Scheduler;
use crate::types::{DecodedBuffer, FragmentEncoding, UtteranceId};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Drop and anomaly counters, updated lock-free from any path.
#[derive(Debug, Default)]
struct DiagnosticCounters {
    empty_payloads: AtomicU64,
    unannounced_payloads: AtomicU64,
    stale_fragments: AtomicU64,
    malformed_fragments: AtomicU64,
    discarded_after_interrupt: AtomicU64,
    late_sequence_drops: AtomicU64,
    duplicate_sequence_drops: AtomicU64,
    decoder_resets: AtomicU64,
    interruptions: AtomicU64,
}

/// Point-in-time copy of the diagnostic counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub empty_payloads: u64,
    pub unannounced_payloads: u64,
    pub stale_fragments: u64,
    pub malformed_fragments: u64,
    pub discarded_after_interrupt: u64,
    pub late_sequence_drops: u64,
    pub duplicate_sequence_drops: u64,
    pub decoder_resets: u64,
    pub interruptions: u64,
}

impl DiagnosticCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            empty_payloads: self.empty_payloads.load(Ordering::Relaxed),
            unannounced_payloads: self.unannounced_payloads.load(Ordering::Relaxed),
            stale_fragments: self.stale_fragments.load(Ordering::Relaxed),
            malformed_fragments: self.malformed_fragments.load(Ordering::Relaxed),
            discarded_after_interrupt: self.discarded_after_interrupt.load(Ordering::Relaxed),
            late_sequence_drops: self.late_sequence_drops.load(Ordering::Relaxed),
            duplicate_sequence_drops: self.duplicate_sequence_drops.load(Ordering::Relaxed),
            decoder_resets: self.decoder_resets.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
        }
    }
}

/// Pipeline state summary for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub active: bool,
    pub in_flight_units: usize,
    pub buffered_units: usize,
    pub committed_sequence: Option<u64>,
    pub current_utterance: Option<UtteranceId>,
}

pub struct AudioSession {
    config: PlaybackConfig,
    receiver: Mutex<ChunkReceiver>,
    controller: Mutex<InterruptionController>,
    decoder: Arc<Mutex<FragmentDecoder>>,
    scheduler: Mutex<Scheduler>,
    tap: Mutex<AmplitudeTap>,
    events: EventBus,
    diagnostics: DiagnosticCounters,
    tick_task: Mutex<Option<JoinHandle<()>>>,
}

impl AudioSession {
    /// Open the default audio device and build a session around it.
    ///
    /// The returned [`AudioOutput`] must be kept alive for playback to be
    /// audible; it is returned separately because device streams are bound
    /// to the thread that created them.
    pub fn open(config: PlaybackConfig) -> Result<(Arc<AudioSession>, AudioOutput)> {
        config.validate()?;
        let (output, queue) =
            AudioOutput::open(config.output_sample_rate, config.ring_capacity_samples())?;
        Ok((Arc::new(Self::from_queue(config, queue)), output))
    }

    /// Build a session without an audio device.
    ///
    /// The caller drives the returned consumer (and thereby the device
    /// clock) by hand; used in tests and headless setups.
    pub fn detached(config: PlaybackConfig) -> Result<(Arc<AudioSession>, PlayoutConsumer)> {
        config.validate()?;
        let (queue, consumer) =
            PlayoutQueue::detached(config.output_sample_rate, config.ring_capacity_samples());
        Ok((Arc::new(Self::from_queue(config, queue)), consumer))
    }

    fn from_queue(config: PlaybackConfig, queue: PlayoutQueue) -> Self {
        Self {
            receiver: Mutex::new(ChunkReceiver::new()),
            controller: Mutex::new(InterruptionController::new()),
            decoder: Arc::new(Mutex::new(FragmentDecoder::new(config.output_sample_rate))),
            scheduler: Mutex::new(Scheduler::new(queue, &config)),
            tap: Mutex::new(AmplitudeTap::new(config.amplitude_smoothing)),
            events: EventBus::new(config.event_capacity),
            diagnostics: DiagnosticCounters::default(),
            tick_task: Mutex::new(None),
            config,
        }
    }

    /// Spawn the recurring scheduler tick task. Idempotent: a previous task
    /// is replaced.
    pub async fn start(self: &Arc<Self>) {
        let session = Arc::clone(self);
        let interval_ms = self.config.tick_interval_ms;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                session.tick().await;
            }
        });
        if let Some(previous) = self.tick_task.lock().await.replace(handle) {
            previous.abort();
        }
        info!(interval_ms, "playback tick task started");
    }

    /// Stop the tick task. Buffered state is untouched; use [`flush`] for
    /// teardown.
    ///
    /// [`flush`]: AudioSession::flush
    pub async fn stop(&self) {
        if let Some(handle) = self.tick_task.lock().await.take() {
            handle.abort();
            info!("playback tick task stopped");
        }
    }

    /// Handle an utterance announcement control message.
    pub async fn announce_utterance(&self, utterance: UtteranceId, encoding: FragmentEncoding) {
        let action = self
            .controller
            .lock()
            .await
            .notify_fragment_header(utterance.clone());

        match action {
            HeaderAction::Skip => {
                debug!(utterance = %utterance, "announcement for interrupted utterance skipped");
            }
            HeaderAction::Accept {
                reset_decoder,
                changed,
                previous,
            } => {
                if reset_decoder {
                    self.decoder.lock().await.reset_stream();
                    DiagnosticCounters::bump(&self.diagnostics.decoder_resets);
                }
                if changed {
                    let purged = self.scheduler.lock().await.purge_stale();
                    if purged > 0 {
                        debug!(purged, "stale buffers purged on utterance change");
                    }
                    self.events.emit_lossy(SessionEvent::UtteranceChanged {
                        from: previous,
                        to: utterance.clone(),
                        timestamp: chrono::Utc::now(),
                    });
                }
                self.receiver.lock().await.announce(utterance, encoding);
            }
        }
    }

    /// Handle one binary payload from the transport.
    pub async fn receive_payload(&self, bytes: Vec<u8>) {
        let fragment = match self.receiver.lock().await.tag(bytes) {
            Ok(fragment) => fragment,
            Err(TagRejection::Empty) => {
                debug!("empty payload dropped");
                DiagnosticCounters::bump(&self.diagnostics.empty_payloads);
                return;
            }
            Err(TagRejection::Unannounced) => {
                warn!("payload before any utterance announcement dropped");
                DiagnosticCounters::bump(&self.diagnostics.unannounced_payloads);
                return;
            }
        };

        if self.controller.lock().await.gate(&fragment.utterance) == Gate::Drop {
            debug!(
                sequence = fragment.sequence,
                utterance = %fragment.utterance,
                "fragment of stale utterance dropped"
            );
            DiagnosticCounters::bump(&self.diagnostics.stale_fragments);
            return;
        }

        let decoded = match fragment.encoding {
            FragmentEncoding::RawPcm16 { .. } => self.decoder.lock().await.decode(&fragment),
            FragmentEncoding::Mp3Stream => {
                // Container decode is CPU-bound; run it off the async
                // threads. The interruption re-check below covers the time
                // spent here.
                let decoder = Arc::clone(&self.decoder);
                let blocking_fragment = fragment.clone();
                match tokio::task::spawn_blocking(move || {
                    decoder.blocking_lock().decode(&blocking_fragment)
                })
                .await
                {
                    Ok(result) => result,
                    Err(e) => Err(Error::Decode(format!("decode task failed: {}", e))),
                }
            }
        };

        match decoded {
            Ok(Some(buffer)) => self.commit_decoded(buffer).await,
            Ok(None) => {}
            Err(e) => {
                warn!(
                    sequence = fragment.sequence,
                    utterance = %fragment.utterance,
                    "fragment decode failed: {}", e
                );
                DiagnosticCounters::bump(&self.diagnostics.malformed_fragments);
            }
        }
    }

    /// Insert a decoded buffer into the scheduling stage.
    ///
    /// Re-checks the interruption state first: a decode that completed
    /// after its utterance was interrupted is discarded here.
    pub(crate) async fn commit_decoded(&self, buffer: DecodedBuffer) {
        if self.controller.lock().await.is_interrupted(&buffer.utterance) {
            debug!(
                sequence = buffer.sequence,
                utterance = %buffer.utterance,
                "decode result discarded after interruption"
            );
            DiagnosticCounters::bump(&self.diagnostics.discarded_after_interrupt);
            return;
        }

        match self.scheduler.lock().await.insert(buffer) {
            InsertOutcome::Inserted => {}
            InsertOutcome::Late => {
                DiagnosticCounters::bump(&self.diagnostics.late_sequence_drops);
            }
            InsertOutcome::Duplicate => {
                DiagnosticCounters::bump(&self.diagnostics.duplicate_sequence_drops);
            }
        }
    }

    /// User barged in over assistant output.
    pub async fn user_activity(&self, utterance: UtteranceId) {
        let was_current = self
            .controller
            .lock()
            .await
            .notify_user_activity(utterance.clone());
        DiagnosticCounters::bump(&self.diagnostics.interruptions);

        let cancelled = self
            .scheduler
            .lock()
            .await
            .cancel(&utterance, self.config.hard_stop_on_barge_in);
        info!(
            utterance = %utterance,
            was_current,
            cancelled,
            "barge-in interruption"
        );
        self.events.emit_lossy(SessionEvent::UtteranceInterrupted {
            utterance,
            timestamp: chrono::Utc::now(),
        });
    }

    /// One scheduling pass; normally driven by the task spawned in
    /// [`start`], callable directly for deterministic tests.
    ///
    /// [`start`]: AudioSession::start
    pub async fn tick(&self) {
        let (report, active) = {
            let mut scheduler = self.scheduler.lock().await;
            let report = scheduler.tick();
            (report, scheduler.is_active())
        };

        {
            let mut tap = self.tap.lock().await;
            tap.set_active(active);
            if active {
                tap.update(report.raw_level);
            }
        }

        if let Some(utterance) = report.started {
            self.events.emit_lossy(SessionEvent::PlaybackStarted {
                utterance,
                timestamp: chrono::Utc::now(),
            });
        }
        if report.became_idle {
            self.events.emit_lossy(SessionEvent::PlaybackIdle {
                timestamp: chrono::Utc::now(),
            });
        }
    }

    /// Full teardown to a fresh session: stop playback, drop all buffered
    /// and pending state, reset sequence numbering and interruption
    /// bookkeeping.
    pub async fn flush(&self) {
        self.receiver.lock().await.reset();
        self.controller.lock().await.reset();
        self.decoder.lock().await.reset_stream();
        self.scheduler.lock().await.flush();
        self.tap.lock().await.set_active(false);
        self.events.emit_lossy(SessionEvent::SessionFlushed {
            timestamp: chrono::Utc::now(),
        });
        info!("session flushed");
    }

    /// Subscribe to session lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Animation-facing smoothed loudness signal.
    pub async fn amplitude(&self) -> watch::Receiver<f32> {
        self.tap.lock().await.subscribe()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    pub async fn status(&self) -> SessionStatus {
        let current_utterance = self.controller.lock().await.current().cloned();
        let scheduler = self.scheduler.lock().await;
        SessionStatus {
            active: scheduler.is_active(),
            in_flight_units: scheduler.in_flight(),
            buffered_units: scheduler.buffered(),
            committed_sequence: scheduler.committed_sequence(),
            current_utterance,
        }
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_bytes(values: &[i16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn pcm_encoding() -> FragmentEncoding {
        FragmentEncoding::RawPcm16 {
            sample_rate: 48_000,
        }
    }

    async fn session() -> Arc<AudioSession> {
        let (session, _consumer) = AudioSession::detached(PlaybackConfig::default()).unwrap();
        session
    }

    #[tokio::test]
    async fn test_pcm_payload_flows_to_scheduler() {
        let session = session().await;
        session.announce_utterance("u1".into(), pcm_encoding()).await;
        session.receive_payload(pcm_bytes(&[1000, -1000])).await;
        session.tick().await;

        let status = session.status().await;
        assert!(status.active);
        assert_eq!(status.in_flight_units, 1);
        assert_eq!(status.committed_sequence, Some(0));
        assert_eq!(
            status.current_utterance.as_ref().map(|u| u.as_str()),
            Some("u1")
        );
    }

    #[tokio::test]
    async fn test_empty_payload_counted_not_fatal() {
        let session = session().await;
        session.announce_utterance("u1".into(), pcm_encoding()).await;
        session.receive_payload(Vec::new()).await;
        session.tick().await;

        assert_eq!(session.diagnostics().empty_payloads, 1);
        assert!(!session.status().await.active);
    }

    #[tokio::test]
    async fn test_unannounced_payload_counted() {
        let session = session().await;
        session.receive_payload(pcm_bytes(&[1])).await;
        assert_eq!(session.diagnostics().unannounced_payloads, 1);
    }

    #[tokio::test]
    async fn test_interrupted_fragments_gated_out() {
        let session = session().await;
        session.announce_utterance("u1".into(), pcm_encoding()).await;
        session.user_activity("u1".into()).await;

        session.receive_payload(pcm_bytes(&[1000])).await;
        let diagnostics = session.diagnostics();
        assert_eq!(diagnostics.stale_fragments, 1);
        assert_eq!(diagnostics.interruptions, 1);
        assert_eq!(session.status().await.in_flight_units, 0);
    }

    #[tokio::test]
    async fn test_decode_result_discarded_after_interruption() {
        let session = session().await;
        session.announce_utterance("u1".into(), pcm_encoding()).await;
        // Interruption lands while a decode is notionally in flight.
        session.user_activity("u1".into()).await;

        let buffer = DecodedBuffer::new(0, "u1".into(), vec![0.5; 100], 48_000);
        session.commit_decoded(buffer).await;

        assert_eq!(session.diagnostics().discarded_after_interrupt, 1);
        let status = session.status().await;
        assert_eq!(status.buffered_units, 0);
        assert_eq!(status.in_flight_units, 0);
    }

    #[tokio::test]
    async fn test_decoder_reset_counted_at_next_utterance() {
        let session = session().await;
        session
            .announce_utterance("u1".into(), FragmentEncoding::Mp3Stream)
            .await;
        session.user_activity("u1".into()).await;
        assert_eq!(session.diagnostics().decoder_resets, 0);

        session
            .announce_utterance("u2".into(), FragmentEncoding::Mp3Stream)
            .await;
        assert_eq!(session.diagnostics().decoder_resets, 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_late_sequences_counted() {
        let session = session().await;
        session.announce_utterance("u1".into(), pcm_encoding()).await;

        session
            .commit_decoded(DecodedBuffer::new(1, "u1".into(), vec![0.1; 10], 48_000))
            .await;
        session
            .commit_decoded(DecodedBuffer::new(1, "u1".into(), vec![0.1; 10], 48_000))
            .await;
        assert_eq!(session.diagnostics().duplicate_sequence_drops, 1);

        session.tick().await;
        session
            .commit_decoded(DecodedBuffer::new(0, "u1".into(), vec![0.1; 10], 48_000))
            .await;
        assert_eq!(session.diagnostics().late_sequence_drops, 1);
    }

    #[tokio::test]
    async fn test_flush_resets_everything() {
        let session = session().await;
        let mut events = session.subscribe();
        session.announce_utterance("u1".into(), pcm_encoding()).await;
        session.receive_payload(pcm_bytes(&[1000, 2000])).await;
        session.tick().await;

        session.flush().await;
        let status = session.status().await;
        assert!(!status.active);
        assert_eq!(status.in_flight_units, 0);
        assert!(status.current_utterance.is_none());
        assert_eq!(status.committed_sequence, None);

        let mut flushed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::SessionFlushed { .. }) {
                flushed = true;
            }
        }
        assert!(flushed);
    }

    #[tokio::test]
    async fn test_events_on_start_and_idle() {
        let config = PlaybackConfig {
            output_sample_rate: 1_000,
            ..PlaybackConfig::default()
        };
        let (session, mut consumer) = AudioSession::detached(config).unwrap();
        let mut events = session.subscribe();

        session
            .announce_utterance(
                "u1".into(),
                FragmentEncoding::RawPcm16 { sample_rate: 1_000 },
            )
            .await;
        session.receive_payload(pcm_bytes(&[1000; 50])).await;
        session.tick().await;

        // Render into the unit's window (lead-in is 100 frames) so the
        // started edge is observed, then past its end for the idle edge.
        let mut out = vec![0.0f32; 120];
        consumer.render(&mut out, 1);
        session.tick().await;
        let mut out = vec![0.0f32; 30];
        consumer.render(&mut out, 1);
        session.tick().await;

        let mut started = false;
        let mut idle = false;
        while let Ok(event) = events.try_recv() {
            match event {
                SessionEvent::PlaybackStarted { utterance, .. } => {
                    assert_eq!(utterance.as_str(), "u1");
                    started = true;
                }
                SessionEvent::PlaybackIdle { .. } => idle = true,
                _ => {}
            }
        }
        assert!(started);
        assert!(idle);
    }
}
