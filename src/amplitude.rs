//! Amplitude tap for animation
//!
//! The output callback records the raw RMS of each rendered buffer (after
//! mute, so the value tracks the signal the device actually plays). The
//! scheduler tick smooths that raw value with an exponential moving average
//! and publishes it on a watch channel for the animation layer.

use tokio::sync::watch;

/// Smoothed loudness signal.
///
/// Active exactly while playback units are in flight; idle forces the
/// published value back to zero so a face does not keep talking.
pub struct AmplitudeTap {
    tx: watch::Sender<f32>,
    level: f32,
    smoothing: f32,
    active: bool,
}

impl AmplitudeTap {
    /// `smoothing` in (0, 1]: weight of the newest raw sample. 1.0 means no
    /// smoothing.
    pub fn new(smoothing: f32) -> Self {
        let (tx, _rx) = watch::channel(0.0f32);
        Self {
            tx,
            level: 0.0,
            smoothing: smoothing.clamp(0.01, 1.0),
            active: false,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<f32> {
        self.tx.subscribe()
    }

    /// Fold one raw RMS reading into the smoothed level and publish it.
    /// Ignored while inactive.
    pub fn update(&mut self, raw_rms: f32) {
        if !self.active {
            return;
        }
        self.level += self.smoothing * (raw_rms - self.level);
        let _ = self.tx.send(self.level);
    }

    /// Playback lifecycle hook; deactivation zeroes the published level.
    pub fn set_active(&mut self, active: bool) {
        if self.active == active {
            return;
        }
        self.active = active;
        if !active {
            self.level = 0.0;
            let _ = self.tx.send(0.0);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn level(&self) -> f32 {
        self.level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_ignores_updates() {
        let mut tap = AmplitudeTap::new(0.5);
        let rx = tap.subscribe();
        tap.update(0.8);
        assert_eq!(tap.level(), 0.0);
        assert_eq!(*rx.borrow(), 0.0);
    }

    #[test]
    fn test_smoothing_converges() {
        let mut tap = AmplitudeTap::new(0.5);
        tap.set_active(true);
        tap.update(1.0);
        assert!((tap.level() - 0.5).abs() < 1e-6);
        tap.update(1.0);
        assert!((tap.level() - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_deactivate_zeroes_signal() {
        let mut tap = AmplitudeTap::new(0.5);
        let rx = tap.subscribe();
        tap.set_active(true);
        tap.update(1.0);
        assert!(*rx.borrow() > 0.0);

        tap.set_active(false);
        assert_eq!(*rx.borrow(), 0.0);
        assert_eq!(tap.level(), 0.0);
    }

    #[test]
    fn test_watch_publishes_latest() {
        let mut tap = AmplitudeTap::new(1.0);
        let rx = tap.subscribe();
        tap.set_active(true);
        tap.update(0.3);
        tap.update(0.6);
        assert!((*rx.borrow() - 0.6).abs() < 1e-6);
    }
}
