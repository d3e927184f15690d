use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use crate::timing::{TICKS_PER_SEC, Tick};

/// A published estimate of the display's vblank timing.
#[derive(Clone, Copy, Debug)]
pub struct VblankEstimate {
    /// Estimated instant of the vblank one frame after the most recently
    /// observed one
    pub phase: Tick,

    /// Mean ticks between vblanks
    pub period: f64,
}

/// The vblank estimate shared between the estimator's thread and the render
/// thread. These two scalars are the only cross-thread state; relaxed ordering
/// is enough because a torn read (new phase with old period or vice versa)
/// misschedules at most one frame and self-corrects.
#[derive(Clone)]
pub struct SharedVblankEstimate {
    inner: Arc<SharedVblankEstimateInner>,
}

struct SharedVblankEstimateInner {
    phase: AtomicU64,
    // f64 period stored as its bit pattern; there is no AtomicF64
    period_bits: AtomicU64,
}

impl SharedVblankEstimate {
    /// A fresh estimate seeded from the system-claimed refresh rate. The phase
    /// starts at zero, which the scheduler's sanity gate treats as unusable
    /// until an estimator publishes a real value.
    pub fn new(monitor_hz: u32) -> Self {
        let period = TICKS_PER_SEC as f64 / monitor_hz as f64;
        Self {
            inner: Arc::new(SharedVblankEstimateInner {
                phase: AtomicU64::new(0),
                period_bits: AtomicU64::new(period.to_bits()),
            }),
        }
    }

    /// Publish a new estimate. Phase is stored first: if a reader lands between
    /// the two stores it sees the new phase with the old period, and small
    /// period drift wobbles the prediction far less than stale phase would.
    pub fn publish(&self, phase: Tick, period: f64) {
        self.inner.phase.store(phase, Ordering::Relaxed);
        self.inner.period_bits.store(period.to_bits(), Ordering::Relaxed);
    }

    /// Read the current estimate, in the same order it is published.
    pub fn load(&self) -> VblankEstimate {
        let phase = self.inner.phase.load(Ordering::Relaxed);
        let period = f64::from_bits(self.inner.period_bits.load(Ordering::Relaxed));
        VblankEstimate { phase, period }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_then_load_round_trips() {
        let shared = SharedVblankEstimate::new(60);
        shared.publish(1_000_000, 166_666.67);

        let estimate = shared.load();
        assert_eq!(estimate.phase, 1_000_000);
        assert_eq!(estimate.period, 166_666.67);
    }

    #[test]
    fn initial_estimate_uses_claimed_refresh_rate() {
        let shared = SharedVblankEstimate::new(60);
        let estimate = shared.load();

        assert_eq!(estimate.phase, 0);
        assert!((estimate.period - TICKS_PER_SEC as f64 / 60.0).abs() < 1e-9);
    }

    #[test]
    fn clones_share_the_same_estimate() {
        let shared = SharedVblankEstimate::new(60);
        let reader = shared.clone();

        shared.publish(42, 1000.0);
        assert_eq!(reader.load().phase, 42);
    }
}
