use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use log::info;

use crate::{
    estimate::SharedVblankEstimate, pivot_hull::PivotHullEstimator, platform::VblankWaiter,
    timing,
};

/// Spawn the vblank heartbeat thread: block on the platform's vblank wait in a
/// loop and feed each wake-up time to a pivot-hull estimator, which publishes
/// its running (phase, period) through `shared`.
///
/// A failed wait is taken as a hint that the system slept or the display went
/// away; the estimator is restarted and the loop carries on. Shutdown is
/// cooperative via `stop`; the caller may also just detach the thread and let
/// process exit collect it.
pub fn spawn_heartbeat(
    waiter: Box<dyn VblankWaiter>,
    shared: SharedVblankEstimate,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut estimator = PivotHullEstimator::new(shared);
        while !stop.load(Ordering::Relaxed) {
            match waiter.wait_for_vblank() {
                Ok(()) => estimator.feed(timing::now()),
                Err(error) => {
                    info!("vblank heartbeat failed ({error}), restarting estimator");
                    estimator.restart(timing::now());
                }
            }
        }
    })
}
