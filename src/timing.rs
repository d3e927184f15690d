use std::{
    sync::{
        OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use log::debug;

/// A count of ticks on the process-wide monotonic clock
pub type Tick = u64;

/// Number of ticks per second. Ticks are nanoseconds measured from a base instant
/// captured the first time the clock is read.
pub const TICKS_PER_SEC: u64 = 1_000_000_000;

/// How far an OS sleep is expected to overrun the requested duration. The coarse
/// sleep in `accurate_sleep_until` undershoots by this much and the spin loop
/// covers the remainder.
pub const EXPECTED_OVERRUN: Tick = TICKS_PER_SEC / 1000;

static BASE_INSTANT: OnceLock<Instant> = OnceLock::new();

/// Whether to log sleep overrun/underrun diagnostics
static BENCHMARK_SLEEP: AtomicBool = AtomicBool::new(false);

pub fn set_benchmark_sleep(enabled: bool) {
    BENCHMARK_SLEEP.store(enabled, Ordering::Relaxed);
}

/// Current time in ticks. Monotonically non-decreasing within a thread.
pub fn now() -> Tick {
    let base = BASE_INSTANT.get_or_init(Instant::now);
    duration_to_ticks(Instant::now().duration_since(*base))
}

/// Whether tick `a` comes before tick `b`. Ticks are circular, so compare with a
/// signed difference rather than `<`.
pub fn tick_before(a: Tick, b: Tick) -> bool {
    (a.wrapping_sub(b) as i64) < 0
}

/// Yield to the OS for at most `ticks`. Returns false and does nothing if the
/// requested duration is within the expected overrun, since the kernel sleep
/// would likely run past the deadline.
pub fn sleep_at_most(ticks: Tick) -> bool {
    if ticks <= EXPECTED_OVERRUN {
        return false;
    }

    thread::sleep(Duration::from_nanos(ticks - EXPECTED_OVERRUN));
    true
}

/// Sleep until `deadline`, overshooting as little as possible. Combines a coarse
/// kernel sleep with a pause-instruction spin loop for the final stretch.
///
/// Pass in the current time if it was already sampled this frame.
pub fn accurate_sleep_until(deadline: Tick, mut current_time: Tick) {
    if tick_before(deadline, current_time) {
        if BENCHMARK_SLEEP.load(Ordering::Relaxed) {
            debug!(
                "[SLEEP] deadline already passed by {}us",
                current_time.wrapping_sub(deadline) / 1000
            );
        }
        return;
    }

    if deadline.wrapping_sub(current_time) > EXPECTED_OVERRUN {
        sleep_at_most(deadline.wrapping_sub(current_time));
        current_time = now();
    }

    if BENCHMARK_SLEEP.load(Ordering::Relaxed) {
        if tick_before(deadline, current_time) {
            debug!(
                "[SLEEP] coarse sleep overrun {}us",
                current_time.wrapping_sub(deadline) / 1000
            );
        } else if deadline.wrapping_sub(current_time) > EXPECTED_OVERRUN * 3 / 2 {
            debug!(
                "[SLEEP] coarse sleep underrun {}us",
                deadline.wrapping_sub(current_time) / 1000
            );
        }
    }

    while tick_before(current_time, deadline) {
        std::hint::spin_loop();
        current_time = now();
    }
}

/// Ask the OS for finer coarse-sleep granularity for the duration of the render
/// loop. On platforms where the standard sleep is already backed by a
/// high-resolution timer this is a no-op; failing to raise resolution degrades
/// sleep accuracy but is never fatal.
pub fn raise_timer_resolution() {}

/// Undo `raise_timer_resolution` when leaving the render loop.
pub fn restore_timer_resolution() {}

fn duration_to_ticks(duration: Duration) -> Tick {
    duration.as_secs() * TICKS_PER_SEC + duration.subsec_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic() {
        let mut previous = now();
        for _ in 0..1000 {
            let current = now();
            assert!(current >= previous);
            previous = current;
        }
    }

    #[test]
    fn tick_order_handles_wraparound() {
        assert!(tick_before(5, 10));
        assert!(!tick_before(10, 5));
        assert!(!tick_before(7, 7));

        // A tick just before the wrap point still compares before one just after
        assert!(tick_before(u64::MAX - 10, 10));
        assert!(!tick_before(10, u64::MAX - 10));
    }

    #[test]
    fn short_sleep_request_is_refused() {
        assert!(!sleep_at_most(EXPECTED_OVERRUN));
        assert!(!sleep_at_most(0));
        assert!(sleep_at_most(EXPECTED_OVERRUN + TICKS_PER_SEC / 1000));
    }

    #[test]
    fn sleep_until_past_deadline_returns_immediately() {
        let start = now();
        accurate_sleep_until(start.saturating_sub(TICKS_PER_SEC), start);
        let elapsed = now() - start;
        assert!(elapsed < TICKS_PER_SEC / 100);
    }

    #[test]
    fn sleep_until_reaches_deadline() {
        let start = now();
        let deadline = start + TICKS_PER_SEC / 500;
        accurate_sleep_until(deadline, start);
        let woke_at = now();

        assert!(woke_at >= deadline);
        // Generous bound for loaded test machines; typical overshoot is <50us
        assert!(woke_at - deadline < TICKS_PER_SEC / 20);
    }
}
