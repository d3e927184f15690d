use log::debug;

use crate::platform::GpuTimestamps;

/// Number of query slots in the ring. GPU query results can lag five or more
/// frames behind submission, so the ring is sized generously; an entry is only
/// ever overwritten if the driver has lost it, which is acceptable.
pub const QUERY_RING_SIZE: usize = 128;

/// One start time per stamp pair
const START_SLOTS: usize = QUERY_RING_SIZE / 2;

/// What a timestamp pair measures, recorded alongside each query so the
/// retrieval side knows how to fold the elapsed time into the frame timing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryKind {
    /// GPU cost of rendering alone
    Render = 0,
    /// GPU cost of the swap alone
    Swap = 1,
    /// Render and swap measured together; split proportionally on retrieval
    Both = 2,
    /// Input-latency marker; consumed without touching frame timing
    Input = 3,
}

impl QueryKind {
    fn from_meta(meta: u32) -> QueryKind {
        match meta % 4 {
            0 => QueryKind::Render,
            1 => QueryKind::Swap,
            2 => QueryKind::Both,
            _ => QueryKind::Input,
        }
    }
}

/// GPU-measured frame costs, in seconds, fed by the query ring.
pub struct FrameTiming {
    /// Most recent GPU render cost
    pub render_time: f64,

    /// Most recent GPU swap cost
    pub swap_time: f64,

    /// render_time + swap_time, or the latest joint measurement
    pub frame_time_single: f64,

    /// Nonlinear-filtered frame cost the scheduler plans with
    pub frame_time_smoothed: f64,

    /// Good samples since the last discarded outlier. Only a well-fed filter
    /// is allowed to throw a sample away.
    frames_since_discarded: u64,

    monitor_hz: u32,
}

impl FrameTiming {
    pub fn new(monitor_hz: u32) -> Self {
        Self {
            render_time: 0.0,
            swap_time: 0.0,
            frame_time_single: 0.0,
            // Optimistic start: assume frames fit in half a refresh until
            // measurements say otherwise
            frame_time_smoothed: 0.5 / monitor_hz as f64,
            frames_since_discarded: 64,
            monitor_hz,
        }
    }

    /// Fold one retrieved pair duration into the timing state.
    pub(crate) fn record(&mut self, kind: QueryKind, seconds: f64) {
        // A minimized window keeps producing timestamps, and its frame times
        // are garbage that cannot be told apart from genuinely slow frames.
        // Cap at two refreshes: every frame time that long produces identical
        // behavior anyway (the scheduler stops trying to sync), and the cap
        // keeps the filter recoverable.
        let cap = 2.0 / self.monitor_hz as f64;

        let mut sample = seconds;
        let mut feed_filter = true;
        if sample < cap {
            self.frames_since_discarded += 1;
        } else if self.frames_since_discarded >= 64 && sample > 2.0 * self.frame_time_smoothed {
            // One exceptional frame in a long while is dropped outright
            self.frames_since_discarded = 0;
            feed_filter = false;
        } else {
            self.frames_since_discarded = 0;
            sample = cap;
        }

        match kind {
            QueryKind::Render => {
                self.render_time = sample;
                self.frame_time_single = self.render_time + self.swap_time;
            }
            QueryKind::Swap => {
                self.swap_time = sample;
                self.frame_time_single = self.render_time + self.swap_time;
            }
            QueryKind::Both => {
                // Keep the render/swap proportions from the last split
                // measurement. The floor covers the very first frames, before
                // any measurement exists.
                let previous_single = self.frame_time_single.max(1e-9);
                self.render_time *= sample / previous_single;
                self.swap_time *= sample / previous_single;
                self.frame_time_single = sample;
            }
            QueryKind::Input => unreachable!("input stamps don't carry durations"),
        }

        if feed_filter {
            self.smooth(sample);
        }
    }

    /// Exponential filter with a 5 Hz time constant, weighted by real time so
    /// a burst of fast frames doesn't dominate. The added 4 ms keeps tiny
    /// render times from being weighted to nothing: the sample is the cost of
    /// one frame, not the spacing between frames.
    fn smooth(&mut self, sample: f64) {
        const DECAY_HZ: f64 = 5.0;
        let remainder = (-(sample + 0.004) * DECAY_HZ).exp();
        self.frame_time_smoothed =
            self.frame_time_smoothed * remainder + sample * (1.0 - remainder);
    }
}

/// Circular queue of GPU timestamp queries.
///
/// `head` is the next slot to stamp, `tail` the oldest unretrieved one; both
/// free-run and wrap. A parallel meta ring records, for each stamp, the
/// logical pair slot and the kind. Pair slots advance one per non-input stamp,
/// so even pair positions are starts and odd ones are ends, with input markers
/// transparent to the pairing.
pub struct GpuQueryRing {
    head: u32,
    tail: u32,

    /// pair_slot * 4 + kind for each query position
    slot_meta: [u32; QUERY_RING_SIZE],

    /// Start-of-pair GPU times awaiting their end stamp, in nanoseconds
    start_times_ns: [u64; START_SLOTS],

    /// Free-running count of non-input stamps
    pair_slot: u32,
}

impl GpuQueryRing {
    pub fn new() -> Self {
        Self {
            head: 0,
            tail: 0,
            slot_meta: [0; QUERY_RING_SIZE],
            start_times_ns: [0; START_SLOTS],
            pair_slot: 0,
        }
    }

    /// Number of stamps issued but not yet retrieved
    pub fn in_flight(&self) -> u32 {
        self.head.wrapping_sub(self.tail)
    }

    /// Issue a GPU timestamp of the given kind.
    pub fn send(&mut self, kind: QueryKind, gpu: &mut dyn GpuTimestamps) {
        // A full ring means the driver has sat on results for 128 stamps;
        // abandon the oldest rather than stall the render thread
        if self.in_flight() == QUERY_RING_SIZE as u32 {
            self.tail = self.tail.wrapping_add(1);
        }

        let position = self.head as usize % QUERY_RING_SIZE;
        self.slot_meta[position] = self.pair_slot.wrapping_mul(4).wrapping_add(kind as u32);
        gpu.record_timestamp(position);
        self.head = self.head.wrapping_add(1);

        if kind != QueryKind::Input {
            self.pair_slot = self.pair_slot.wrapping_add(1);
            // Without a flush the stamp can sit in the command queue until the
            // next vblank and report a full frame of phantom time
            gpu.flush();
        }
    }

    /// Retrieve every finished query, oldest first, folding completed pairs
    /// into `timing`. Stops at the first query that is not ready; a query
    /// error also stops the drain and the stale entries roll over eventually.
    pub fn drain_available(&mut self, gpu: &mut dyn GpuTimestamps, timing: &mut FrameTiming) {
        while self.tail != self.head {
            let position = self.tail as usize % QUERY_RING_SIZE;
            match gpu.is_ready(position) {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => break,
            }

            let meta = self.slot_meta[position];
            match gpu.timestamp_ns(position) {
                Ok(stamp_ns) => {
                    let kind = QueryKind::from_meta(meta);
                    if kind != QueryKind::Input {
                        let pair_slot = meta / 4;
                        let start_index = (pair_slot / 2) as usize % START_SLOTS;
                        if pair_slot % 2 == 0 {
                            self.start_times_ns[start_index] = stamp_ns;
                        } else {
                            let elapsed = stamp_ns.wrapping_sub(self.start_times_ns[start_index]);
                            timing.record(kind, elapsed as f64 / 1e9);
                        }
                    }
                }
                Err(error) => {
                    // Driver lost the result; the slot still counts as consumed
                    debug!("GPU timestamp retrieval failed: {error}");
                }
            }

            self.tail = self.tail.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PlatformError;

    /// A GPU whose timestamps are scripted by the test
    struct ScriptedGpu {
        /// Value each slot records when stamped; None = never becomes ready
        next_stamps: Vec<Option<u64>>,
        recorded: [Option<u64>; QUERY_RING_SIZE],
        flushes: usize,
    }

    impl ScriptedGpu {
        fn new(stamps: Vec<Option<u64>>) -> Self {
            Self {
                next_stamps: stamps,
                recorded: [None; QUERY_RING_SIZE],
                flushes: 0,
            }
        }
    }

    impl GpuTimestamps for ScriptedGpu {
        fn slot_count(&self) -> usize {
            QUERY_RING_SIZE
        }

        fn record_timestamp(&mut self, slot: usize) {
            self.recorded[slot] = self.next_stamps.remove(0);
        }

        fn is_ready(&mut self, slot: usize) -> Result<bool, PlatformError> {
            Ok(self.recorded[slot].is_some())
        }

        fn timestamp_ns(&mut self, slot: usize) -> Result<u64, PlatformError> {
            self.recorded[slot].ok_or(PlatformError::QueryResultLost)
        }

        fn flush(&mut self) {
            self.flushes += 1;
        }
    }

    #[test]
    fn pair_of_stamps_updates_render_time() {
        // 2 ms of GPU time between start and end
        let mut gpu = ScriptedGpu::new(vec![Some(10_000_000), Some(12_000_000)]);
        let mut ring = GpuQueryRing::new();
        let mut timing = FrameTiming::new(60);

        ring.send(QueryKind::Render, &mut gpu);
        ring.send(QueryKind::Render, &mut gpu);
        ring.drain_available(&mut gpu, &mut timing);

        assert_eq!(ring.in_flight(), 0);
        assert!((timing.render_time - 0.002).abs() < 1e-9);
        assert!((timing.frame_time_single - 0.002).abs() < 1e-9);
        assert_eq!(gpu.flushes, 2);
    }

    #[test]
    fn render_and_swap_pairs_sum_into_single_frame_time() {
        let mut gpu = ScriptedGpu::new(vec![
            Some(10_000_000),
            Some(12_000_000), // render: 2 ms
            Some(20_000_000),
            Some(20_500_000), // swap: 0.5 ms
        ]);
        let mut ring = GpuQueryRing::new();
        let mut timing = FrameTiming::new(60);

        ring.send(QueryKind::Render, &mut gpu);
        ring.send(QueryKind::Render, &mut gpu);
        ring.send(QueryKind::Swap, &mut gpu);
        ring.send(QueryKind::Swap, &mut gpu);
        ring.drain_available(&mut gpu, &mut timing);

        assert!((timing.render_time - 0.002).abs() < 1e-9);
        assert!((timing.swap_time - 0.0005).abs() < 1e-9);
        assert!((timing.frame_time_single - 0.0025).abs() < 1e-9);
    }

    #[test]
    fn joint_measurement_splits_proportionally() {
        let mut gpu = ScriptedGpu::new(vec![
            Some(10_000_000),
            Some(12_000_000), // render: 2 ms
            Some(20_000_000),
            Some(21_000_000), // swap: 1 ms
            Some(30_000_000),
            Some(36_000_000), // both: 6 ms, double the previous 3 ms total
        ]);
        let mut ring = GpuQueryRing::new();
        let mut timing = FrameTiming::new(60);

        for kind in [
            QueryKind::Render,
            QueryKind::Render,
            QueryKind::Swap,
            QueryKind::Swap,
            QueryKind::Both,
            QueryKind::Both,
        ] {
            ring.send(kind, &mut gpu);
        }
        ring.drain_available(&mut gpu, &mut timing);

        assert!((timing.frame_time_single - 0.006).abs() < 1e-9);
        assert!((timing.render_time - 0.004).abs() < 1e-9);
        assert!((timing.swap_time - 0.002).abs() < 1e-9);
    }

    #[test]
    fn drain_stops_at_first_unready_query() {
        let mut gpu = ScriptedGpu::new(vec![Some(10_000_000), None, Some(30_000_000)]);
        let mut ring = GpuQueryRing::new();
        let mut timing = FrameTiming::new(60);

        ring.send(QueryKind::Render, &mut gpu);
        ring.send(QueryKind::Render, &mut gpu);
        ring.send(QueryKind::Render, &mut gpu);
        ring.drain_available(&mut gpu, &mut timing);

        // Only the first stamp retrieved; no pair completed
        assert_eq!(ring.in_flight(), 2);
        assert_eq!(timing.render_time, 0.0);
    }

    #[test]
    fn input_stamps_do_not_disturb_pairing() {
        let mut gpu = ScriptedGpu::new(vec![
            Some(10_000_000),
            Some(50_000_000), // input marker between start and end
            Some(12_000_000),
        ]);
        let mut ring = GpuQueryRing::new();
        let mut timing = FrameTiming::new(60);

        ring.send(QueryKind::Render, &mut gpu);
        ring.send(QueryKind::Input, &mut gpu);
        ring.send(QueryKind::Render, &mut gpu);
        ring.drain_available(&mut gpu, &mut timing);

        assert!((timing.render_time - 0.002).abs() < 1e-9);
    }

    #[test]
    fn smoothed_frame_time_stays_bounded() {
        let mut timing = FrameTiming::new(60);
        let cap = 2.0 / 60.0;

        // Arbitrary garbage, including absurd outliers
        let samples = [0.001, 0.5, 3.0, 0.002, 10.0, 0.016, 100.0, 0.0001];
        for sample in samples {
            timing.record(QueryKind::Both, sample);
            assert!(timing.frame_time_smoothed <= cap + 1e-12);
        }
    }

    #[test]
    fn lone_outlier_is_discarded_after_a_quiet_stretch() {
        let mut timing = FrameTiming::new(60);
        for _ in 0..64 {
            timing.record(QueryKind::Both, 0.002);
        }
        let smoothed_before = timing.frame_time_smoothed;

        // Far over the cap and over twice the smoothed value
        timing.record(QueryKind::Both, 1.0);
        assert_eq!(timing.frame_time_smoothed, smoothed_before);

        // A second outlier right away no longer qualifies and is clamped in
        timing.record(QueryKind::Both, 1.0);
        assert!(timing.frame_time_smoothed > smoothed_before);
        assert!(timing.frame_time_smoothed <= 2.0 / 60.0);
    }
}
