use crate::{
    estimate::VblankEstimate,
    gpu_timing::FrameTiming,
    platform::ScanoutGeometry,
    timing::{TICKS_PER_SEC, Tick},
};

/// Fixed scheduling inputs, set once at startup.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    pub monitor_hz: u32,
    pub geometry: ScanoutGeometry,

    /// Extra seconds budgeted beyond the smoothed frame time, because
    /// rendering sometimes overruns its estimate even on an empty scene
    pub render_overrun_buffer: f64,

    /// Seconds between issuing the swap and the new image reaching the
    /// scanout, a property of the GPU that varies with its power state
    pub gpu_swap_delay: f64,
}

/// Swap instants for one frame, all in ticks.
#[derive(Clone, Copy, Debug)]
pub struct SwapTargets {
    /// When the image crosses the chosen tearline on screen
    pub appearance: Tick,

    /// When the render thread should issue the swap
    pub swap: Tick,

    /// When rendering needs to start for the swap to make it
    pub render_start: Tick,
}

/// The per-frame scheduling decision.
#[derive(Clone, Copy, Debug)]
pub struct FramePlan {
    /// Whether to spend GPU queries measuring this frame
    pub measure_gpu: bool,

    /// Targets to sleep for, or None to spam-swap as fast as possible
    pub targets: Option<SwapTargets>,
}

/// Fuses the vblank estimate with GPU timing to pick when each frame should
/// swap so the tearline lands at the requested screen fraction.
pub struct FrameScheduler {
    config: SchedulerConfig,

    /// Appearance target of the previous frame, for the duplicate-frame guard
    last_target: Tick,

    /// Start of the previous frame's planning, for the measurement gate
    last_frame_start: Tick,
}

impl FrameScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            last_target: 0,
            last_frame_start: 0,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// The geometry is refined while running on platforms that report where
    /// the blanking interval really ends
    pub fn geometry_mut(&mut self) -> &mut ScanoutGeometry {
        &mut self.config.geometry
    }

    /// Decide this frame's targets. `tearline_fraction` in [0, 1] picks the
    /// on-screen tearline position, 0 at the top of the display.
    pub fn plan(
        &mut self,
        now: Tick,
        estimate: VblankEstimate,
        timing: &FrameTiming,
        tearline_fraction: f64,
    ) -> FramePlan {
        let period = estimate.period;
        let period_seconds = period / TICKS_PER_SEC as f64;

        let previous_frame_start = self.last_frame_start;
        self.last_frame_start = now;

        // Measure whenever there is any chance a frame fits in a refresh;
        // fresh measurements are what rehabilitate a pessimistic estimate
        let measure_gpu = timing.frame_time_single < period_seconds
            || timing.frame_time_smoothed < period_seconds
            || (now.wrapping_sub(previous_frame_start) as f64) < period;

        // Waiting additionally requires slack according to the smoothed cost
        let mut syncing = measure_gpu && timing.frame_time_smoothed < period_seconds;

        // A cold or recently-reset estimator publishes nonsense; don't try to
        // aim at it, just swap freely until it relocks
        let phase_distance = (now.wrapping_sub(estimate.phase) as i64).unsigned_abs();
        if period > TICKS_PER_SEC as f64 || phase_distance > 10 * TICKS_PER_SEC {
            syncing = false;
        }

        if !syncing {
            return FramePlan {
                measure_gpu,
                targets: None,
            };
        }

        let geometry = &self.config.geometry;

        // From now until the finished image is on screen
        let render_duration_seconds = timing.frame_time_smoothed
            + self.config.render_overrun_buffer
            + self.config.gpu_swap_delay;
        let render_duration_ticks = render_duration_seconds * TICKS_PER_SEC as f64;

        // The first displayed line trails the sync point, so an image
        // "appearing" at a screen fraction does so late within the scan cycle
        let appearing_late_offset = (geometry.sync_to_first_active as f64
            - geometry.porch_scanlines as f64)
            / geometry.total_scanlines as f64;
        let tearline_after_sync = tearline_fraction + appearing_late_offset;

        // Smallest whole number of periods ahead of the phase that leaves
        // enough time to render before the tearline passes
        let rel = now.wrapping_sub(estimate.phase) as i64 as f64;
        let k = ((rel + render_duration_ticks) / period - tearline_after_sync).ceil();
        let mut appearance = estimate
            .phase
            .wrapping_add(((tearline_after_sync + k) * period) as i64 as u64);

        // Rendering faster than the monitor refreshes must not map two frames
        // onto one vblank; push the second one out a period
        if (appearance.wrapping_sub(self.last_target) as i64) < (period / 2.0) as i64 {
            appearance = appearance.wrapping_add(period as i64 as u64);
        }
        self.last_target = appearance;

        let swap = appearance.wrapping_sub(
            ((self.config.gpu_swap_delay + timing.swap_time) * TICKS_PER_SEC as f64) as i64 as u64,
        );
        let render_start = appearance.wrapping_sub(render_duration_ticks as i64 as u64);

        FramePlan {
            measure_gpu,
            targets: Some(SwapTargets {
                appearance,
                swap,
                render_start,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::VblankEstimate;
    use crate::gpu_timing::QueryKind;

    const PERIOD: f64 = TICKS_PER_SEC as f64 / 60.0;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            monitor_hz: 60,
            geometry: ScanoutGeometry::new(1125, 1080, 41),
            render_overrun_buffer: 0.0008,
            gpu_swap_delay: 0.0023,
        }
    }

    fn warm_timing() -> FrameTiming {
        let mut timing = FrameTiming::new(60);
        // render 2 ms, then swap 0.5 ms
        for _ in 0..8 {
            timing.record(QueryKind::Render, 0.002);
            timing.record(QueryKind::Swap, 0.0005);
        }
        timing
    }

    #[test]
    fn tearline_target_matches_hand_computation() {
        let mut scheduler = FrameScheduler::new(config());
        let mut timing = FrameTiming::new(60);
        timing.render_time = 0.002;
        timing.swap_time = 0.0005;
        timing.frame_time_single = 0.0025;
        timing.frame_time_smoothed = 0.002;

        let estimate = VblankEstimate {
            phase: 0,
            period: PERIOD,
        };
        let now = 150_000_000;
        let plan = scheduler.plan(now, estimate, &timing, 0.5);

        assert!(plan.measure_gpu);
        let targets = plan.targets.expect("slack exists, should sync");

        // Hand-computed: render_duration = 5.1 ms, tearline offset
        // 0.5 + (41 - 45)/1125, so k = ceil(9.306 - 0.49644) = 9
        let tearline_after_sync = 0.5 + (41.0 - 45.0) / 1125.0;
        let expected_appearance = ((tearline_after_sync + 9.0) * PERIOD) as u64;
        assert_eq!(targets.appearance, expected_appearance);
        assert_eq!(
            targets.swap,
            expected_appearance - ((0.0023 + 0.0005) * TICKS_PER_SEC as f64) as u64
        );
        assert_eq!(
            targets.render_start,
            expected_appearance - ((0.002 + 0.0008 + 0.0023) * TICKS_PER_SEC as f64) as u64
        );

        // The plan leaves time to render and the appearance is in the future
        assert!(targets.render_start >= now);
        assert!(targets.appearance > now);
    }

    #[test]
    fn duplicate_frame_guard_pushes_to_next_vblank() {
        let mut scheduler = FrameScheduler::new(config());
        let timing = warm_timing();
        let estimate = VblankEstimate {
            phase: 0,
            period: PERIOD,
        };

        let first = scheduler
            .plan(150_000_000, estimate, &timing, 0.5)
            .targets
            .unwrap();

        // Re-planning almost immediately would land on the same vblank
        let second = scheduler
            .plan(150_001_000, estimate, &timing, 0.5)
            .targets
            .unwrap();

        let advance = second.appearance - first.appearance;
        assert_eq!(advance, PERIOD as u64);
    }

    #[test]
    fn consecutive_targets_never_share_a_vblank() {
        let mut scheduler = FrameScheduler::new(config());
        let timing = warm_timing();
        let estimate = VblankEstimate {
            phase: 777,
            period: PERIOD,
        };

        let mut now: u64 = 100_000_000;
        let mut previous: Option<u64> = None;
        let mut step: u64 = 1_000;
        for _ in 0..200 {
            let plan = scheduler.plan(now, estimate, &timing, 0.25);
            let targets = plan.targets.unwrap();
            if let Some(previous) = previous {
                assert!(targets.appearance - previous >= (PERIOD / 2.0) as u64);
            }
            previous = Some(targets.appearance);

            // Wildly varying frame rate, from 1500 fps down to past a refresh
            step = (step * 7 + 3_001) % 20_000_000;
            now += step + 100;
        }
    }

    #[test]
    fn stale_estimate_forces_spam_swap() {
        let mut scheduler = FrameScheduler::new(config());
        let timing = warm_timing();

        // Phase is nowhere near now
        let estimate = VblankEstimate {
            phase: 200 * TICKS_PER_SEC,
            period: PERIOD,
        };
        let plan = scheduler.plan(1_000_000, estimate, &timing, 0.5);
        assert!(plan.targets.is_none());

        // Period longer than a second is equally unusable
        let estimate = VblankEstimate {
            phase: 1_000_000,
            period: 2.0 * TICKS_PER_SEC as f64,
        };
        let plan = scheduler.plan(1_000_000, estimate, &timing, 0.5);
        assert!(plan.targets.is_none());
    }

    #[test]
    fn no_slack_means_no_waiting_but_still_measuring() {
        let mut scheduler = FrameScheduler::new(config());
        let mut timing = FrameTiming::new(60);
        // Smoothed cost exceeds a refresh; a single frame still fits
        timing.frame_time_single = 0.002;
        timing.frame_time_smoothed = 0.03;

        let estimate = VblankEstimate {
            phase: 100_000_000,
            period: PERIOD,
        };
        let plan = scheduler.plan(100_000_000, estimate, &timing, 0.5);

        assert!(plan.measure_gpu);
        assert!(plan.targets.is_none());
    }

    #[test]
    fn hopeless_frame_times_stop_measurement() {
        let mut scheduler = FrameScheduler::new(config());
        let mut timing = FrameTiming::new(60);
        timing.frame_time_single = 0.05;
        timing.frame_time_smoothed = 0.05;

        let estimate = VblankEstimate {
            phase: 100_000_000,
            period: PERIOD,
        };

        // First plan: the previous frame start is long gone, so the recency
        // clause doesn't apply either
        let plan = scheduler.plan(100_000_000, estimate, &timing, 0.5);
        assert!(!plan.measure_gpu);

        // Immediately replanned: the last frame started under a period ago,
        // so measurement resumes
        let plan = scheduler.plan(100_001_000, estimate, &timing, 0.5);
        assert!(plan.measure_gpu);
    }
}
