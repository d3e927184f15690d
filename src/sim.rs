use crate::{
    platform::{
        GpuTimestamps, PlatformError, Presenter, ScanlineSample, ScanlineSource, ScanoutGeometry,
        VblankWaiter,
    },
    timing::{self, TICKS_PER_SEC, Tick},
};

/// A display whose raster sweeps a fixed number of scanlines at a fixed rate,
/// anchored to an epoch instant. Stands in for the platform's vblank wait and
/// scanline counter so the whole scheduling stack can run and be tested
/// without a GPU or a real monitor.
///
/// The cycle model matches real scanout hardware: the counter starts at the
/// sync pulse, lines below `sync_to_first_active` are inside the blanking
/// interval, and the remaining lines carry the image.
#[derive(Clone, Copy)]
pub struct SimulatedDisplay {
    /// A sync instant (scanline 0)
    epoch: Tick,
    ticks_per_scanline: u64,
    geometry: ScanoutGeometry,
}

impl SimulatedDisplay {
    pub fn new(epoch: Tick, ticks_per_scanline: u64, geometry: ScanoutGeometry) -> Self {
        Self {
            epoch,
            ticks_per_scanline,
            geometry,
        }
    }

    /// A 60 Hz-ish 1080-line display, the common case for demos and tests
    pub fn with_refresh_rate(epoch: Tick, monitor_hz: u32) -> Self {
        let geometry = ScanoutGeometry::new(1125, 1080, 41);
        let ticks_per_scanline =
            TICKS_PER_SEC / (geometry.total_scanlines as u64 * monitor_hz as u64);
        Self::new(epoch, ticks_per_scanline, geometry)
    }

    pub fn geometry(&self) -> ScanoutGeometry {
        self.geometry
    }

    pub fn period_ticks(&self) -> u64 {
        self.ticks_per_scanline * self.geometry.total_scanlines as u64
    }

    /// The refresh rate the platform would claim for this display
    pub fn refresh_rate(&self) -> u32 {
        ((TICKS_PER_SEC as f64 / self.period_ticks() as f64) + 0.5) as u32
    }

    /// Raster position at an arbitrary instant
    pub fn scanline_at(&self, at: Tick) -> ScanlineSample {
        let into_cycle = at.wrapping_sub(self.epoch) % self.period_ticks();
        let line = (into_cycle / self.ticks_per_scanline) as u32;
        ScanlineSample {
            line,
            in_vblank: line < self.geometry.sync_to_first_active,
        }
    }

    /// First sync instant strictly after `at`
    pub fn next_vblank_after(&self, at: Tick) -> Tick {
        let period = self.period_ticks();
        let into_cycle = at.wrapping_sub(self.epoch) % period;
        at.wrapping_add(period - into_cycle)
    }
}

impl VblankWaiter for SimulatedDisplay {
    fn wait_for_vblank(&self) -> Result<(), PlatformError> {
        let now = timing::now();
        timing::accurate_sleep_until(self.next_vblank_after(now), now);
        Ok(())
    }
}

impl ScanlineSource for SimulatedDisplay {
    fn scanline(&mut self) -> Result<ScanlineSample, PlatformError> {
        Ok(self.scanline_at(timing::now()))
    }
}

/// A vblank waiter that fails every wait, for exercising the heartbeat's
/// recovery path.
pub struct FailingVblankWaiter;

impl VblankWaiter for FailingVblankWaiter {
    fn wait_for_vblank(&self) -> Result<(), PlatformError> {
        Err(PlatformError::VblankWaitFailed)
    }
}

struct SimulatedStamp {
    ready_at: Tick,
    value_ns: u64,
}

/// A GPU whose timestamp queries report the wall clock and become readable
/// after a configurable latency, the way real query results trail their
/// submission by several frames.
pub struct SimulatedGpu {
    stamps: Vec<Option<SimulatedStamp>>,
    result_latency: u64,
}

impl SimulatedGpu {
    pub fn new(slot_count: usize, result_latency: u64) -> Self {
        let mut stamps = Vec::with_capacity(slot_count);
        stamps.resize_with(slot_count, || None);
        Self {
            stamps,
            result_latency,
        }
    }
}

impl GpuTimestamps for SimulatedGpu {
    fn slot_count(&self) -> usize {
        self.stamps.len()
    }

    fn record_timestamp(&mut self, slot: usize) {
        let now = timing::now();
        self.stamps[slot] = Some(SimulatedStamp {
            ready_at: now + self.result_latency,
            // Ticks are nanoseconds, so the GPU clock can share the timeline
            value_ns: now,
        });
    }

    fn is_ready(&mut self, slot: usize) -> Result<bool, PlatformError> {
        match &self.stamps[slot] {
            Some(stamp) => Ok(timing::now() >= stamp.ready_at),
            None => Err(PlatformError::QueryResultLost),
        }
    }

    fn timestamp_ns(&mut self, slot: usize) -> Result<u64, PlatformError> {
        match self.stamps[slot].take() {
            Some(stamp) => Ok(stamp.value_ns),
            None => Err(PlatformError::QueryResultLost),
        }
    }

    fn flush(&mut self) {}
}

/// Presents to the simulated display. With `block_for_vblank` it behaves like
/// a double-buffered vsync swapchain and stalls until the next sync.
pub struct SimulatedPresenter {
    display: SimulatedDisplay,
    block_for_vblank: bool,

    /// Instant of the most recent swap
    pub last_swap: Tick,
}

impl SimulatedPresenter {
    pub fn new(display: SimulatedDisplay, block_for_vblank: bool) -> Self {
        Self {
            display,
            block_for_vblank,
            last_swap: 0,
        }
    }
}

impl Presenter for SimulatedPresenter {
    fn swap_buffers(&mut self) {
        if self.block_for_vblank {
            let now = timing::now();
            timing::accurate_sleep_until(self.display.next_vblank_after(now), now);
        }
        self.last_swap = timing::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn display() -> SimulatedDisplay {
        // 20_000 ticks per line over 1000 lines: 50 Hz
        SimulatedDisplay::new(1_000_000, 20_000, ScanoutGeometry::new(1_000, 950, 40))
    }

    #[test]
    fn scanline_tracks_the_raster() {
        let display = display();

        assert_eq!(display.scanline_at(1_000_000).line, 0);
        assert_eq!(display.scanline_at(1_000_000 + 19_999).line, 0);
        assert_eq!(display.scanline_at(1_000_000 + 20_000).line, 1);
        assert_eq!(display.scanline_at(1_000_000 + 500 * 20_000).line, 500);

        // Wraps to the next cycle
        let period = display.period_ticks();
        assert_eq!(display.scanline_at(1_000_000 + period + 20_000).line, 1);
    }

    #[test]
    fn vblank_flag_covers_the_blanking_lines() {
        let display = display();

        assert!(display.scanline_at(1_000_000).in_vblank);
        assert!(display.scanline_at(1_000_000 + 39 * 20_000).in_vblank);
        assert!(!display.scanline_at(1_000_000 + 40 * 20_000).in_vblank);
        assert!(!display.scanline_at(1_000_000 + 999 * 20_000).in_vblank);
    }

    #[test]
    fn next_vblank_is_strictly_in_the_future() {
        let display = display();
        let period = display.period_ticks();

        assert_eq!(display.next_vblank_after(1_000_000), 1_000_000 + period);
        assert_eq!(display.next_vblank_after(1_000_001), 1_000_000 + period);
        assert_eq!(
            display.next_vblank_after(1_000_000 + period - 1),
            1_000_000 + period
        );
        assert_eq!(
            display.next_vblank_after(1_000_000 + period),
            1_000_000 + 2 * period
        );
    }

    #[test]
    fn refresh_rate_rounds_to_claimed_hz() {
        assert_eq!(display().refresh_rate(), 50);
        assert_eq!(SimulatedDisplay::with_refresh_rate(0, 60).refresh_rate(), 60);
    }

    #[test]
    fn gpu_results_arrive_after_the_latency() {
        let mut gpu = SimulatedGpu::new(4, 0);
        gpu.record_timestamp(0);
        assert!(gpu.is_ready(0).unwrap());
        let stamp = gpu.timestamp_ns(0).unwrap();
        assert!(stamp > 0);

        // Taken results are lost on a second read
        assert!(gpu.timestamp_ns(0).is_err());
    }

    #[test]
    fn unrecorded_slot_reports_lost_result() {
        let mut gpu = SimulatedGpu::new(4, 0);
        assert!(gpu.is_ready(1).is_err());
        assert!(gpu.timestamp_ns(1).is_err());
    }
}
