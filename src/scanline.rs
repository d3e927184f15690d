use crate::{
    estimate::SharedVblankEstimate,
    timing::{TICKS_PER_SEC, Tick},
};

/// Number of samples kept. Updates are O(1), so the only cost of a bigger
/// window is space.
const MAX_SIZE: u32 = 64;

/// Estimates vblank phase and period from (timestamp, scanline) pairs sampled
/// at arbitrary moments in the render thread.
///
/// Unlike the one-per-vblank wake-up samples, scanline reads are cheap, can be
/// taken every frame, and carry symmetric per-scanline quantization noise, so
/// many samples are fused by least squares instead of a hull fit. Scanlines
/// are unwrapped across frames (u = frame * total_scanlines + scanline) and a
/// line t = k*u + b is fitted with running sums maintained on insert and
/// evict.
///
/// The running sums deliberately wrap mod 2^64: the regression coefficients
/// are differences of sum products, and the wrapped differences equal the true
/// ones as long as no true intermediate value overflows the signed 64-bit
/// range across the 64-sample window.
pub struct ScanlineEstimator {
    timepoints: [Tick; MAX_SIZE as usize],
    scanlines: [u32; MAX_SIZE as usize],
    frames: [u32; MAX_SIZE as usize],

    /// Elements live at [index_begin, index_end), free-running
    index_begin: u32,
    index_end: u32,

    sum_timepoints: u64,
    /// Sum of unwrapped scanlines
    sum_scanlines: u64,
    /// Sum of timepoint * unwrapped scanline
    sum_timepoint_scanline: u64,
    /// Sum of squared unwrapped scanlines
    sum_scanline_scanline: u64,

    /// The system-claimed refresh rate, used only to unwrap frame numbers and
    /// as the fallback period before enough samples exist
    monitor_hz: u32,
    total_scanlines: u32,

    shared: SharedVblankEstimate,
}

impl ScanlineEstimator {
    pub fn new(monitor_hz: u32, total_scanlines: u32, shared: SharedVblankEstimate) -> Self {
        Self {
            timepoints: [0; MAX_SIZE as usize],
            scanlines: [0; MAX_SIZE as usize],
            frames: [0; MAX_SIZE as usize],
            index_begin: 0,
            index_end: 0,
            sum_timepoints: 0,
            sum_scanlines: 0,
            sum_timepoint_scanline: 0,
            sum_scanline_scanline: 0,
            monitor_hz,
            total_scanlines,
            shared,
        }
    }

    pub fn elements(&self) -> u32 {
        self.index_end.wrapping_sub(self.index_begin)
    }

    fn slot(x: u32) -> usize {
        (x % MAX_SIZE) as usize
    }

    fn unwrapped_scanline(&self, x: u32) -> u64 {
        (self.frames[Self::slot(x)] as u64)
            .wrapping_mul(self.total_scanlines as u64)
            .wrapping_add(self.scanlines[Self::slot(x)] as u64)
    }

    /// Feed one raster sample taken at `timepoint`. `scanline` must be in
    /// [0, total_scanlines).
    pub fn feed(&mut self, timepoint: Tick, scanline: u32) {
        if self.elements() == MAX_SIZE {
            let begin = self.index_begin;
            let unwrapped = self.unwrapped_scanline(begin);
            let old_timepoint = self.timepoints[Self::slot(begin)];
            self.sum_timepoints = self.sum_timepoints.wrapping_sub(old_timepoint);
            self.sum_scanlines = self.sum_scanlines.wrapping_sub(unwrapped);
            self.sum_timepoint_scanline = self
                .sum_timepoint_scanline
                .wrapping_sub(old_timepoint.wrapping_mul(unwrapped));
            self.sum_scanline_scanline = self
                .sum_scanline_scanline
                .wrapping_sub(unwrapped.wrapping_mul(unwrapped));
            self.index_begin = self.index_begin.wrapping_add(1);
        }

        let frame = if self.elements() == 0 {
            0
        } else {
            // Benchmark off the previous sample: how many whole frames passed,
            // judging the elapsed ticks against the claimed refresh rate and
            // discounting the scanline movement within a frame
            let previous = self.index_end.wrapping_sub(1);
            let elapsed = timepoint.wrapping_sub(self.timepoints[Self::slot(previous)]) as i64;
            let frame_advance =
                elapsed as f64 * self.monitor_hz as f64 / TICKS_PER_SEC as f64;
            let scanline_diff = scanline as i64 - self.scanlines[Self::slot(previous)] as i64;
            let advanced_frames =
                (frame_advance - scanline_diff as f64 / self.total_scanlines as f64).round();
            self.frames[Self::slot(previous)].wrapping_add(advanced_frames as i64 as u32)
        };

        self.timepoints[Self::slot(self.index_end)] = timepoint;
        self.scanlines[Self::slot(self.index_end)] = scanline;
        self.frames[Self::slot(self.index_end)] = frame;

        let unwrapped = self.unwrapped_scanline(self.index_end);
        self.sum_timepoints = self.sum_timepoints.wrapping_add(timepoint);
        self.sum_scanlines = self.sum_scanlines.wrapping_add(unwrapped);
        self.sum_timepoint_scanline = self
            .sum_timepoint_scanline
            .wrapping_add(timepoint.wrapping_mul(unwrapped));
        self.sum_scanline_scanline = self
            .sum_scanline_scanline
            .wrapping_add(unwrapped.wrapping_mul(unwrapped));
        self.index_end = self.index_end.wrapping_add(1);

        if self.elements() <= 2 {
            // Not enough points for a fit; estimate straight off this sample
            // and the claimed refresh rate
            let period = TICKS_PER_SEC as f64 / self.monitor_hz as f64;
            let into_frame = TICKS_PER_SEC.wrapping_mul(scanline as u64)
                / (self.total_scanlines as u64 * self.monitor_hz as u64);
            let phase = timepoint.wrapping_sub(into_frame);
            self.shared.publish(phase, period);
            return;
        }

        self.linear_regression();
    }

    fn linear_regression(&mut self) {
        let n = self.elements() as u64;

        // slope = (n sum(t*u) - sum_t sum_u) / (n sum(u^2) - sum_u sum_u).
        // Everything is multiplied through by n so no average (and thus no
        // division, which is multivalued mod 2^64) appears inside the sums.
        let numerator = n
            .wrapping_mul(self.sum_timepoint_scanline)
            .wrapping_sub(self.sum_timepoints.wrapping_mul(self.sum_scanlines));
        let denominator = n
            .wrapping_mul(self.sum_scanline_scanline)
            .wrapping_sub(self.sum_scanlines.wrapping_mul(self.sum_scanlines));
        let ticks_per_scanline = numerator as f64 / denominator as f64;

        // Re-origin at the oldest element before dropping to floating point;
        // absolute timepoints and unwrapped scanlines are too large to keep
        // their precision through an f64
        let begin = self.index_begin;
        let begin_timepoint = self.timepoints[Self::slot(begin)];
        let begin_scanline = self.scanlines[Self::slot(begin)] as f64;
        let unwrapped_begin = self.unwrapped_scanline(begin);
        let scanline_average = self
            .sum_scanlines
            .wrapping_sub(n.wrapping_mul(unwrapped_begin)) as f64
            / n as f64;
        let timepoint_average = self
            .sum_timepoints
            .wrapping_sub(n.wrapping_mul(begin_timepoint)) as f64
            / n as f64;

        // Best guess for the vblank instant of the oldest element's frame
        let vblank_at_begin =
            timepoint_average - ticks_per_scanline * (scanline_average + begin_scanline);

        // Extrapolate one frame past the newest sample
        let frames_ahead = self
            .frames[Self::slot(self.index_end.wrapping_sub(1))]
            .wrapping_sub(self.frames[Self::slot(begin)])
            .wrapping_add(1) as f64;
        let extrapolation = frames_ahead * self.total_scanlines as f64 * ticks_per_scanline;

        // The counter reports N throughout the interval [N, N+1), so the
        // average report is half a scanline behind the true raster position
        let floor_adjustment = -0.5 * ticks_per_scanline;

        let phase = begin_timepoint
            .wrapping_add((extrapolation + vblank_at_begin + floor_adjustment) as i64 as u64);
        let period = ticks_per_scanline * self.total_scanlines as f64;
        self.shared.publish(phase, period);
    }
}
