use thiserror::Error;

/// Errors surfaced by the platform adapters. Every one of these is recoverable:
/// the estimators restart and the scheduler falls back to spam-swapping until
/// fresh samples arrive.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The blocking vblank wait returned an error, usually a hint that the
    /// system slept or the display went away
    #[error("vblank wait failed")]
    VblankWaitFailed,

    /// The raster position counter could not be read
    #[error("scanline counter unavailable")]
    ScanlineUnavailable,

    /// The driver reported a failure retrieving a GPU timestamp query
    #[error("GPU query result lost")]
    QueryResultLost,
}

/// A raster position report. `line` is the scanline being swept at the moment
/// of the call; `in_vblank` is whether that line is inside the blanking
/// interval.
#[derive(Clone, Copy, Debug)]
pub struct ScanlineSample {
    pub line: u32,
    pub in_vblank: bool,
}

/// Vertical geometry of the scanout cycle, supplied by the platform at startup.
#[derive(Clone, Copy, Debug)]
pub struct ScanoutGeometry {
    /// Total scanlines per refresh, including the blanking interval (e.g. 1125)
    pub total_scanlines: u32,

    /// Scanlines that carry visible image (e.g. 1080)
    pub active_scanlines: u32,

    /// total - active
    pub porch_scanlines: u32,

    /// Scanlines between the sync pulse and the first displayed line
    /// (VBI + back porch). At least 1.
    pub sync_to_first_active: u32,
}

impl ScanoutGeometry {
    pub fn new(total_scanlines: u32, active_scanlines: u32, sync_to_first_active: u32) -> Self {
        Self {
            total_scanlines,
            active_scanlines,
            porch_scanlines: total_scanlines - active_scanlines,
            sync_to_first_active,
        }
    }
}

/// Blocks until the display's next vblank. Driven in a loop by the heartbeat
/// thread when the pivot-hull estimator is active.
pub trait VblankWaiter: Send {
    fn wait_for_vblank(&self) -> Result<(), PlatformError>;
}

/// Reads the current raster position. Sampled once per frame by the render
/// thread when the scanline estimator is active.
pub trait ScanlineSource {
    fn scanline(&mut self) -> Result<ScanlineSample, PlatformError>;
}

/// GPU timestamp queries, addressed by integer slot. Handles are created once
/// at startup and reused for the program's lifetime; creating and destroying
/// queries mid-run is expensive enough to perturb frame cadence.
pub trait GpuTimestamps {
    /// Number of slots available. The query ring never addresses past this.
    fn slot_count(&self) -> usize;

    /// Record the GPU's clock into `slot` at this point in the command stream
    fn record_timestamp(&mut self, slot: usize);

    /// Whether the result for `slot` has landed
    fn is_ready(&mut self, slot: usize) -> Result<bool, PlatformError>;

    /// The recorded timestamp in nanoseconds of GPU wall clock
    fn timestamp_ns(&mut self, slot: usize) -> Result<u64, PlatformError>;

    /// Force submission of pending commands so a timestamp cannot be deferred
    /// into the next vblank
    fn flush(&mut self);
}

/// Presents the back buffer.
pub trait Presenter {
    fn swap_buffers(&mut self);
}

/// Refines `sync_to_first_active` by watching scanline reports. Some platforms
/// report geometry that disagrees with where the counter actually flips out of
/// the blanking interval, so the boundary is narrowed from both sides as
/// samples come in.
pub struct ScanlineBoundaryTracker {
    /// Lowest line ever reported with `in_vblank == false`
    first_line_in_display: Option<u32>,

    /// Highest line reported with `in_vblank == true` below the display start.
    /// The first line of the cycle is always sync, so this starts at 0.
    last_line_before_display: u32,
}

impl ScanlineBoundaryTracker {
    pub fn new() -> Self {
        Self {
            first_line_in_display: None,
            last_line_before_display: 0,
        }
    }

    pub fn observe(&mut self, sample: ScanlineSample, geometry: &mut ScanoutGeometry) {
        if let Some(first) = self.first_line_in_display {
            // Converged: the boundary is pinned between adjacent lines
            if first == self.last_line_before_display + 1 {
                return;
            }
        }

        if sample.in_vblank {
            let below_display = self
                .first_line_in_display
                .is_none_or(|first| sample.line < first);
            if sample.line > self.last_line_before_display && below_display {
                self.last_line_before_display = sample.line;
                geometry.sync_to_first_active = self.last_line_before_display + 1;
            }
        } else if self
            .first_line_in_display
            .is_none_or(|first| sample.line < first)
        {
            self.first_line_in_display = Some(sample.line);
        }
    }
}
