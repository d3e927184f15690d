use clap::{Parser, ValueEnum};

/// How presentation is synchronized with the display.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SyncMode {
    /// Swap as fast as the pipeline allows, no timing at all
    NoVsync,
    /// Let the swapchain block on vblank, the standard mechanism
    DoubleBufferVsync,
    /// Estimate vblank timing from a dedicated thread blocking on the
    /// platform's vblank wait
    SeparateHeartbeat,
    /// Estimate vblank timing from scanline reads taken in the render thread
    SyncInRenderThread,
}

#[derive(Parser)]
#[command(about)]
pub struct Args {
    /// How to synchronize presentation with the display
    #[arg(long, value_enum, default_value = "sync-in-render-thread")]
    pub sync_mode: SyncMode,

    /// Tearline position as a fraction of the screen, 0 at the top
    #[arg(long, default_value_t = 0.5)]
    pub tearline: f64,

    /// Refresh rate of the simulated display in Hz
    #[arg(long, default_value_t = 60)]
    pub monitor_hz: u32,

    /// Exit after this many frames instead of running until interrupted
    #[arg(long)]
    pub frames: Option<u64>,

    /// Simulated CPU cost of rendering one frame, in microseconds
    #[arg(long, default_value_t = 500)]
    pub render_us: u64,

    /// Log information about each frame to stdout
    #[arg(long, default_value_t = false)]
    pub log_frames: bool,

    /// Log sleep overrun/underrun statistics
    #[arg(long, default_value_t = false)]
    pub benchmark_sleep: bool,
}

pub struct Options {
    pub sync_mode: SyncMode,
    pub tearline_fraction: f64,
    pub frame_budget: Option<u64>,
    pub log_frames: bool,
}

impl Options {
    pub fn from_args(args: &Args) -> Self {
        Options {
            sync_mode: args.sync_mode,
            tearline_fraction: args.tearline.clamp(0.0, 1.0),
            frame_budget: args.frames,
            log_frames: args.log_frames,
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Options {
            sync_mode: SyncMode::SyncInRenderThread,
            tearline_fraction: 0.5,
            frame_budget: None,
            log_frames: false,
        }
    }
}
