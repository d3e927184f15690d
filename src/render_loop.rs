use std::sync::mpsc::{Receiver, TryRecvError};

use log::{debug, info};

use crate::{
    estimate::SharedVblankEstimate,
    frame_tracker::FrameTracker,
    gpu_timing::{FrameTiming, GpuQueryRing, QueryKind},
    options::{Options, SyncMode},
    platform::{GpuTimestamps, Presenter, ScanlineBoundaryTracker, ScanlineSource, ScanoutGeometry},
    scanline::ScanlineEstimator,
    scheduler::{FrameScheduler, SchedulerConfig},
    timing::{self, tick_before},
};

/// Seconds of slack budgeted beyond the smoothed frame time. Rendering
/// overruns its estimate now and then even on a near-empty scene.
const RENDER_OVERRUN_BUFFER: f64 = 0.0008;

/// Seconds between issuing a swap and the new image reaching the scanout.
/// GPU-dependent and tied to the GPU's power state, so this is a conservative
/// middle value rather than a measurement.
const GPU_SWAP_DELAY: f64 = 0.0007;

/// Something that draws a frame. What gets drawn is no concern of the
/// scheduling core.
pub trait Renderer {
    fn render(&mut self, tearline_fraction: f64);
}

/// Control messages from whatever owns the user interface.
pub enum Command {
    /// Move the tearline to a new screen fraction
    SetTearline(f64),
    /// Leave the render loop
    Exit,
}

/// The render thread's frame loop: estimate, plan, render, sleep, swap.
pub struct RenderLoop {
    sync_mode: SyncMode,
    tearline_fraction: f64,
    frame_budget: Option<u64>,
    log_frames: bool,

    scheduler: FrameScheduler,
    timing: FrameTiming,
    ring: GpuQueryRing,
    tracker: FrameTracker,

    estimate: SharedVblankEstimate,
    gpu: Box<dyn GpuTimestamps>,
    presenter: Box<dyn Presenter>,

    /// Scanline sampling, only in sync-in-render-thread mode
    scanline_source: Option<Box<dyn ScanlineSource>>,
    scanline_estimator: Option<ScanlineEstimator>,
    boundary_tracker: ScanlineBoundaryTracker,

    commands: Option<Receiver<Command>>,
}

pub struct RenderLoopBuilder {
    render_loop: RenderLoop,
}

impl RenderLoopBuilder {
    pub fn new(
        options: &Options,
        monitor_hz: u32,
        geometry: ScanoutGeometry,
        estimate: SharedVblankEstimate,
        gpu: Box<dyn GpuTimestamps>,
        presenter: Box<dyn Presenter>,
    ) -> Self {
        let config = SchedulerConfig {
            monitor_hz,
            geometry,
            render_overrun_buffer: RENDER_OVERRUN_BUFFER,
            gpu_swap_delay: GPU_SWAP_DELAY,
        };

        RenderLoopBuilder {
            render_loop: RenderLoop {
                sync_mode: options.sync_mode,
                tearline_fraction: options.tearline_fraction,
                frame_budget: options.frame_budget,
                log_frames: options.log_frames,
                scheduler: FrameScheduler::new(config),
                timing: FrameTiming::new(monitor_hz),
                ring: GpuQueryRing::new(),
                tracker: FrameTracker::new(timing::now()),
                estimate,
                gpu,
                presenter,
                scanline_source: None,
                scanline_estimator: None,
                boundary_tracker: ScanlineBoundaryTracker::new(),
                commands: None,
            },
        }
    }

    /// Attach the raster-position source for sync-in-render-thread mode. The
    /// matching estimator is created alongside it.
    pub fn with_scanline_source(mut self, source: Box<dyn ScanlineSource>) -> Self {
        let monitor_hz = self.render_loop.scheduler.config().monitor_hz;
        let total_scanlines = self.render_loop.scheduler.config().geometry.total_scanlines;
        self.render_loop.scanline_estimator = Some(ScanlineEstimator::new(
            monitor_hz,
            total_scanlines,
            self.render_loop.estimate.clone(),
        ));
        self.render_loop.scanline_source = Some(source);
        self
    }

    pub fn with_commands(mut self, commands: Receiver<Command>) -> Self {
        self.render_loop.commands = Some(commands);
        self
    }

    pub fn build(self) -> RenderLoop {
        self.render_loop
    }
}

impl RenderLoop {
    pub fn tracker(&self) -> &FrameTracker {
        &self.tracker
    }

    /// Run frames until the command channel says to exit, its sender goes
    /// away, or the frame budget runs out.
    pub fn run(&mut self, renderer: &mut dyn Renderer) {
        timing::raise_timer_resolution();

        let estimating = matches!(
            self.sync_mode,
            SyncMode::SeparateHeartbeat | SyncMode::SyncInRenderThread
        );
        let mut frames_left = self.frame_budget;

        'frames: loop {
            if let Some(commands) = &self.commands {
                loop {
                    match commands.try_recv() {
                        Ok(Command::SetTearline(fraction)) => {
                            self.tearline_fraction = fraction.clamp(0.0, 1.0);
                            if estimating {
                                // Input-to-photon tracing marker; retrieval
                                // discards it without touching frame timing
                                self.ring.send(QueryKind::Input, self.gpu.as_mut());
                            }
                        }
                        Ok(Command::Exit) | Err(TryRecvError::Disconnected) => break 'frames,
                        Err(TryRecvError::Empty) => break,
                    }
                }
            }

            let frame_start = timing::now();

            // In scanline mode the raster sample reuses the frame-start time,
            // pinning the read right next to its timestamp
            if let (Some(source), Some(estimator)) =
                (&mut self.scanline_source, &mut self.scanline_estimator)
            {
                match source.scanline() {
                    Ok(sample) => {
                        estimator.feed(frame_start, sample.line);
                        self.boundary_tracker
                            .observe(sample, self.scheduler.geometry_mut());
                    }
                    Err(error) => debug!("scanline read failed: {error}"),
                }
            }

            self.ring
                .drain_available(self.gpu.as_mut(), &mut self.timing);

            let estimate = self.estimate.load();
            let plan = self.scheduler.plan(
                frame_start,
                estimate,
                &self.timing,
                self.tearline_fraction,
            );

            let measure = estimating && plan.measure_gpu;
            let targets = if estimating { plan.targets } else { None };

            if measure {
                // When waiting, the render cost is measured on its own; when
                // spamming, one pair straddles render and swap together
                let start_kind = if targets.is_some() {
                    QueryKind::Render
                } else {
                    QueryKind::Both
                };
                self.ring.send(start_kind, self.gpu.as_mut());
            }

            renderer.render(self.tearline_fraction);

            match targets {
                Some(targets) => {
                    // Close the render pair before the wait. Stamping after it
                    // would fold the sleep into the measurement and long frame
                    // times would become a self-fulfilling prophecy.
                    if measure {
                        self.ring.send(QueryKind::Render, self.gpu.as_mut());
                    }

                    let after_render = timing::now();
                    if tick_before(after_render, targets.swap) {
                        timing::accurate_sleep_until(targets.swap, after_render);
                    }

                    if measure {
                        self.ring.send(QueryKind::Swap, self.gpu.as_mut());
                    }
                    self.presenter.swap_buffers();
                    if measure {
                        self.ring.send(QueryKind::Swap, self.gpu.as_mut());
                    }

                    self.tracker.record_swap(timing::now(), targets.appearance);
                }
                None => {
                    self.presenter.swap_buffers();
                    if measure {
                        self.ring.send(QueryKind::Both, self.gpu.as_mut());
                    }
                }
            }

            let frame_end = timing::now();
            self.tracker.frame_complete(frame_end);

            if self.log_frames {
                info!(
                    "[FRAME] {} fps, {:.1}% on target, render {:.2} ms, swap {:.2} ms, smoothed {:.2} ms, {:.0} us frame",
                    self.tracker.current_frame_rate(),
                    self.tracker.total_on_target_percent(),
                    self.timing.render_time * 1e3,
                    self.timing.swap_time * 1e3,
                    self.timing.frame_time_smoothed * 1e3,
                    frame_end.wrapping_sub(frame_start) as f64 / 1e3,
                );
            }

            if let Some(left) = &mut frames_left {
                *left -= 1;
                if *left == 0 {
                    break;
                }
            }
        }

        timing::restore_timer_resolution();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimulatedDisplay, SimulatedGpu, SimulatedPresenter};
    use crate::timing::now;

    struct NullRenderer;

    impl Renderer for NullRenderer {
        fn render(&mut self, _tearline_fraction: f64) {}
    }

    fn fast_display() -> SimulatedDisplay {
        // 1000 lines at 5000 ticks per line: 5 ms per refresh, keeps tests short
        SimulatedDisplay::new(now(), 5_000, ScanoutGeometry::new(1_000, 950, 41))
    }

    #[test]
    fn frame_budget_ends_the_loop() {
        let display = fast_display();
        let options = Options {
            sync_mode: SyncMode::NoVsync,
            frame_budget: Some(10),
            ..Options::default()
        };

        let mut render_loop = RenderLoopBuilder::new(
            &options,
            display.refresh_rate(),
            display.geometry(),
            SharedVblankEstimate::new(display.refresh_rate()),
            Box::new(SimulatedGpu::new(crate::gpu_timing::QUERY_RING_SIZE, 0)),
            Box::new(SimulatedPresenter::new(display, false)),
        )
        .build();

        render_loop.run(&mut NullRenderer);
    }

    #[test]
    fn exit_command_ends_the_loop() {
        let display = fast_display();
        let options = Options {
            sync_mode: SyncMode::NoVsync,
            ..Options::default()
        };

        let (sender, receiver) = std::sync::mpsc::channel();
        sender.send(Command::SetTearline(0.25)).unwrap();
        sender.send(Command::Exit).unwrap();

        let mut render_loop = RenderLoopBuilder::new(
            &options,
            display.refresh_rate(),
            display.geometry(),
            SharedVblankEstimate::new(display.refresh_rate()),
            Box::new(SimulatedGpu::new(crate::gpu_timing::QUERY_RING_SIZE, 0)),
            Box::new(SimulatedPresenter::new(display, false)),
        )
        .with_commands(receiver)
        .build();

        render_loop.run(&mut NullRenderer);
    }
}
