use std::sync::{
    Arc, mpsc,
    atomic::{AtomicBool, Ordering},
};

use anyhow::Context;
use clap::Parser;
use log::info;
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};

use tearsync::{
    estimate::SharedVblankEstimate,
    gpu_timing::QUERY_RING_SIZE,
    heartbeat::spawn_heartbeat,
    options::{Args, Options, SyncMode},
    render_loop::{Command, RenderLoopBuilder, Renderer},
    sim::{SimulatedDisplay, SimulatedGpu, SimulatedPresenter},
    timing::{self, TICKS_PER_SEC},
};

/// Stands in for a real scene: burns a fixed amount of time per frame.
struct DemoRenderer {
    cost_ticks: u64,
}

impl Renderer for DemoRenderer {
    fn render(&mut self, _tearline_fraction: f64) {
        let start = timing::now();
        timing::accurate_sleep_until(start + self.cost_ticks, start);
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.log_frames || args.benchmark_sleep {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .context("failed to initialize logging")?;
    timing::set_benchmark_sleep(args.benchmark_sleep);

    let options = Options::from_args(&args);

    // The demo drives a simulated display and GPU; real platform adapters
    // implement the same traits to drive actual hardware
    let display = SimulatedDisplay::with_refresh_rate(timing::now(), args.monitor_hz);
    let shared = SharedVblankEstimate::new(display.refresh_rate());

    info!(
        "display: {} Hz claimed, {} total scanlines, true period {:.3} ms",
        display.refresh_rate(),
        display.geometry().total_scanlines,
        display.period_ticks() as f64 / 1e6,
    );

    let stop = Arc::new(AtomicBool::new(false));
    if options.sync_mode == SyncMode::SeparateHeartbeat {
        // Detached: it parks in the blocking vblank wait and exits with the
        // process
        drop(spawn_heartbeat(
            Box::new(display),
            shared.clone(),
            stop.clone(),
        ));
    }

    // The demo has no interactive surface; a UI thread would feed tearline
    // updates through this channel
    let (_commands, command_receiver) = mpsc::channel::<Command>();

    // Query results trail by a couple of milliseconds, like a real driver
    let gpu = SimulatedGpu::new(QUERY_RING_SIZE, 2 * TICKS_PER_SEC / 1000);
    let presenter = SimulatedPresenter::new(
        display,
        options.sync_mode == SyncMode::DoubleBufferVsync,
    );

    let mut builder = RenderLoopBuilder::new(
        &options,
        display.refresh_rate(),
        display.geometry(),
        shared.clone(),
        Box::new(gpu),
        Box::new(presenter),
    )
    .with_commands(command_receiver);
    if options.sync_mode == SyncMode::SyncInRenderThread {
        builder = builder.with_scanline_source(Box::new(display));
    }
    let mut render_loop = builder.build();

    let mut renderer = DemoRenderer {
        cost_ticks: args.render_us * 1_000,
    };
    render_loop.run(&mut renderer);
    stop.store(true, Ordering::Relaxed);

    let estimate = shared.load();
    info!(
        "final estimate: period {:.3} ms; frames {:.1}% on target, average miss {:.0} us",
        estimate.period / 1e6,
        render_loop.tracker().total_on_target_percent(),
        render_loop.tracker().average_miss_us(),
    );

    Ok(())
}
