//! # TTL Reader Application Entry Point
//!
//! Runs the capture pipeline against the synthetic TTL source in `sim`, so the
//! whole engine (detection, calibration, border adjust, persistence, restarts
//! on cable plug/unplug) can be exercised on a desktop. Board builds enable the
//! `hardware` feature and wire `hal_port` adapters in place of the simulator.
//!
//! Flags:
//! - `--stdout`: print an ASCII preview of the frame buffer
//! - `--reset-defaults`: start as if both buttons were held at power-up

#[cfg(test)]
mod tests;

use anyhow::Context;
use std::env;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use ttl_reader_lib::{
    config::Config,
    config_store::FileStore,
    frame_buffer::FrameBuffer,
    input::{ButtonInput, NoButtons},
    overlay::FrameBufferOverlay,
    pipeline::{PipelineCoordinator, PipelineParts},
    preview::PreviewRenderer,
    sim::{SimBackend, SimSignal, SimSwitch},
    supervisor::{SupervisorIo, SupervisorSettings},
    timings::{default_profile, preset},
};

/// Output frame period of the development loop.
const OUTPUT_FRAME: Duration = Duration::from_micros(16_667);

fn main() -> anyhow::Result<()> {
    env_logger::init();

    // Development mode: render to stdout for testing without hardware
    let development_mode = env::args().any(|arg| arg == "--stdout");
    let reset_flag = env::args().any(|arg| arg == "--reset-defaults");

    let config = Config::load();
    let sim = &config.simulation;
    let source = match preset(&sim.preset) {
        Some(profile) => *profile,
        None => {
            log::warn!("Unknown preset {:?}, simulating the default mode", sim.preset);
            *default_profile()
        }
    };

    let switch = SimSwitch::new(sim.connect_after_frames == 0);
    let buffer = Arc::new(FrameBuffer::new());
    let mut buttons = NoButtons;
    let reset_to_defaults = reset_flag || buttons.both_held();

    let renderer = if development_mode {
        PreviewRenderer::stdout(sim.preview_every)
    } else {
        PreviewRenderer::new(Box::new(std::io::sink()), sim.preview_every)
    };

    let parts = PipelineParts {
        buffer: Arc::clone(&buffer),
        backend: Box::new(SimBackend::new()),
        store: Box::new(FileStore::new(&config.capture.store_path)),
        watch: Arc::new(switch.clone()),
        io: SupervisorIo {
            port: Box::new(SimSignal::new(
                source,
                config.hardware.system_clock_hz,
                switch.clone(),
            )),
            buttons: Box::new(buttons),
            overlay: Box::new(FrameBufferOverlay::new(buffer, default_profile())),
        },
        renderer: Box::new(renderer),
        settings: SupervisorSettings {
            hardware_hz: config.hardware.system_clock_hz,
            auto_adjust_always_on: config.capture.auto_adjust_always_on,
            idle_pause: config.capture.idle_pause(),
        },
    };

    eprintln!("Simulating {} ({})", source.name, source.summary());
    // Slot exhaustion lands here and is fatal.
    let mut pipeline =
        PipelineCoordinator::start(parts, reset_to_defaults).context("starting capture pipeline")?;

    let mut frame = 0u64;
    while sim.frames == 0 || frame < sim.frames {
        if frame == sim.connect_after_frames && !switch.is_connected() {
            eprintln!("Plugging in the synthetic source");
            switch.set_connected(true);
        }
        pipeline.run_output_frame()?;
        thread::sleep(OUTPUT_FRAME);
        frame += 1;
    }

    let profile = pipeline.timing().current();
    eprintln!(
        "Stopped after {} frames: {} ({} restarts)",
        pipeline.frames(),
        profile.name,
        pipeline.restarts()
    );
    pipeline.shutdown()?;
    Ok(())
}
