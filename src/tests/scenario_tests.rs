//! # Capture Pipeline Scenarios
//!
//! Each test builds the full pipeline the binary builds (simulated sampler,
//! synthetic TTL source, file-backed store) and drives the output loop until
//! the acquisition context reaches the state under test. Deadlines are
//! generous; a scenario that never converges fails instead of hanging.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use ttl_reader_lib::{
    border::BorderOffsets,
    config_store::{ConfigStore, FileStore, StoredSettings},
    frame_buffer::FrameBuffer,
    input::NoButtons,
    overlay::RecordingOverlay,
    pipeline::{OutputRenderer, PipelineCoordinator, PipelineParts},
    preview::draw_ascii,
    sim::{SamplerLog, SimBackend, SimSignal, SimSwitch},
    supervisor::{SupervisorIo, SupervisorSettings},
    timings::{preset, TimingProfile},
    VideoFormat,
};

const HW: u32 = 270_000_000;

struct Discard;

impl OutputRenderer for Discard {
    fn render_frame(&mut self, _buffer: &FrameBuffer, _profile: &TimingProfile) {}
}

fn source(name: &str) -> TimingProfile {
    *preset(name).expect("known preset")
}

fn start(
    source: TimingProfile,
    switch: &SimSwitch,
    store_path: &Path,
    reset: bool,
) -> (PipelineCoordinator, SamplerLog) {
    let backend = SimBackend::new();
    let samplers = backend.log();
    let parts = PipelineParts {
        buffer: Arc::new(FrameBuffer::new()),
        backend: Box::new(backend),
        store: Box::new(FileStore::new(store_path)),
        watch: Arc::new(switch.clone()),
        io: SupervisorIo {
            port: Box::new(SimSignal::new(source, HW, switch.clone())),
            buttons: Box::new(NoButtons),
            overlay: Box::new(RecordingOverlay::new()),
        },
        renderer: Box::new(Discard),
        settings: SupervisorSettings {
            hardware_hz: HW,
            auto_adjust_always_on: false,
            idle_pause: Duration::from_millis(1),
        },
    };
    let pipeline = PipelineCoordinator::start(parts, reset).expect("pipeline starts");
    (pipeline, samplers)
}

fn run_until<F: Fn(&PipelineCoordinator) -> bool>(p: &mut PipelineCoordinator, done: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(60);
    while Instant::now() < deadline {
        p.run_output_frame().expect("output frame");
        if done(p) {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

/// Settings currently in the store file; `None` while a write is in flight.
fn stored(path: &Path) -> Option<StoredSettings> {
    let block = FileStore::new(path).load().ok()?;
    Some(StoredSettings::from_block(&block))
}

/// The EGA 350-line mode is found, its border is measured and the result
/// survives in the store file for the next power-up.
#[test]
fn ega_border_is_measured_and_written_to_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.json");
    let switch = SimSwitch::new(true);
    let (mut pipeline, _) = start(source("EGA 640x350@60Hz"), &switch, &path, false);

    let found = run_until(&mut pipeline, |p| {
        p.timing().current().name == "EGA 640x350@60Hz"
    });
    assert!(found, "EGA mode should be detected");
    let saved = run_until(&mut pipeline, |_| {
        stored(&path).map_or(false, |s| s.active().border[VideoFormat::Ega.index()].is_some())
    });
    assert!(saved, "border commit should reach the store file");
    pipeline.shutdown().expect("clean shutdown");

    let border = stored(&path).expect("store readable").active().border[VideoFormat::Ega.index()];
    assert_eq!(
        border,
        Some(BorderOffsets::new(28, 4)),
        "measured border should equal the preset's porches"
    );
}

/// Unplugging and replugging the cable restarts acquisition each time
/// without leaking sampler slots.
#[test]
fn cable_cycles_do_not_leak_slots() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.json");
    let switch = SimSwitch::new(false);
    let (mut pipeline, samplers) = start(source("CGA 640x200@60Hz"), &switch, &path, false);
    assert!(pipeline.is_no_signal(), "starts without input");

    for cycle in 0..2 {
        switch.set_connected(true);
        assert!(
            run_until(&mut pipeline, |p| !p.is_no_signal()),
            "signal noticed in cycle {}",
            cycle
        );
        switch.set_connected(false);
        assert!(
            run_until(&mut pipeline, |p| p.is_no_signal()),
            "loss noticed in cycle {}",
            cycle
        );
        let claimed = samplers.snapshot().claimed_count();
        assert!(
            claimed <= 5,
            "four acquisition slots plus one output slot at most, got {}",
            claimed
        );
    }
    assert_eq!(pipeline.restarts(), 4);
    drop(pipeline);
    assert_eq!(samplers.snapshot().claimed_count(), 0, "every slot released");
}

/// The no-signal placeholder is visible in the preview until a source
/// appears, after which captured MDA video replaces it.
#[test]
fn preview_shows_placeholder_then_mda_video() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.json");
    let switch = SimSwitch::new(false);
    let (mut pipeline, _) = start(source("MDA 720x350@50Hz"), &switch, &path, false);

    let placeholder = run_until(&mut pipeline, |p| {
        draw_ascii(p.buffer(), &p.timing().current()).contains('@')
    });
    assert!(placeholder, "colour bars should show while nothing is plugged in");

    switch.set_connected(true);
    let detected = run_until(&mut pipeline, |p| {
        p.timing().current().format == VideoFormat::Mda
    });
    assert!(detected, "MDA mode should be detected");
    let profile = *pipeline.timing().current();
    let lit = run_until(&mut pipeline, |p| {
        (0..profile.vertical.visible as usize).any(|y| p.buffer().mono_pixel(y, 100) != 0)
    });
    assert!(lit, "captured MDA pixels should land in the buffer");
}

/// Holding both buttons at power-up (or the equivalent flag) wipes the
/// stored banks before anything else runs.
#[test]
fn reset_at_start_discards_stored_banks() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.json");
    let mut custom = StoredSettings {
        active_bank: 2,
        ..StoredSettings::default()
    };
    custom.banks[2].pixel_clock_hz[VideoFormat::Cga.index()] = 14_400_000;
    FileStore::new(&path)
        .store(&custom.to_block())
        .expect("seed store");

    let switch = SimSwitch::new(true);
    let (mut pipeline, _) = start(source("CGA 640x200@60Hz"), &switch, &path, true);
    pipeline.run_output_frame().expect("output frame");
    pipeline.shutdown().expect("clean shutdown");

    let after = stored(&path).expect("store readable");
    assert_eq!(after.active_bank, 0, "bank selection reset");
    assert_ne!(
        after.banks[2].pixel_clock_hz[VideoFormat::Cga.index()],
        14_400_000,
        "custom pixel clock discarded"
    );
    assert_eq!(after.banks[2], StoredSettings::default().banks[2]);
}
