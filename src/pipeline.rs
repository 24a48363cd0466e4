//! # Pipeline Coordinator
//!
//! Wires the two execution contexts together and owns their lifecycle.
//!
//! - **Acquisition** runs [`ModeSupervisor`] on its own thread.
//! - **Output** is the caller's thread: [`PipelineCoordinator::run_output_frame`]
//!   renders the frame buffer once, follows profile changes and watches the
//!   input for signal loss.
//!
//! The contexts share the [`FrameBuffer`] and a [`SharedTiming`] handle. A
//! profile change is published as one swap of an immutable value, so the
//! output side never sees a half-updated profile; it may render one frame
//! with stale geometry, which is harmless.
//!
//! When the input appears or disappears the acquisition context is restarted
//! rather than reset in place: its abort token is raised, the thread returns
//! its I/O, every slot it claimed is released, and a fresh run starts in the
//! matching mode.

use crate::config_store::{ConfigStore, OutputLockout, SharedStore};
use crate::frame_buffer::FrameBuffer;
use crate::hardware::{
    AbortToken, HardwareError, NoSignalWatch, ProgramConfig, SamplerBackend, SamplerProgram,
    OUTPUT_BLOCK,
};
use crate::program_loader::{ClaimedSlot, ProgramLoader};
use crate::supervisor::{
    ModeSupervisor, StartOptions, SupervisorContext, SupervisorIo, SupervisorSettings,
};
use crate::timings::{default_profile, TimingProfile};
use log::{debug, info, warn};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use thiserror::Error;

/// Output frames between two looks at the no-signal watch.
pub const NO_SIGNAL_CHECK_FRAMES: u64 = 2;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Sampler setup failed; fatal when it is slot exhaustion.
    #[error(transparent)]
    Hardware(#[from] HardwareError),

    /// The acquisition thread panicked and took its I/O with it.
    #[error("acquisition context panicked")]
    AcquisitionPanicked,

    /// Restart or shutdown requested while no acquisition context runs.
    #[error("acquisition context is not running")]
    NotRunning,
}

#[derive(Debug)]
struct Published {
    profile: Arc<TimingProfile>,
    generation: u64,
}

/// The active timing profile, as seen by both contexts.
#[derive(Clone, Debug)]
pub struct SharedTiming {
    inner: Arc<RwLock<Published>>,
}

impl SharedTiming {
    pub fn new(profile: TimingProfile) -> Self {
        SharedTiming {
            inner: Arc::new(RwLock::new(Published {
                profile: Arc::new(profile),
                generation: 0,
            })),
        }
    }

    pub fn current(&self) -> Arc<TimingProfile> {
        self.snapshot().1
    }

    /// Bumped on every publish.
    pub fn generation(&self) -> u64 {
        self.snapshot().0
    }

    /// Generation and profile, read together.
    pub fn snapshot(&self) -> (u64, Arc<TimingProfile>) {
        let published = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        (published.generation, Arc::clone(&published.profile))
    }

    /// Replaces the active profile as a whole.
    pub fn publish(&self, profile: TimingProfile) {
        let mut published = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        published.profile = Arc::new(profile);
        published.generation += 1;
    }
}

/// Consumer of the frame buffer on the output side.
pub trait OutputRenderer: Send {
    /// The buffer layout changed; called before the next `render_frame`.
    fn set_geometry(&mut self, _profile: &TimingProfile) {}

    fn render_frame(&mut self, buffer: &FrameBuffer, profile: &TimingProfile);
}

/// Everything the coordinator wires together.
pub struct PipelineParts {
    /// Shared with the overlay, which draws into it.
    pub buffer: Arc<FrameBuffer>,
    pub backend: Box<dyn SamplerBackend>,
    pub store: Box<dyn ConfigStore>,
    pub watch: Arc<dyn NoSignalWatch>,
    pub io: SupervisorIo,
    pub renderer: Box<dyn OutputRenderer>,
    pub settings: SupervisorSettings,
}

struct Acquisition {
    abort: AbortToken,
    handle: JoinHandle<SupervisorIo>,
}

/// Owns both execution contexts.
pub struct PipelineCoordinator {
    ctx: SupervisorContext,
    lockout: Arc<OutputLockout>,
    watch: Arc<dyn NoSignalWatch>,
    renderer: Box<dyn OutputRenderer>,
    output: ClaimedSlot,
    acquisition: Option<Acquisition>,
    no_signal: bool,
    rendered: Option<(u64, TimingProfile)>,
    frame: u64,
    restarts: u32,
}

impl PipelineCoordinator {
    /// Builds the shared services and starts the first acquisition run.
    /// `reset_to_defaults` only applies to this first run.
    pub fn start(parts: PipelineParts, reset_to_defaults: bool) -> Result<Self, PipelineError> {
        let lockout = Arc::new(OutputLockout::new());
        let loader = Arc::new(ProgramLoader::new(parts.backend));
        let ctx = SupervisorContext {
            loader: Arc::clone(&loader),
            store: Arc::new(SharedStore::new(parts.store, Arc::clone(&lockout))),
            buffer: parts.buffer,
            timing: SharedTiming::new(*default_profile()),
            settings: parts.settings,
        };
        let output = loader.claim(OUTPUT_BLOCK)?;

        let no_signal = !parts.watch.signal_present();
        let mut coordinator = PipelineCoordinator {
            ctx,
            lockout,
            watch: parts.watch,
            renderer: parts.renderer,
            output,
            acquisition: None,
            no_signal,
            rendered: None,
            frame: 0,
            restarts: 0,
        };
        coordinator.spawn_acquisition(
            parts.io,
            StartOptions {
                no_signal,
                reset_to_defaults,
            },
        )?;
        coordinator.lockout.register_victim();
        Ok(coordinator)
    }

    pub fn timing(&self) -> &SharedTiming {
        &self.ctx.timing
    }

    pub fn buffer(&self) -> &Arc<FrameBuffer> {
        &self.ctx.buffer
    }

    pub fn store(&self) -> &Arc<SharedStore> {
        &self.ctx.store
    }

    pub fn is_no_signal(&self) -> bool {
        self.no_signal
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Output frames rendered so far.
    pub fn frames(&self) -> u64 {
        self.frame
    }

    fn spawn_acquisition(
        &mut self,
        io: SupervisorIo,
        options: StartOptions,
    ) -> Result<(), PipelineError> {
        let abort = AbortToken::new();
        let supervisor = ModeSupervisor::start(self.ctx.clone(), io, abort.clone(), options)?;
        let handle = thread::spawn(move || supervisor.run());
        self.acquisition = Some(Acquisition { abort, handle });
        Ok(())
    }

    /// Aborts the acquisition run and takes its I/O back. The output side
    /// stops counting as a lockout victim until the next run is up, so a
    /// store write in flight, or one made while the next run starts on this
    /// thread, never waits for it.
    fn stop_acquisition(&mut self) -> Result<SupervisorIo, PipelineError> {
        let run = self.acquisition.take().ok_or(PipelineError::NotRunning)?;
        run.abort.raise();
        self.lockout.release_victim();
        run.handle
            .join()
            .map_err(|_| PipelineError::AcquisitionPanicked)
    }

    /// Restarts acquisition in the mode matching the current input.
    pub fn restart(&mut self) -> Result<(), PipelineError> {
        let io = self.stop_acquisition()?;
        self.restarts += 1;
        info!(
            "Restarting acquisition ({})",
            if self.no_signal { "no signal" } else { "signal present" }
        );
        self.spawn_acquisition(
            io,
            StartOptions {
                no_signal: self.no_signal,
                reset_to_defaults: false,
            },
        )?;
        self.lockout.register_victim();
        Ok(())
    }

    /// One output frame.
    pub fn run_output_frame(&mut self) -> Result<(), PipelineError> {
        self.lockout.park_point();

        let (generation, profile) = self.ctx.timing.snapshot();
        let stale = self.rendered.map(|(g, _)| g) != Some(generation);
        if stale {
            let relayout = self
                .rendered
                .map_or(true, |(_, prev)| !prev.same_geometry(&profile));
            if relayout {
                debug!("Output geometry now {}", profile.summary());
                self.output.load(
                    SamplerProgram::Output {
                        format: profile.format,
                    },
                    &ProgramConfig::default(),
                )?;
                self.renderer.set_geometry(&profile);
            }
            self.rendered = Some((generation, *profile));
        }
        self.renderer.render_frame(&self.ctx.buffer, &profile);

        self.frame += 1;
        if self.frame % NO_SIGNAL_CHECK_FRAMES == 0 {
            let present = self.watch.signal_present();
            if present == self.no_signal {
                self.no_signal = !present;
                if present {
                    info!("Input signal detected");
                } else {
                    warn!("Input signal lost");
                }
                self.restart()?;
            }
        }
        Ok(())
    }

    /// Stops acquisition and hands its I/O back.
    pub fn shutdown(mut self) -> Result<SupervisorIo, PipelineError> {
        let io = self.stop_acquisition()?;
        info!(
            "Pipeline stopped after {} output frames, {} restarts",
            self.frame, self.restarts
        );
        Ok(io)
    }
}

impl Drop for PipelineCoordinator {
    fn drop(&mut self) {
        if let Some(run) = self.acquisition.take() {
            run.abort.raise();
            self.lockout.release_victim();
            if run.handle.join().is_err() {
                warn!("Acquisition context panicked during shutdown");
            }
        }
    }
}
