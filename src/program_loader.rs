//! # Sampling Program Loader
//!
//! Both execution contexts reprogram the sampler: acquisition on every mode
//! switch, output whenever the render geometry changes. The loader is the one
//! service object through which they do it. It holds the backend behind a
//! mutex (the critical section), remembers which program sits in each slot,
//! and always tears the old program down before installing a new one.

use crate::hardware::{HardwareError, ProgramConfig, SamplerBackend, SamplerProgram, SlotId};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct LoaderInner {
    backend: Box<dyn SamplerBackend>,
    loaded: BTreeMap<SlotId, SamplerProgram>,
}

impl LoaderInner {
    /// Stops the slot, empties its FIFO and removes its program.
    fn teardown(&mut self, slot: SlotId) {
        self.backend.set_enabled(slot, false);
        self.backend.drain(slot);
        if let Some(old) = self.loaded.remove(&slot) {
            debug!("Removing {} from slot {}", old.name(), slot);
            self.backend.remove(slot);
        }
    }
}

/// Shared, serialized access to the sampler control plane.
pub struct ProgramLoader {
    inner: Mutex<LoaderInner>,
}

impl ProgramLoader {
    pub fn new(backend: Box<dyn SamplerBackend>) -> Self {
        ProgramLoader {
            inner: Mutex::new(LoaderInner {
                backend,
                loaded: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoaderInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserves a slot for the lifetime of the returned handle.
    pub fn claim(self: &Arc<Self>, block: usize) -> Result<ClaimedSlot, HardwareError> {
        let id = self.lock().backend.claim(block)?;
        debug!("Claimed sampler slot {}", id);
        Ok(ClaimedSlot {
            loader: Arc::clone(self),
            id,
        })
    }

    /// Replaces whatever runs in `slot` with `program`: disable, drain,
    /// remove, install, enable. All of it happens inside the critical section.
    pub fn load(
        &self,
        slot: SlotId,
        program: SamplerProgram,
        config: &ProgramConfig,
    ) -> Result<(), HardwareError> {
        let mut inner = self.lock();
        inner.teardown(slot);
        inner.backend.install(slot, &program, config)?;
        inner.loaded.insert(slot, program);
        inner.backend.set_enabled(slot, true);
        debug!(
            "Loaded {} into slot {} (div {})",
            program.name(),
            slot,
            config.divider
        );
        Ok(())
    }

    /// Stops and removes the programs of every listed slot.
    pub fn unload_all(&self, slots: &[SlotId]) {
        let mut inner = self.lock();
        for &slot in slots {
            inner.teardown(slot);
        }
    }

    /// Program currently installed in `slot`.
    pub fn loaded(&self, slot: SlotId) -> Option<SamplerProgram> {
        self.lock().loaded.get(&slot).copied()
    }

    fn release(&self, slot: SlotId) {
        let mut inner = self.lock();
        inner.teardown(slot);
        inner.backend.unclaim(slot);
        debug!("Released sampler slot {}", slot);
    }
}

/// A claimed slot. Dropping it unloads the program and frees the slot, so a
/// restarted context always starts from clean hardware.
pub struct ClaimedSlot {
    loader: Arc<ProgramLoader>,
    id: SlotId,
}

impl ClaimedSlot {
    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn load(&self, program: SamplerProgram, config: &ProgramConfig) -> Result<(), HardwareError> {
        self.loader.load(self.id, program, config).map_err(|e| {
            warn!("Loading {} failed: {}", program.name(), e);
            e
        })
    }

    pub fn unload(&self) {
        self.loader.unload_all(&[self.id]);
    }

    pub fn loaded(&self) -> Option<SamplerProgram> {
        self.loader.loaded(self.id)
    }
}

impl Drop for ClaimedSlot {
    fn drop(&mut self) {
        self.loader.release(self.id);
    }
}
