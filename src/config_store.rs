//! # Persistent Calibration Store
//!
//! Calibration survives power cycles in a single fixed-size block of 32-bit
//! words. The block starts with a magic number and a revision; a block that
//! fails either check is ignored and compiled-in defaults are used instead.
//!
//! ## Layout (data area, after the 7-word header)
//! - `0`: selected profile bank
//! - `1 + bank * 17 + field`: one [`BankField`] per bank, three banks
//!
//! ## Writers and the output context
//! The store may sit on memory the output context reads from, so a write parks
//! the output context first. [`OutputLockout`] is that handshake: the output
//! loop registers itself as the victim and passes [`OutputLockout::park_point`]
//! once per frame; a writer holds a [`LockoutGuard`] for the duration of the
//! write. [`SharedStore`] bundles the store with its lock and the lockout so
//! both contexts write through one path.

use crate::border::{BorderOffsets, INVALID_BORDER};
use crate::calibrator::MAX_SAMPLING_OFFSET;
use crate::timings::{nominal_pixel_clock, ManualTiming};
use crate::VideoFormat;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Words in a block, header included.
pub const BLOCK_WORDS: usize = 64;
pub const MAGIC: [i32; 5] = [12_131_111, 45, 0, 667, 13_121_111];
pub const REVISION_MAJOR: i32 = 1;
pub const REVISION_MINOR: i32 = 0;
const REVISION_MAJOR_IDX: usize = MAGIC.len();
const REVISION_MINOR_IDX: usize = REVISION_MAJOR_IDX + 1;
/// First word of the data area.
pub const DATA_START: usize = REVISION_MINOR_IDX + 1;
pub const DATA_WORDS: usize = BLOCK_WORDS - DATA_START;

pub const BANK_COUNT: usize = 3;
pub const BANK_FIELDS: usize = 17;
/// Data index of the selected bank.
pub const BANK_SELECT_IDX: usize = 0;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Backing file could not be read or written
    #[error("store IO: {0}")]
    Io(#[from] io::Error),

    /// Backing file is not a store block
    #[error("store format: {0}")]
    Format(#[from] serde_json::Error),
}

/// Per-bank values, in stored order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BankField {
    CgaPixelClock,
    CgaSamplingOffset,
    EgaPixelClock,
    EgaSamplingOffset,
    MdaPixelClock,
    MdaSamplingOffset,
    CgaBorder,
    EgaBorder,
    MdaBorder,
    ManualEnabled,
    ManualMode,
    HVisible,
    VVisible,
    XBorderAuto,
    HBorder,
    YBorderAuto,
    VBorder,
}

impl BankField {
    fn pixel_clock(format: VideoFormat) -> Self {
        match format {
            VideoFormat::Cga => BankField::CgaPixelClock,
            VideoFormat::Ega => BankField::EgaPixelClock,
            VideoFormat::Mda => BankField::MdaPixelClock,
        }
    }

    fn sampling_offset(format: VideoFormat) -> Self {
        match format {
            VideoFormat::Cga => BankField::CgaSamplingOffset,
            VideoFormat::Ega => BankField::EgaSamplingOffset,
            VideoFormat::Mda => BankField::MdaSamplingOffset,
        }
    }

    fn border(format: VideoFormat) -> Self {
        match format {
            VideoFormat::Cga => BankField::CgaBorder,
            VideoFormat::Ega => BankField::EgaBorder,
            VideoFormat::Mda => BankField::MdaBorder,
        }
    }
}

/// Data index of `field` in `bank`.
pub const fn data_index(bank: usize, field: BankField) -> usize {
    1 + bank * BANK_FIELDS + field as usize
}

/// One raw store block, header included.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreBlock {
    words: Vec<i32>,
}

impl Default for StoreBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreBlock {
    /// A block with a valid header and an all-zero data area.
    pub fn new() -> Self {
        let mut words = vec![0; BLOCK_WORDS];
        words[..MAGIC.len()].copy_from_slice(&MAGIC);
        words[REVISION_MAJOR_IDX] = REVISION_MAJOR;
        words[REVISION_MINOR_IDX] = REVISION_MINOR;
        StoreBlock { words }
    }

    /// What a never-written store reads back as.
    pub fn erased() -> Self {
        StoreBlock {
            words: vec![-1; BLOCK_WORDS],
        }
    }

    pub fn from_words(mut words: Vec<i32>) -> Self {
        words.resize(BLOCK_WORDS, 0);
        StoreBlock { words }
    }

    pub fn words(&self) -> &[i32] {
        &self.words
    }

    pub fn revision(&self) -> (i32, i32) {
        (self.words[REVISION_MAJOR_IDX], self.words[REVISION_MINOR_IDX])
    }

    /// Magic number matches and the major revision is ours. Minor revisions
    /// are compatible.
    pub fn is_valid(&self) -> bool {
        self.words.len() == BLOCK_WORDS
            && self.words[..MAGIC.len()] == MAGIC
            && self.revision().0 == REVISION_MAJOR
    }

    /// Value at data index `idx`; out-of-range reads yield 0.
    pub fn read(&self, idx: usize) -> i32 {
        self.words.get(DATA_START + idx).copied().unwrap_or(0)
    }

    pub fn write(&mut self, idx: usize, value: i32) {
        if let Some(slot) = self.words.get_mut(DATA_START + idx) {
            *slot = value;
        }
    }

    fn read_u32(&self, idx: usize) -> u32 {
        self.read(idx) as u32
    }

    fn write_u32(&mut self, idx: usize, value: u32) {
        self.write(idx, value as i32);
    }
}

/// The external configuration store.
pub trait ConfigStore: Send {
    /// Reads the whole block.
    fn load(&self) -> Result<StoreBlock, StoreError>;
    /// Replaces the whole block.
    fn store(&mut self, block: &StoreBlock) -> Result<(), StoreError>;

    fn valid(&self) -> bool {
        self.load().map(|b| b.is_valid()).unwrap_or(false)
    }

    fn read(&self, idx: usize) -> i32 {
        self.load().map(|b| b.read(idx)).unwrap_or(0)
    }
}

/// Store held in memory, starting out erased.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    block: StoreBlock,
    writes: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            block: StoreBlock::erased(),
            writes: 0,
        }
    }

    pub fn with_block(block: StoreBlock) -> Self {
        MemoryStore { block, writes: 0 }
    }

    /// Number of completed writes.
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl ConfigStore for MemoryStore {
    fn load(&self) -> Result<StoreBlock, StoreError> {
        Ok(self.block.clone())
    }

    fn store(&mut self, block: &StoreBlock) -> Result<(), StoreError> {
        self.block = block.clone();
        self.writes += 1;
        Ok(())
    }
}

/// Store backed by a JSON file. A missing file reads as erased.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileStore {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileStore {
    fn load(&self) -> Result<StoreBlock, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => {
                let block: StoreBlock = serde_json::from_str(&text)?;
                Ok(StoreBlock::from_words(block.words))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(StoreBlock::erased()),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&mut self, block: &StoreBlock) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, serde_json::to_string_pretty(block)?)?;
        Ok(())
    }
}

/// Settings of one profile bank.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BankSettings {
    /// Indexed by [`VideoFormat::index`].
    pub pixel_clock_hz: [u32; 3],
    pub sampling_offset: [u32; 3],
    pub border: [Option<BorderOffsets>; 3],
    pub manual: ManualTiming,
}

impl Default for BankSettings {
    fn default() -> Self {
        BankSettings {
            pixel_clock_hz: VideoFormat::ALL.map(nominal_pixel_clock),
            sampling_offset: [0; 3],
            border: [None; 3],
            manual: ManualTiming::default(),
        }
    }
}

impl BankSettings {
    fn encode(&self, bank: usize, block: &mut StoreBlock) {
        for format in VideoFormat::ALL {
            let i = format.index();
            block.write_u32(
                data_index(bank, BankField::pixel_clock(format)),
                self.pixel_clock_hz[i],
            );
            block.write_u32(
                data_index(bank, BankField::sampling_offset(format)),
                self.sampling_offset[i],
            );
            block.write_u32(
                data_index(bank, BankField::border(format)),
                self.border[i].map_or(INVALID_BORDER, |b| b.pack()),
            );
        }
        let m = &self.manual;
        let idx = |field| data_index(bank, field);
        block.write(idx(BankField::ManualEnabled), m.enabled as i32);
        block.write(idx(BankField::ManualMode), m.format.index() as i32);
        block.write_u32(idx(BankField::HVisible), m.h_visible);
        block.write_u32(idx(BankField::VVisible), m.v_visible);
        block.write(idx(BankField::XBorderAuto), m.x_border_auto as i32);
        block.write_u32(idx(BankField::HBorder), m.h_border);
        block.write(idx(BankField::YBorderAuto), m.y_border_auto as i32);
        block.write_u32(idx(BankField::VBorder), m.v_border);
    }

    /// Reads bank `bank`. Zero pixel clocks (never written) fall back to the
    /// nominal clock and everything else is clamped into range.
    fn decode(block: &StoreBlock, bank: usize) -> Self {
        let mut settings = BankSettings::default();
        for format in VideoFormat::ALL {
            let i = format.index();
            let clock = block.read_u32(data_index(bank, BankField::pixel_clock(format)));
            if clock != 0 {
                settings.pixel_clock_hz[i] = clock;
            }
            settings.sampling_offset[i] = block
                .read_u32(data_index(bank, BankField::sampling_offset(format)))
                .min(MAX_SAMPLING_OFFSET);
            settings.border[i] =
                BorderOffsets::unpack(block.read_u32(data_index(bank, BankField::border(format))));
        }
        let idx = |field| data_index(bank, field);
        settings.manual = ManualTiming {
            enabled: block.read(idx(BankField::ManualEnabled)) != 0,
            format: VideoFormat::from_index(block.read_u32(idx(BankField::ManualMode)) as usize)
                .unwrap_or(settings.manual.format),
            h_visible: block.read_u32(idx(BankField::HVisible)),
            v_visible: block.read_u32(idx(BankField::VVisible)),
            x_border_auto: block.read(idx(BankField::XBorderAuto)) != 0,
            h_border: block.read_u32(idx(BankField::HBorder)),
            y_border_auto: block.read(idx(BankField::YBorderAuto)) != 0,
            v_border: block.read_u32(idx(BankField::VBorder)),
        }
        .clamped();
        settings
    }
}

/// Everything the store holds, decoded.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct StoredSettings {
    pub active_bank: usize,
    pub banks: [BankSettings; BANK_COUNT],
}

impl StoredSettings {
    /// Decodes a block, or returns defaults if its header is not ours.
    pub fn from_block(block: &StoreBlock) -> Self {
        if !block.is_valid() {
            return Self::default();
        }
        let active_bank = block.read_u32(BANK_SELECT_IDX) as usize;
        StoredSettings {
            active_bank: if active_bank < BANK_COUNT { active_bank } else { 0 },
            banks: [0, 1, 2].map(|bank| BankSettings::decode(block, bank)),
        }
    }

    pub fn to_block(&self) -> StoreBlock {
        let mut block = StoreBlock::new();
        block.write_u32(BANK_SELECT_IDX, self.active_bank as u32);
        for (bank, settings) in self.banks.iter().enumerate() {
            settings.encode(bank, &mut block);
        }
        block
    }

    pub fn active(&self) -> &BankSettings {
        &self.banks[self.active_bank.min(BANK_COUNT - 1)]
    }

    pub fn active_mut(&mut self) -> &mut BankSettings {
        &mut self.banks[self.active_bank.min(BANK_COUNT - 1)]
    }
}

#[derive(Debug, Default)]
struct LockoutState {
    victim: bool,
    requested: bool,
    parked: bool,
}

/// Park-the-output handshake used around store writes.
#[derive(Debug, Default)]
pub struct OutputLockout {
    state: Mutex<LockoutState>,
    cond: Condvar,
}

impl OutputLockout {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LockoutState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called by the output context before it starts rendering.
    pub fn register_victim(&self) {
        self.lock().victim = true;
    }

    /// Called by the output context whenever it stops passing park points,
    /// so writers do not wait for it.
    pub fn release_victim(&self) {
        let mut st = self.lock();
        st.victim = false;
        st.parked = false;
        self.cond.notify_all();
    }

    /// Parks the caller while a write is in progress.
    pub fn park_point(&self) {
        let mut st = self.lock();
        if !st.requested {
            return;
        }
        st.parked = true;
        self.cond.notify_all();
        while st.requested {
            st = self.cond.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
        st.parked = false;
    }

    /// Requests a lockout and waits until the victim is parked. Returns
    /// immediately when no victim is registered.
    pub fn start_blocking(&self) -> LockoutGuard<'_> {
        let mut st = self.lock();
        st.requested = true;
        while st.victim && !st.parked {
            st = self.cond.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
        LockoutGuard { lockout: self }
    }

    fn end_blocking(&self) {
        let mut st = self.lock();
        st.requested = false;
        self.cond.notify_all();
    }
}

/// Keeps the output context parked until dropped.
pub struct LockoutGuard<'a> {
    lockout: &'a OutputLockout,
}

impl Drop for LockoutGuard<'_> {
    fn drop(&mut self) {
        self.lockout.end_blocking();
    }
}

/// The store as both contexts see it.
pub struct SharedStore {
    store: Mutex<Box<dyn ConfigStore>>,
    lockout: Arc<OutputLockout>,
}

impl SharedStore {
    pub fn new(store: Box<dyn ConfigStore>, lockout: Arc<OutputLockout>) -> Self {
        SharedStore {
            store: Mutex::new(store),
            lockout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn ConfigStore>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lockout(&self) -> &Arc<OutputLockout> {
        &self.lockout
    }

    /// Loads the stored settings, falling back to defaults when the store is
    /// unreadable or holds someone else's data.
    pub fn load(&self) -> StoredSettings {
        match self.lock().load() {
            Ok(block) if block.is_valid() => {
                debug!("Loaded settings, revision {:?}", block.revision());
                StoredSettings::from_block(&block)
            }
            Ok(block) => {
                info!(
                    "No valid settings in store (revision {:?}), using defaults",
                    block.revision()
                );
                StoredSettings::default()
            }
            Err(e) => {
                warn!("Could not read settings: {}, using defaults", e);
                StoredSettings::default()
            }
        }
    }

    /// Writes `settings` with the output context parked.
    pub fn save(&self, settings: &StoredSettings) -> Result<(), StoreError> {
        let block = settings.to_block();
        let mut store = self.lock();
        let _parked = self.lockout.start_blocking();
        store.store(&block)?;
        info!("Settings saved (bank {})", settings.active_bank);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    fn sample_settings() -> StoredSettings {
        let mut settings = StoredSettings {
            active_bank: 2,
            ..StoredSettings::default()
        };
        let bank = &mut settings.banks[2];
        bank.pixel_clock_hz[VideoFormat::Cga.index()] = 14_320_000;
        bank.sampling_offset[VideoFormat::Mda.index()] = 5;
        bank.border[VideoFormat::Ega.index()] = Some(BorderOffsets::new(28, 4));
        bank.manual.enabled = true;
        bank.manual.format = VideoFormat::Mda;
        bank.manual.y_border_auto = false;
        bank.manual.v_border = 17;
        settings
    }

    #[test]
    fn layout_matches_bank_order() {
        assert_eq!(data_index(0, BankField::CgaPixelClock), 1);
        assert_eq!(data_index(0, BankField::CgaBorder), 7);
        assert_eq!(data_index(1, BankField::CgaPixelClock), 18);
        assert_eq!(data_index(2, BankField::VBorder), 51);
        assert!(data_index(BANK_COUNT - 1, BankField::VBorder) < DATA_WORDS);
    }

    #[test]
    fn settings_survive_a_block_round_trip() {
        let settings = sample_settings();
        let block = settings.to_block();
        assert!(block.is_valid());
        assert_eq!(block.read(BANK_SELECT_IDX), 2);
        assert_eq!(
            block.read(data_index(2, BankField::CgaBorder)),
            -1,
            "missing border is stored as the invalid marker"
        );
        assert_eq!(StoredSettings::from_block(&block), settings);
    }

    #[test]
    fn bad_header_falls_back_to_defaults() {
        let mut block = sample_settings().to_block();
        let mut words = block.words().to_vec();
        words[0] += 1;
        block = StoreBlock::from_words(words);
        assert!(!block.is_valid());
        assert_eq!(StoredSettings::from_block(&block), StoredSettings::default());

        let mut words = sample_settings().to_block().words().to_vec();
        words[REVISION_MAJOR_IDX] = 2;
        assert!(!StoreBlock::from_words(words).is_valid());
        assert!(!StoreBlock::erased().is_valid());
    }

    #[test]
    fn newer_minor_revision_is_accepted() {
        let mut words = StoreBlock::new().words().to_vec();
        words[REVISION_MINOR_IDX] = 3;
        assert!(StoreBlock::from_words(words).is_valid());
    }

    #[test]
    fn out_of_range_values_are_sanitized() {
        let mut block = StoreBlock::new();
        block.write(BANK_SELECT_IDX, 9);
        block.write(data_index(0, BankField::CgaSamplingOffset), 100);
        block.write(data_index(0, BankField::ManualMode), 7);
        block.write(data_index(0, BankField::HVisible), 5);
        let settings = StoredSettings::from_block(&block);
        assert_eq!(settings.active_bank, 0);
        let bank = settings.active();
        assert_eq!(bank.sampling_offset[VideoFormat::Cga.index()], MAX_SAMPLING_OFFSET);
        assert_eq!(
            bank.pixel_clock_hz[VideoFormat::Ega.index()],
            nominal_pixel_clock(VideoFormat::Ega)
        );
        assert_eq!(bank.manual.h_visible, 64);
        assert_eq!(
            bank.border,
            [Some(BorderOffsets::new(0, 0)); 3],
            "zero words decode as a zero border"
        );
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("store.json");
        let mut store = FileStore::new(&path);
        assert!(!store.valid(), "missing file reads as erased");
        let settings = sample_settings();
        store.store(&settings.to_block()).expect("write store");

        let reopened = FileStore::new(&path);
        assert!(reopened.valid());
        assert_eq!(reopened.read(BANK_SELECT_IDX), 2);
        let block = reopened.load().expect("read store");
        assert_eq!(StoredSettings::from_block(&block), settings);
    }

    #[test]
    fn corrupt_file_is_an_error_and_loads_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("store.json");
        fs::write(&path, "not json").expect("write");
        let store = FileStore::new(&path);
        assert!(matches!(store.load(), Err(StoreError::Format(_))));
        let shared = SharedStore::new(Box::new(store), Arc::new(OutputLockout::new()));
        assert_eq!(shared.load(), StoredSettings::default());
    }

    #[test]
    fn save_without_victim_does_not_block() {
        let shared = SharedStore::new(
            Box::new(MemoryStore::new()),
            Arc::new(OutputLockout::new()),
        );
        shared.save(&sample_settings()).expect("save");
        assert_eq!(shared.load(), sample_settings());
    }

    #[test]
    fn writer_waits_for_the_victim_to_park() {
        let lockout = Arc::new(OutputLockout::new());
        lockout.register_victim();
        let stop = Arc::new(AtomicBool::new(false));
        let frames = {
            let lockout = Arc::clone(&lockout);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut frames = 0u32;
                while !stop.load(Ordering::Relaxed) {
                    lockout.park_point();
                    frames += 1;
                    thread::sleep(Duration::from_millis(1));
                }
                lockout.release_victim();
                frames
            })
        };
        let shared = SharedStore::new(Box::new(MemoryStore::new()), Arc::clone(&lockout));
        for _ in 0..3 {
            shared.save(&sample_settings()).expect("save");
        }
        stop.store(true, Ordering::Relaxed);
        let frames = frames.join().expect("victim thread");
        assert!(frames > 0, "victim kept running between writes");
        assert!(!shared.lockout().lock().requested, "lockout released");
    }
}
