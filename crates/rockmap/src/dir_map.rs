//! Per-process handle over a shared slot table.
//!
//! Every cache directory has one shared region holding a [`SharedHeader`]
//! followed by `limit` [`Slot`]s. Each process that serves the directory
//! attaches its own [`DirMap`] to that region; processes never talk to each
//! other except through the slot states and hold counters.
//!
//! A key lives in exactly one slot, `hash(key) % limit`. There is no probing:
//! claiming a slot for a new key first evicts whatever key occupies it.
//!
//! Removal is deferred. [`DirMap::free`] only marks a Usable slot
//! WaitingToBeFreed; the slot is zeroed and returned to Empty by whichever
//! actor observes it with no holds left.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::error::{MapError, Result};
use crate::key::CacheKey;
use crate::layout::{
    shared_size, SharedHeader, Slot, SlotState, DIRMAP_MAGIC, DIRMAP_VERSION, HEADER_SIZE,
};
use crate::metadata::EntryMetadata;
use crate::region::{region_name, SharedRegion, ShmSegment};

/// Index of a slot, in `[0, limit)`.
pub type SlotId = u32;

/// Width of the slot identifier space.
pub const SLOT_ID_BITS: u32 = 24;

/// Hard ceiling on the number of slots a map can have.
pub const ABSOLUTE_ENTRY_LIMIT: usize = (1 << SLOT_ID_BITS) - 1;

pub struct DirMap {
    path: PathBuf,
    name: String,
    region: Box<dyn SharedRegion>,
    limit: u32,
}

impl fmt::Debug for DirMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirMap")
            .field("path", &self.path)
            .field("name", &self.name)
            .field("limit", &self.limit)
            .field("count", &self.entry_count())
            .finish()
    }
}

impl DirMap {
    /// Create a fresh map for `cache_dir` in the configured segment directory.
    pub fn create(cache_dir: impl AsRef<Path>, limit: usize) -> Result<Self> {
        let shm_dir = rockmap_config::config().region.shm_dir.clone();
        Self::create_in(&shm_dir, cache_dir, limit)
    }

    /// Attach to the existing map for `cache_dir` in the configured segment
    /// directory.
    pub fn open(cache_dir: impl AsRef<Path>) -> Result<Self> {
        let shm_dir = rockmap_config::config().region.shm_dir.clone();
        Self::open_in(&shm_dir, cache_dir)
    }

    pub fn create_in(shm_dir: &Path, cache_dir: impl AsRef<Path>, limit: usize) -> Result<Self> {
        let cache_dir = cache_dir.as_ref();
        check_limit(limit)?;
        let name = region_name(&cache_dir.to_string_lossy());
        let segment = ShmSegment::create(shm_dir, &name, shared_size(limit))?;
        Self::with_region(cache_dir, segment, limit)
    }

    pub fn open_in(shm_dir: &Path, cache_dir: impl AsRef<Path>) -> Result<Self> {
        let cache_dir = cache_dir.as_ref();
        let name = region_name(&cache_dir.to_string_lossy());
        let segment = ShmSegment::open(shm_dir, &name)?;
        Self::attach(cache_dir, segment)
    }

    /// Initialize a new map over `region`, discarding whatever it held.
    pub fn with_region<R>(cache_dir: impl AsRef<Path>, region: R, limit: usize) -> Result<Self>
    where
        R: SharedRegion + 'static,
    {
        let limit = check_limit(limit)?;
        let needed = shared_size(limit as usize);
        if region.len() < needed {
            return Err(MapError::RegionTooSmall {
                actual: region.len(),
                needed,
                limit: limit as usize,
            });
        }

        // SAFETY: the region is at least `needed` bytes and nobody else can be
        // using a map that has not been constructed yet.
        unsafe {
            std::ptr::write_bytes(region.as_ptr(), 0, needed);
            std::ptr::write(
                region.as_ptr() as *mut SharedHeader,
                SharedHeader::new(limit),
            );
        }

        let map = Self::from_parts(cache_dir.as_ref(), Box::new(region), limit);
        info!(
            map = %map.path.display(),
            name = %map.name,
            limit = map.limit,
            "Created new map using a new shared segment"
        );
        Ok(map)
    }

    /// Attach to a map some other process already initialized in `region`.
    pub fn attach<R>(cache_dir: impl AsRef<Path>, region: R) -> Result<Self>
    where
        R: SharedRegion + 'static,
    {
        let cache_dir = cache_dir.as_ref();
        if region.len() < HEADER_SIZE {
            return Err(MapError::RegionTooSmall {
                actual: region.len(),
                needed: HEADER_SIZE,
                limit: 0,
            });
        }

        let header = unsafe { &*(region.as_ptr() as *const SharedHeader) };
        if header.magic != DIRMAP_MAGIC {
            warn!(map = %cache_dir.display(), magic = header.magic, "Rejected shared segment");
            return Err(MapError::BadMagic(header.magic));
        }
        if header.version != DIRMAP_VERSION {
            return Err(MapError::VersionMismatch {
                found: header.version,
                expected: DIRMAP_VERSION,
            });
        }
        let computed = header.compute_crc();
        if header.crc32 != computed {
            warn!(
                map = %cache_dir.display(),
                stored = header.crc32,
                computed,
                "Map header CRC mismatch"
            );
            return Err(MapError::HeaderCorrupt {
                stored: header.crc32,
                computed,
            });
        }
        let limit = check_limit(header.limit as usize)?;
        let needed = shared_size(limit as usize);
        if region.len() < needed {
            return Err(MapError::RegionTooSmall {
                actual: region.len(),
                needed,
                limit: limit as usize,
            });
        }

        let map = Self::from_parts(cache_dir, Box::new(region), limit);
        info!(
            map = %map.path.display(),
            name = %map.name,
            limit = map.limit,
            count = map.entry_count(),
            "Attached to existing shared segment"
        );
        Ok(map)
    }

    fn from_parts(cache_dir: &Path, region: Box<dyn SharedRegion>, limit: u32) -> Self {
        Self {
            path: cache_dir.to_path_buf(),
            name: region_name(&cache_dir.to_string_lossy()),
            region,
            limit,
        }
    }

    // -----------------------------------------------------------------------
    // Writing
    // -----------------------------------------------------------------------

    /// Claim the slot for `key` so its metadata can be written.
    ///
    /// Evicts the slot's current occupant first. Returns `None` if the slot
    /// could not be claimed (another writer holds it, or readers still pin
    /// the evicted entry). The returned handle must be passed to
    /// [`close_for_writing`](Self::close_for_writing); a dropped handle leaves
    /// the slot claimed.
    pub fn open_for_writing(&self, key: &CacheKey) -> Option<WriteHandle<'_>> {
        let id = self.slot_index(key);
        trace!(map = %self.path.display(), slot = id, key = %key, "Opening entry for writing");
        self.free(id);

        let slot = self.slot(id);
        if slot.try_transition(SlotState::Empty, SlotState::Writing) {
            // SAFETY: we own the slot in Writing.
            unsafe { slot.set_key(key) };
            debug!(map = %self.path.display(), slot = id, key = %key, "Opened entry for writing");
            return Some(WriteHandle { map: self, id });
        }

        debug!(map = %self.path.display(), slot = id, key = %key, "Failed to open entry for writing");
        None
    }

    /// Publish a written entry. Readers can see it once this returns.
    pub fn close_for_writing(&self, handle: WriteHandle<'_>) {
        self.check_owner(handle.map, handle.id);
        let id = handle.id;
        let slot = self.checked_slot(id);
        if !slot.is(SlotState::Writing) {
            self.contract_violation(format_args!(
                "close_for_writing on slot {} in state {:?}",
                id,
                slot.state()
            ));
        }

        // Publish under a transient hold so a concurrent free() cannot reclaim
        // the slot before the count is settled.
        slot.hold();
        self.header().increment_count();
        if !slot.try_transition(SlotState::Writing, SlotState::Usable) {
            self.contract_violation(format_args!("slot {} left Writing while owned", id));
        }
        self.release_hold(id, slot);
        debug!(map = %self.path.display(), slot = id, "Closed entry for writing");
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    /// Take a read hold on the entry stored for `key`.
    pub fn open_for_reading(&self, key: &CacheKey) -> Option<ReadHandle<'_>> {
        let id = self.slot_index(key);
        trace!(map = %self.path.display(), slot = id, key = %key, "Opening entry for reading");
        if let Some(handle) = self.open_for_reading_at(id) {
            if handle.key() == key {
                return Some(handle);
            }
            // Slot was reused for a different key.
            debug!(map = %self.path.display(), slot = id, key = %key, "Key mismatch");
            self.release_hold(id, self.slot(id));
        }
        None
    }

    /// Take a read hold on slot `id` if it holds a Usable entry.
    ///
    /// Panics if `id` is out of range.
    pub fn open_for_reading_at(&self, id: SlotId) -> Option<ReadHandle<'_>> {
        let slot = self.checked_slot(id);
        slot.hold();
        if slot.is(SlotState::Usable) {
            trace!(map = %self.path.display(), slot = id, "Opened entry for reading");
            return Some(ReadHandle { map: self, id });
        }
        self.release_hold(id, slot);
        trace!(map = %self.path.display(), slot = id, "Failed to open entry for reading");
        None
    }

    /// Drop a read hold; reclaims the slot if it was the last hold on an entry
    /// marked for removal.
    pub fn close_for_reading(&self, handle: ReadHandle<'_>) {
        self.check_owner(handle.map, handle.id);
        let id = handle.id;
        let slot = self.checked_slot(id);
        if !slot.release() {
            self.contract_violation(format_args!(
                "close_for_reading on slot {} without an outstanding hold",
                id
            ));
        }
        self.free_if_needed(id, slot);
        trace!(map = %self.path.display(), slot = id, "Closed entry for reading");
    }

    // -----------------------------------------------------------------------
    // Freeing
    // -----------------------------------------------------------------------

    /// Mark the entry in slot `id` for removal.
    ///
    /// Returns true only if this call moved the slot from Usable to
    /// WaitingToBeFreed. Existing readers keep a valid view; the slot becomes
    /// Empty when the last of them closes. Panics if `id` is out of range.
    pub fn free(&self, id: SlotId) -> bool {
        let Some(handle) = self.open_for_reading_at(id) else {
            trace!(map = %self.path.display(), slot = id, "Nothing to free");
            return false;
        };
        let marked = self
            .slot(id)
            .try_transition(SlotState::Usable, SlotState::WaitingToBeFreed);
        self.close_for_reading(handle);
        if marked {
            debug!(map = %self.path.display(), slot = id, "Marked entry to be freed");
        } else {
            debug!(map = %self.path.display(), slot = id, "Entry already marked to be freed");
        }
        marked
    }

    fn release_hold(&self, id: SlotId, slot: &Slot) {
        if !slot.release() {
            self.contract_violation(format_args!("hold count on slot {} underflowed", id));
        }
        self.free_if_needed(id, slot);
    }

    /// Reclaim `slot` if it is marked for removal and unheld. Safe to call
    /// from any path at any time.
    fn free_if_needed(&self, id: SlotId, slot: &Slot) {
        loop {
            if !slot.try_transition(SlotState::WaitingToBeFreed, SlotState::Freeing) {
                return;
            }

            if slot.read_level() == 0 {
                // SAFETY: Freeing is exclusive and no holds are outstanding;
                // new readers back off because the state is not Usable.
                unsafe { slot.clear() };
                self.header().decrement_count();
                if !slot.try_transition(SlotState::Freeing, SlotState::Empty) {
                    self.contract_violation(format_args!("slot {} left Freeing while owned", id));
                }
                debug!(map = %self.path.display(), slot = id, "Freed entry");
                return;
            }

            if !slot.try_transition(SlotState::Freeing, SlotState::WaitingToBeFreed) {
                self.contract_violation(format_args!("slot {} left Freeing while owned", id));
            }
            trace!(map = %self.path.display(), slot = id, "Free postponed, entry is held");

            // A reader that released between our check and the rollback saw
            // Freeing and could not reclaim; try again on its behalf.
            if slot.read_level() > 0 {
                return;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Capacity
    // -----------------------------------------------------------------------

    pub fn entry_limit(&self) -> usize {
        self.limit as usize
    }

    pub fn entry_count(&self) -> usize {
        self.header().count() as usize
    }

    pub fn full(&self) -> bool {
        self.entry_count() >= self.entry_limit()
    }

    pub fn absolute_entry_limit() -> usize {
        ABSOLUTE_ENTRY_LIMIT
    }

    /// Region size needed for `limit` slots.
    pub fn shared_size(limit: usize) -> usize {
        shared_size(limit)
    }

    pub fn slot_index(&self, key: &CacheKey) -> SlotId {
        (key.hash_value() % self.limit as u64) as SlotId
    }

    pub fn valid(&self, id: SlotId) -> bool {
        id < self.limit
    }

    pub fn cache_dir(&self) -> &Path {
        &self.path
    }

    pub fn region_name(&self) -> &str {
        &self.name
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    /// Current state of slot `id`, `None` if the shared bytes are not a known
    /// state. Panics if `id` is out of range.
    pub fn slot_state(&self, id: SlotId) -> Option<SlotState> {
        self.checked_slot(id).state()
    }

    pub fn read_level(&self, id: SlotId) -> u32 {
        self.checked_slot(id).read_level()
    }

    /// Racy point-in-time view of one slot.
    pub fn snapshot(&self, id: SlotId) -> SlotSnapshot {
        let slot = self.checked_slot(id);
        SlotSnapshot {
            id,
            state: slot.state(),
            read_level: slot.read_level(),
            key: slot.key_snapshot(),
        }
    }

    /// Count slots per state. Other processes may be changing the table while
    /// it is scanned, so totals are approximate under load.
    pub fn stats(&self) -> MapStats {
        let mut stats = MapStats {
            limit: self.entry_limit(),
            count: self.entry_count(),
            ..Default::default()
        };
        for slot in self.slots() {
            match slot.state() {
                Some(SlotState::Empty) => stats.empty += 1,
                Some(SlotState::Writing) => stats.writing += 1,
                Some(SlotState::Usable) => stats.usable += 1,
                Some(SlotState::WaitingToBeFreed) => stats.waiting_to_be_freed += 1,
                Some(SlotState::Freeing) => stats.freeing += 1,
                None => stats.corrupt += 1,
            }
        }
        stats
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn header(&self) -> &SharedHeader {
        // SAFETY: construction verified the region holds a header.
        unsafe { &*(self.region.as_ptr() as *const SharedHeader) }
    }

    fn slots(&self) -> &[Slot] {
        // SAFETY: construction verified the region holds `limit` slots right
        // after the header.
        unsafe {
            std::slice::from_raw_parts(
                self.region.as_ptr().add(HEADER_SIZE) as *const Slot,
                self.limit as usize,
            )
        }
    }

    #[inline]
    fn slot(&self, id: SlotId) -> &Slot {
        &self.slots()[id as usize]
    }

    fn checked_slot(&self, id: SlotId) -> &Slot {
        if !self.valid(id) {
            self.contract_violation(format_args!(
                "slot {} out of range (limit {})",
                id, self.limit
            ));
        }
        self.slot(id)
    }

    fn check_owner(&self, owner: &DirMap, id: SlotId) {
        if !std::ptr::eq(owner, self) {
            self.contract_violation(format_args!(
                "handle for slot {} closed on a map that did not issue it",
                id
            ));
        }
    }

    #[cold]
    #[track_caller]
    fn contract_violation(&self, what: fmt::Arguments<'_>) -> ! {
        error!(map = %self.path.display(), "Contract violation: {}", what);
        panic!("map [{}]: contract violation: {}", self.path.display(), what);
    }
}

fn check_limit(limit: usize) -> Result<u32> {
    if limit == 0 || limit > ABSOLUTE_ENTRY_LIMIT {
        return Err(MapError::InvalidLimit {
            limit,
            max: ABSOLUTE_ENTRY_LIMIT,
        });
    }
    Ok(limit as u32)
}

/// An open write on one slot. Obtained from [`DirMap::open_for_writing`].
#[derive(Debug)]
#[must_use = "an open write must be closed with DirMap::close_for_writing"]
pub struct WriteHandle<'a> {
    map: &'a DirMap,
    id: SlotId,
}

impl WriteHandle<'_> {
    pub fn slot_id(&self) -> SlotId {
        self.id
    }

    pub fn key(&self) -> &CacheKey {
        // SAFETY: the handle owns the slot in Writing.
        unsafe { self.map.slot(self.id).key() }
    }

    /// Metadata to populate before closing.
    pub fn metadata_mut(&mut self) -> &mut EntryMetadata {
        // SAFETY: the handle owns the slot in Writing and is not Clone, so this
        // is the only reference.
        unsafe { self.map.slot(self.id).metadata_mut() }
    }
}

/// A read hold on one slot. Obtained from [`DirMap::open_for_reading`] or
/// [`DirMap::open_for_reading_at`].
#[derive(Debug)]
#[must_use = "a read hold must be released with DirMap::close_for_reading"]
pub struct ReadHandle<'a> {
    map: &'a DirMap,
    id: SlotId,
}

impl ReadHandle<'_> {
    pub fn slot_id(&self) -> SlotId {
        self.id
    }

    pub fn key(&self) -> &CacheKey {
        // SAFETY: key and metadata do not change while a hold is outstanding.
        unsafe { self.map.slot(self.id).key() }
    }

    pub fn metadata(&self) -> &EntryMetadata {
        // SAFETY: see `key`.
        unsafe { self.map.slot(self.id).metadata() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub id: SlotId,
    pub state: Option<SlotState>,
    pub read_level: u32,
    pub key: CacheKey,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MapStats {
    pub limit: usize,
    pub count: usize,
    pub empty: usize,
    pub writing: usize,
    pub usable: usize,
    pub waiting_to_be_freed: usize,
    pub freeing: usize,
    pub corrupt: usize,
}
