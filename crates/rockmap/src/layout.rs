//! Shared-memory layout of a slot map.
//!
//! These types are placed directly over the bytes of a shared region and are
//! seen identically by every attached process. Any field change here MUST
//! keep `#[repr(C)]` layout stable and bump [`DIRMAP_VERSION`].
//!
//! ```text
//! +----------------+--------+--------+-----+------------------+
//! | SharedHeader   | Slot 0 | Slot 1 | ... | Slot (limit - 1) |
//! | 64 bytes       | 72 B   | 72 B   |     | 72 B             |
//! +----------------+--------+--------+-----+------------------+
//! ```
//!
//! A zero-filled region is a valid table of Empty slots, so only the header
//! needs explicit initialization.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;

use crate::key::CacheKey;
use crate::metadata::EntryMetadata;

/// Header magic: "RKDM" in little-endian
pub const DIRMAP_MAGIC: u32 = 0x4D444B52;

/// Layout version. Bump on incompatible changes.
pub const DIRMAP_VERSION: u32 = 1;

pub const HEADER_SIZE: usize = std::mem::size_of::<SharedHeader>();

pub const SLOT_SIZE: usize = std::mem::size_of::<Slot>();

// ---------------------------------------------------------------------------
// SlotState
// ---------------------------------------------------------------------------

/// Lifecycle state of a slot.
///
/// Permitted transitions, each a single compare-and-swap:
/// ```text
/// Empty -> Writing -> Usable -> WaitingToBeFreed <-> Freeing -> Empty
/// ```
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SlotState {
    Empty = 0,
    Writing = 1,
    Usable = 2,
    WaitingToBeFreed = 3,
    Freeing = 4,
}

impl SlotState {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Empty),
            1 => Some(Self::Writing),
            2 => Some(Self::Usable),
            3 => Some(Self::WaitingToBeFreed),
            4 => Some(Self::Freeing),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Writing => "writing",
            Self::Usable => "usable",
            Self::WaitingToBeFreed => "waiting-to-be-freed",
            Self::Freeing => "freeing",
        }
    }
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SharedHeader: first 64 bytes of the region
// ---------------------------------------------------------------------------

/// Map header in shared memory.
///
/// Layout (64 bytes total):
/// ```text
/// offset  field      size
/// ------  --------   ----
///  0      magic       4   (0x4D444B52)
///  4      version     4
///  8      limit       4   (slot capacity, immutable)
/// 12      crc32       4   (CRC32 of magic, version, limit)
/// 16      count       4   (atomic live-entry counter)
/// 20      _pad       44
/// ```
#[repr(C)]
pub struct SharedHeader {
    pub magic: u32,
    pub version: u32,
    pub limit: u32,
    pub crc32: u32,
    count: AtomicU32,
    _pad: [u8; 44],
}

const _: () = assert!(std::mem::size_of::<SharedHeader>() == 64);

impl SharedHeader {
    pub fn new(limit: u32) -> Self {
        let mut header = Self {
            magic: DIRMAP_MAGIC,
            version: DIRMAP_VERSION,
            limit,
            crc32: 0,
            count: AtomicU32::new(0),
            _pad: [0; 44],
        };
        header.crc32 = header.compute_crc();
        header
    }

    /// CRC32 over the immutable fields.
    pub fn compute_crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.magic.to_le_bytes());
        hasher.update(&self.version.to_le_bytes());
        hasher.update(&self.limit.to_le_bytes());
        hasher.finalize()
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn increment_count(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn decrement_count(&self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// Slot: 72 bytes per entry
// ---------------------------------------------------------------------------

/// One entry of the slot table.
///
/// Layout (72 bytes total):
/// ```text
/// offset  field        size
/// ------  ----------   ----
///  0      state         4   (SlotState, atomic)
///  4      read_level    4   (atomic hold count)
///  8      key          16
/// 24      metadata     48
/// ```
///
/// `state` and `read_level` are only touched through atomics. `key` and
/// `metadata` are plain memory: they are written only by the actor that owns
/// the slot in Writing or Freeing, and read only while a hold on a Usable (or
/// WaitingToBeFreed) slot is outstanding.
///
/// `state` is always accessed before `read_level` by reclaimers and after it
/// by readers, both with `SeqCst`. A reader that bumped `read_level` and then
/// saw Usable is guaranteed to be seen by a reclaimer that moved the slot to
/// Freeing.
#[repr(C)]
pub struct Slot {
    state: AtomicU32,
    read_level: AtomicU32,
    key: UnsafeCell<CacheKey>,
    metadata: UnsafeCell<EntryMetadata>,
}

const _: () = assert!(std::mem::size_of::<Slot>() == 72);

impl Slot {
    /// Decoded state, or `None` if the shared bytes hold an unknown value.
    #[inline]
    pub fn state(&self) -> Option<SlotState> {
        SlotState::from_raw(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn is(&self, state: SlotState) -> bool {
        self.state.load(Ordering::SeqCst) == state as u32
    }

    /// Compare-and-swap `from -> to`. Returns false if another actor got there
    /// first.
    #[inline]
    pub(crate) fn try_transition(&self, from: SlotState, to: SlotState) -> bool {
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    #[inline]
    pub fn read_level(&self) -> u32 {
        self.read_level.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn hold(&self) {
        self.read_level.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one hold. Returns false (and changes nothing) if none was held.
    #[inline]
    pub(crate) fn release(&self) -> bool {
        self.read_level
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// # Safety
    /// Caller must hold the slot in Writing, or hold a read reference on it.
    #[inline]
    pub(crate) unsafe fn key(&self) -> &CacheKey {
        &*self.key.get()
    }

    /// # Safety
    /// Caller must own the slot in Writing.
    #[inline]
    pub(crate) unsafe fn set_key(&self, key: &CacheKey) {
        *self.key.get() = *key;
    }

    /// # Safety
    /// Caller must hold a read reference on a Usable or WaitingToBeFreed slot.
    #[inline]
    pub(crate) unsafe fn metadata(&self) -> &EntryMetadata {
        &*self.metadata.get()
    }

    /// # Safety
    /// Caller must own the slot in Writing and be the only holder of the
    /// returned reference.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn metadata_mut(&self) -> &mut EntryMetadata {
        &mut *self.metadata.get()
    }

    /// Zero key and metadata.
    ///
    /// # Safety
    /// Caller must own the slot in Freeing with no outstanding holds.
    #[inline]
    pub(crate) unsafe fn clear(&self) {
        *self.key.get() = CacheKey::default();
        *self.metadata.get() = EntryMetadata::default();
    }

    /// Racy copy of the key for diagnostics. May observe a key that is being
    /// written concurrently.
    pub(crate) fn key_snapshot(&self) -> CacheKey {
        unsafe { std::ptr::read_volatile(self.key.get()) }
    }
}

/// Bytes needed for a map with `limit` slots.
pub const fn shared_size(limit: usize) -> usize {
    HEADER_SIZE + limit * SLOT_SIZE
}
