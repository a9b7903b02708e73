//! # rockmap
//!
//! Shared-memory index mapping cache keys to fixed storage slots.
//!
//! Several processes serving the same cache directory attach to one shared
//! region and coordinate, without locks, which slot holds which object:
//!
//! - Each slot runs a small state machine (`Empty -> Writing -> Usable ->
//!   WaitingToBeFreed <-> Freeing -> Empty`) driven only by compare-and-swap.
//! - Readers pin a slot with an atomic hold count; removal is deferred until
//!   the last hold is released.
//! - Capacity is fixed at creation; a key maps to exactly one slot and
//!   collisions evict.
//!
//! ```no_run
//! use rockmap::{CacheKey, DirMap};
//!
//! let map = DirMap::create("/var/cache/rock", 1024)?;
//! let key = CacheKey::from_words(0x1234, 0x5678);
//!
//! if let Some(mut entry) = map.open_for_writing(&key) {
//!     entry.metadata_mut().swap_file_sz = 4096;
//!     map.close_for_writing(entry);
//! }
//!
//! if let Some(entry) = map.open_for_reading(&key) {
//!     println!("{} bytes in slot {}", entry.metadata().swap_file_sz, entry.slot_id());
//!     map.close_for_reading(entry);
//! }
//! # Ok::<(), rockmap::MapError>(())
//! ```

pub mod dir_map;
pub mod error;
pub mod key;
pub mod layout;
pub mod metadata;
pub mod region;

pub use dir_map::{
    DirMap, MapStats, ReadHandle, SlotId, SlotSnapshot, WriteHandle, ABSOLUTE_ENTRY_LIMIT,
    SLOT_ID_BITS,
};
pub use error::{MapError, Result};
pub use key::{CacheKey, ParseKeyError, CACHE_KEY_SIZE};
pub use layout::SlotState;
pub use metadata::EntryMetadata;
pub use region::{region_name, SharedRegion, ShmSegment};
