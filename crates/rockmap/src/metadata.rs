//! Per-entry metadata copied between the store layer and a slot.

use serde::{Deserialize, Serialize};

/// Basic facts about a cached object, stored verbatim in its slot.
///
/// Plain data only: the record lives in shared memory, so it must not hold
/// pointers or anything with a destructor. The map assigns no meaning to the
/// fields.
///
/// Layout (48 bytes):
/// ```text
/// offset  field          size
/// ------  ------------   ----
///  0      timestamp       8
///  8      lastref         8
/// 16      expires         8
/// 24      lastmod         8
/// 32      swap_file_sz    8
/// 40      refcount        2
/// 42      flags           2
/// 44      _pad            4
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Creation time (seconds since the epoch)
    pub timestamp: i64,
    /// Last reference time
    pub lastref: i64,
    /// Expiry time
    pub expires: i64,
    /// Last-modified time reported by the origin
    pub lastmod: i64,
    /// On-disk size in bytes
    pub swap_file_sz: u64,
    pub refcount: u16,
    pub flags: u16,
    #[serde(skip)]
    pub _pad: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<EntryMetadata>() == 48);

impl EntryMetadata {
    /// True if every field is zero (the state of a reclaimed slot).
    pub fn is_zeroed(&self) -> bool {
        *self == Self::default()
    }
}
