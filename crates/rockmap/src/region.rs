//! Shared memory regions backing a slot map.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tracing::{debug, info};

use crate::error::{MapError, Result};

/// A block of memory visible identically to every cooperating process.
///
/// Implementations must keep the pointer returned by [`as_ptr`] stable and
/// valid for `len()` bytes for as long as the value lives. The memory is
/// aligned to at least 8 bytes.
///
/// [`as_ptr`]: SharedRegion::as_ptr
pub trait SharedRegion: Send + Sync {
    fn as_ptr(&self) -> *mut u8;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// File-backed (or anonymous) shared mapping.
///
/// On Linux the file normally lives in `/dev/shm`, so the mapping never
/// touches a disk.
pub struct ShmSegment {
    mmap: MmapMut,
    ptr: *mut u8,
    path: Option<PathBuf>,
}

// SAFETY: the mapping is owned by the segment and the raw pointer is only an
// alias of it; all concurrent access to the bytes goes through the slot
// protocol.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create (or truncate) `dir/name` with `size` zero bytes and map it.
    pub fn create(dir: &Path, name: &str, size: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size as u64)?;

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let ptr = mmap.as_mut_ptr();
        info!(path = %path.display(), size, "Created shared segment");
        Ok(Self {
            mmap,
            ptr,
            path: Some(path),
        })
    }

    /// Map an existing segment `dir/name`.
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    MapError::NotFound(path.clone())
                } else {
                    MapError::Io(e)
                }
            })?;

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let ptr = mmap.as_mut_ptr();
        debug!(path = %path.display(), size = mmap.len(), "Opened shared segment");
        Ok(Self {
            mmap,
            ptr,
            path: Some(path),
        })
    }

    /// Zero-filled anonymous mapping, private to this process and its threads.
    pub fn anonymous(size: usize) -> Result<Self> {
        let mut mmap = MmapMut::map_anon(size)?;
        let ptr = mmap.as_mut_ptr();
        Ok(Self {
            mmap,
            ptr,
            path: None,
        })
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl SharedRegion for ShmSegment {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    fn len(&self) -> usize {
        self.mmap.len()
    }
}

/// Derive the region name for a cache directory.
///
/// Path separators become `.` and empty components are dropped, so
/// `/var/cache/rock/` and `/var/cache//rock` both map to `var.cache.rock`.
pub fn region_name(cache_dir: &str) -> String {
    let name = cache_dir
        .split('/')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(".");
    if name.is_empty() {
        "root".to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_region_name() {
        assert_eq!(region_name("/var/cache/rock"), "var.cache.rock");
        assert_eq!(region_name("/var/cache/rock/"), "var.cache.rock");
        assert_eq!(region_name("cache//a/"), "cache.a");
        assert_eq!(region_name("relative"), "relative");
        assert_eq!(region_name("/"), "root");
    }

    #[test]
    fn test_create_is_zero_filled() {
        let temp = tempdir().unwrap();
        let seg = ShmSegment::create(temp.path(), "zeroed", 4096).unwrap();
        assert_eq!(seg.len(), 4096);
        let bytes = unsafe { std::slice::from_raw_parts(seg.as_ptr(), seg.len()) };
        assert!(bytes.iter().all(|b| *b == 0));
        assert_eq!(seg.path().unwrap(), temp.path().join("zeroed"));
    }

    #[test]
    fn test_two_mappings_share_bytes() {
        let temp = tempdir().unwrap();
        let a = ShmSegment::create(temp.path(), "shared", 64).unwrap();
        let b = ShmSegment::open(temp.path(), "shared").unwrap();
        unsafe { *a.as_ptr().add(7) = 42 };
        assert_eq!(unsafe { *b.as_ptr().add(7) }, 42);
    }

    #[test]
    fn test_open_missing_segment() {
        let temp = tempdir().unwrap();
        let err = ShmSegment::open(temp.path(), "missing").err().unwrap();
        assert!(matches!(err, MapError::NotFound(_)));
    }

    #[test]
    fn test_anonymous_has_no_path() {
        let seg = ShmSegment::anonymous(128).unwrap();
        assert!(seg.path().is_none());
        assert!(!seg.is_empty());
    }
}
