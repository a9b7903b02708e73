use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MapError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("shared segment not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("invalid entry limit {limit} (must be 1..={max})")]
    InvalidLimit { limit: usize, max: usize },

    #[error("invalid map magic: {0:#x}")]
    BadMagic(u32),

    #[error("map version mismatch: found {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("map header CRC mismatch: stored {stored:#x}, computed {computed:#x}")]
    HeaderCorrupt { stored: u32, computed: u32 },

    #[error("region too small: {actual} bytes, need {needed} for {limit} slots")]
    RegionTooSmall {
        actual: usize,
        needed: usize,
        limit: usize,
    },
}

pub type Result<T> = std::result::Result<T, MapError>;
