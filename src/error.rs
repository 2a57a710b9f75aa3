//! Configuration errors raised before any file is touched.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PrepError {
    #[error("tile size must be positive, got {0}")]
    InvalidTileSize(usize),

    #[error("stride must be positive, got {0}")]
    InvalidStride(usize),

    #[error("grid must have 2 or 3 dimensions, got {0}")]
    UnsupportedRank(usize),

    #[error("raster extent {raster:?} does not match mask extent {mask:?}")]
    ExtentMismatch {
        raster: (usize, usize),
        mask: (usize, usize),
    },

    #[error("tile prefix {0:?} produces tile names without a spatial key (need at least two '_'-separated parts)")]
    UnkeyablePrefix(String),

    #[error("mask file listed twice: {0:?}")]
    DuplicateMask(PathBuf),
}
