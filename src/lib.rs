//! Training-tile preparation for paired imagery and polygon labels.
//!
//! The pipeline has four stages:
//! - [`rasterize`]: burn a polygon layer into a binary mask on a reference raster grid
//! - [`tiler`]: pad a raster/mask pair and cut co-located fixed-size tiles
//! - [`keys`]: derive spatial keys from tile filenames and join raster/mask collections
//! - [`stats`]: count foreground pixels per mask tile and select the >0 / >median tiers
//!
//! File formats (GeoTIFF, NPY, GeoJSON) and filesystem helpers live under [`io`];
//! [`pipeline`] wires the stages together for the command line tool.

pub mod crs;
pub mod error;
pub mod grid;
pub mod io;
pub mod keys;
pub mod pipeline;
pub mod rasterize;
pub mod stats;
pub mod tiler;
pub mod vector;

pub use crs::{CoordTransformer, Crs};
pub use error::PrepError;
pub use grid::{BinaryMask, GeoTransform, RasterGrid};
pub use keys::{spatial_key, SpatialKey};
pub use rasterize::{rasterize, NodataPolicy};
pub use stats::{compute_stats, PixelStat, PixelStats, Tier};
pub use tiler::{pad, TileSpec};
pub use vector::{Feature, VectorLayer};
