//! Padding and fixed-size tiling of co-registered raster/mask pairs.

use ndarray::{s, Array, Array2, Array3, ArrayView2, ArrayView3, Dimension, Slice};

use crate::error::PrepError;
use crate::keys::spatial_key;

pub const RASTER_ROLE: &str = "raster";
pub const MASK_ROLE: &str = "mask";

/// Validated tile size and stride, both in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSpec {
    tile_size: usize,
    stride: usize,
}

impl TileSpec {
    pub fn new(tile_size: usize, stride: usize) -> Result<Self, PrepError> {
        if tile_size == 0 {
            return Err(PrepError::InvalidTileSize(tile_size));
        }
        if stride == 0 {
            return Err(PrepError::InvalidStride(stride));
        }
        Ok(TileSpec { tile_size, stride })
    }

    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Window starts 0, stride, 2*stride, ... with `start + tile_size <= dim`.
    pub fn starts(&self, dim: usize) -> Vec<usize> {
        if dim < self.tile_size {
            return Vec::new();
        }
        (0..=dim - self.tile_size).step_by(self.stride).collect()
    }
}

/// Trailing padding that rounds `dim` up to a multiple of `tile_size`.
#[inline]
pub fn pad_amount(dim: usize, tile_size: usize) -> usize {
    (tile_size - dim % tile_size) % tile_size
}

/// Zero-pad the two trailing axes up to multiples of `tile_size`.
///
/// Accepts 2-D `(rows, cols)` and 3-D channel-first `(bands, rows, cols)` grids.
/// Input cells stay in the top-left corner; padding is trailing only.
pub fn pad<T, D>(grid: &Array<T, D>, tile_size: usize) -> Result<Array<T, D>, PrepError>
where
    T: Clone + Default,
    D: Dimension,
{
    if tile_size == 0 {
        return Err(PrepError::InvalidTileSize(tile_size));
    }
    let ndim = grid.ndim();
    if ndim != 2 && ndim != 3 {
        return Err(PrepError::UnsupportedRank(ndim));
    }

    let mut dim = grid.raw_dim();
    for axis in ndim - 2..ndim {
        dim[axis] += pad_amount(dim[axis], tile_size);
    }

    let mut padded = Array::from_elem(dim, T::default());
    padded
        .slice_each_axis_mut(|ax| Slice::from(0..grid.len_of(ax.axis)))
        .assign(grid);
    Ok(padded)
}

/// One co-located raster/mask window.
#[derive(Debug)]
pub struct TilePair<'a> {
    pub row_offset: usize,
    pub col_offset: usize,
    pub raster: ArrayView3<'a, f32>,
    pub mask: ArrayView2<'a, u8>,
}

/// A raster and its mask padded with the same tile size.
#[derive(Debug, Clone)]
pub struct PaddedPair {
    raster: Array3<f32>,
    mask: Array2<u8>,
    spec: TileSpec,
}

impl PaddedPair {
    /// Pad `raster` `(bands, rows, cols)` and `mask` `(rows, cols)` for tiling.
    ///
    /// Both must cover the same spatial extent, otherwise tile pairs would not
    /// be co-located.
    pub fn new(raster: &Array3<f32>, mask: &Array2<u8>, spec: TileSpec) -> Result<Self, PrepError> {
        let (_, rows, cols) = raster.dim();
        if (rows, cols) != mask.dim() {
            return Err(PrepError::ExtentMismatch {
                raster: (rows, cols),
                mask: mask.dim(),
            });
        }
        Ok(PaddedPair {
            raster: pad(raster, spec.tile_size())?,
            mask: pad(mask, spec.tile_size())?,
            spec,
        })
    }

    /// Padded (rows, cols).
    pub fn shape(&self) -> (usize, usize) {
        self.mask.dim()
    }

    pub fn tile_count(&self) -> usize {
        let (rows, cols) = self.shape();
        self.spec.starts(rows).len() * self.spec.starts(cols).len()
    }

    /// Tiles in row-major window order.
    pub fn tiles(&self) -> impl Iterator<Item = TilePair<'_>> + '_ {
        let (rows, cols) = self.shape();
        let size = self.spec.tile_size();
        let col_starts = self.spec.starts(cols);
        self.spec.starts(rows).into_iter().flat_map(move |r| {
            col_starts
                .clone()
                .into_iter()
                .map(move |c| TilePair {
                    row_offset: r,
                    col_offset: c,
                    raster: self.raster.slice(s![.., r..r + size, c..c + size]),
                    mask: self.mask.slice(s![r..r + size, c..c + size]),
                })
        })
    }
}

/// `<prefix>_<role>_tile_<row>_<col>.npy`
pub fn tile_filename(prefix: &str, role: &str, row_offset: usize, col_offset: usize) -> String {
    format!("{}_{}_tile_{}_{}.npy", prefix, role, row_offset, col_offset)
}

/// Reject prefixes whose tile names would carry no spatial key.
pub fn check_prefix(prefix: &str) -> Result<(), PrepError> {
    let probe = tile_filename(prefix, MASK_ROLE, 0, 0);
    match spatial_key(&probe) {
        Some(_) => Ok(()),
        None => Err(PrepError::UnkeyablePrefix(prefix.to_string())),
    }
}
