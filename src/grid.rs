//! In-memory raster grids and their pixel-to-world georeferencing.

use ndarray::{Array2, Array3, Axis};

use crate::crs::Crs;

/// Single-band {0,1} occupancy grid produced by the rasterizer.
pub type BinaryMask = Array2<u8>;

/// Affine pixel-to-world transform in GDAL coefficient order.
///
/// For pixel column `c` and row `r` (fractional, top-left corner at 0,0):
///   x = gt[0] + c * gt[1] + r * gt[2]
///   y = gt[3] + c * gt[4] + r * gt[5]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform(pub [f64; 6]);

impl GeoTransform {
    /// Identity mapping: world coordinates equal (col, row).
    pub fn identity() -> Self {
        GeoTransform([0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
    }

    /// North-up transform from a GeoTIFF pixel scale and a single tie point.
    ///
    /// `tiepoint` is `[i, j, k, x, y, z]`, tying raster (i, j) to world (x, y).
    pub fn from_scale_tiepoint(scale: [f64; 2], tiepoint: [f64; 6]) -> Self {
        let [sx, sy] = scale;
        let origin_x = tiepoint[3] - tiepoint[0] * sx;
        let origin_y = tiepoint[4] + tiepoint[1] * sy;
        GeoTransform([origin_x, sx, 0.0, origin_y, 0.0, -sy])
    }

    /// From a row-major 4x4 ModelTransformation matrix.
    pub fn from_model_transformation(m: &[f64]) -> Option<Self> {
        if m.len() < 8 {
            return None;
        }
        Some(GeoTransform([m[3], m[0], m[1], m[7], m[4], m[5]]))
    }

    pub fn is_north_up(&self) -> bool {
        self.0[2] == 0.0 && self.0[4] == 0.0
    }

    /// World coordinate of a fractional pixel position.
    #[inline]
    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        let gt = &self.0;
        (
            gt[0] + col * gt[1] + row * gt[2],
            gt[3] + col * gt[4] + row * gt[5],
        )
    }

    /// Inverse transform, `None` when the matrix is singular.
    pub fn inverse(&self) -> Option<GeoTransform> {
        let gt = &self.0;
        let det = gt[1] * gt[5] - gt[2] * gt[4];
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        let inv_det = 1.0 / det;
        let a = gt[5] * inv_det;
        let b = -gt[2] * inv_det;
        let d = -gt[4] * inv_det;
        let e = gt[1] * inv_det;
        Some(GeoTransform([
            -gt[0] * a - gt[3] * b,
            a,
            b,
            -gt[0] * d - gt[3] * e,
            d,
            e,
        ]))
    }
}

/// Multi-band raster, channel-first `(bands, rows, cols)`.
#[derive(Debug, Clone)]
pub struct RasterGrid {
    pub data: Array3<f32>,
    pub transform: GeoTransform,
    pub crs: Option<Crs>,
    pub nodata: Option<f64>,
}

impl RasterGrid {
    pub fn new(data: Array3<f32>, transform: GeoTransform, crs: Option<Crs>) -> Self {
        RasterGrid {
            data,
            transform,
            crs,
            nodata: None,
        }
    }

    pub fn with_nodata(mut self, nodata: Option<f64>) -> Self {
        self.nodata = nodata;
        self
    }

    pub fn bands(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    /// Spatial extent as (rows, cols).
    pub fn shape(&self) -> (usize, usize) {
        let (_, rows, cols) = self.data.dim();
        (rows, cols)
    }

    /// Cells holding data in at least one band.
    ///
    /// A NaN sentinel marks NaN cells as missing; any other sentinel is narrowed
    /// to f32 once and compared exactly against the cells.
    pub fn valid_data_mask(&self, nodata: f64) -> Array2<bool> {
        let (rows, cols) = self.shape();
        let nodata = nodata as f32;
        let mut valid = Array2::from_elem((rows, cols), false);
        for band in self.data.outer_iter() {
            ndarray::Zip::from(&mut valid).and(&band).for_each(|v, &px| {
                let missing = if nodata.is_nan() { px.is_nan() } else { px == nodata };
                *v |= !missing;
            });
        }
        valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn scale_tiepoint_maps_corner() {
        let gt = GeoTransform::from_scale_tiepoint([0.2, 0.2], [0.0, 0.0, 0.0, 562000.0, 5514000.0, 0.0]);
        assert_eq!(gt.pixel_to_world(0.0, 0.0), (562000.0, 5514000.0));
        let (x, y) = gt.pixel_to_world(10.0, 5.0);
        assert!((x - 562002.0).abs() < 1e-9);
        assert!((y - 5513999.0).abs() < 1e-9);
    }

    #[test]
    fn inverse_round_trips_rotated_transform() {
        let gt = GeoTransform([100.0, 2.0, 0.5, 200.0, 0.25, -3.0]);
        let inv = gt.inverse().unwrap();
        let (x, y) = gt.pixel_to_world(7.5, 3.25);
        let (c, r) = inv.pixel_to_world(x, y);
        assert!((c - 7.5).abs() < 1e-9);
        assert!((r - 3.25).abs() < 1e-9);
    }

    #[test]
    fn singular_transform_has_no_inverse() {
        assert!(GeoTransform([0.0, 0.0, 0.0, 0.0, 0.0, 0.0]).inverse().is_none());
    }

    #[test]
    fn valid_mask_needs_one_band_with_data() {
        let data = array![[[0.0f32, 5.0], [0.0, 0.0]], [[0.0, 0.0], [7.0, 0.0]]];
        let grid = RasterGrid::new(data, GeoTransform::identity(), None);
        let valid = grid.valid_data_mask(0.0);
        assert_eq!(valid, array![[false, true], [true, false]]);
    }

    #[test]
    fn nan_sentinel_matches_nan_cells() {
        let data = array![[[f32::NAN, 1.0], [2.0, f32::NAN]]];
        let grid = RasterGrid::new(data, GeoTransform::identity(), None);
        let valid = grid.valid_data_mask(f64::NAN);
        assert_eq!(valid, array![[false, true], [true, false]]);
    }

    #[test]
    fn inexact_sentinel_matches_f32_cells() {
        let data = array![[[0.1f32, 1.0], [0.1, 0.2]]];
        let grid = RasterGrid::new(data, GeoTransform::identity(), None);
        let valid = grid.valid_data_mask(0.1);
        assert_eq!(valid, array![[false, true], [false, true]]);
    }
}
