//! Burn polygon layers into binary masks on a reference raster grid.
//!
//! A pixel is foreground when its centre lies inside any polygon (even-odd rule
//! over all rings, so holes stay background). Cells the reference raster marks as
//! no-data can be forced to background afterwards.

use anyhow::{anyhow, Result};
use geo::{Coord, Polygon};
use log::{debug, warn};
use ndarray::{Array2, Zip};

use crate::grid::{BinaryMask, GeoTransform, RasterGrid};
use crate::vector::VectorLayer;

/// How the reference raster's no-data value restricts the mask.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodataPolicy {
    /// Polygon coverage only.
    Ignore,
    /// Zero out cells where every band equals the raster's no-data value, or
    /// `fallback` when the raster defines none. Without either, all cells are valid.
    Apply { fallback: Option<f64> },
}

impl Default for NodataPolicy {
    fn default() -> Self {
        NodataPolicy::Apply { fallback: None }
    }
}

impl NodataPolicy {
    /// The sentinel in effect for `grid`, if any.
    pub fn resolve(&self, grid: &RasterGrid) -> Option<f64> {
        match self {
            NodataPolicy::Ignore => None,
            NodataPolicy::Apply { fallback } => grid.nodata.or(*fallback),
        }
    }
}

/// Rasterize `layer` onto the grid of `reference`.
///
/// The layer is reprojected to the reference CRS first when the two differ. The
/// result has exactly the reference's (rows, cols) extent and holds only 0 and 1.
pub fn rasterize(layer: &VectorLayer, reference: &RasterGrid, policy: NodataPolicy) -> Result<BinaryMask> {
    let (rows, cols) = reference.shape();
    let mut inside = Array2::from_elem((rows, cols), false);

    let reprojected;
    let layer = match reference.crs {
        Some(crs) if crs != layer.crs => {
            debug!("Reprojecting {} features from {} to {}", layer.len(), layer.crs, crs);
            reprojected = layer.reproject(crs)?;
            &reprojected
        }
        Some(_) => layer,
        None => {
            warn!("Reference raster has no CRS; assuming vector layer is already in raster coordinates");
            layer
        }
    };

    let to_pixel = reference
        .transform
        .inverse()
        .ok_or_else(|| anyhow!("Reference raster transform is not invertible: {:?}", reference.transform))?;

    for feature in &layer.features {
        for polygon in &feature.geometry {
            burn_polygon(&mut inside, polygon, &to_pixel);
        }
    }

    let mask = match policy.resolve(reference) {
        Some(nodata) => {
            let valid = reference.valid_data_mask(nodata);
            let mut mask = BinaryMask::zeros((rows, cols));
            Zip::from(&mut mask)
                .and(&inside)
                .and(&valid)
                .for_each(|m, &i, &v| *m = (i && v) as u8);
            mask
        }
        None => inside.mapv(|i| i as u8),
    };
    Ok(mask)
}

/// Polygon rings converted to fractional (col, row) pixel coordinates.
fn pixel_rings(polygon: &Polygon<f64>, to_pixel: &GeoTransform) -> Vec<Vec<Coord<f64>>> {
    std::iter::once(polygon.exterior())
        .chain(polygon.interiors())
        .filter(|ring| ring.0.len() >= 3)
        .map(|ring| {
            ring.0
                .iter()
                .map(|c| {
                    let (x, y) = to_pixel.pixel_to_world(c.x, c.y);
                    Coord { x, y }
                })
                .collect()
        })
        .collect()
}

/// Scanline fill at pixel centres with the even-odd rule.
fn burn_polygon(inside: &mut Array2<bool>, polygon: &Polygon<f64>, to_pixel: &GeoTransform) {
    let (rows, cols) = inside.dim();
    let rings = pixel_rings(polygon, to_pixel);
    if rings.is_empty() {
        return;
    }

    let (mut ymin, mut ymax) = (f64::INFINITY, f64::NEG_INFINITY);
    for c in rings.iter().flatten() {
        ymin = ymin.min(c.y);
        ymax = ymax.max(c.y);
    }
    if !ymin.is_finite() || !ymax.is_finite() {
        return;
    }

    // rows whose centre r + 0.5 falls in [ymin, ymax]
    let first_row = (ymin - 0.5).ceil().max(0.0) as usize;
    let last_row = ((ymax - 0.5).floor() + 1.0).clamp(0.0, rows as f64) as usize;

    let mut crossings: Vec<f64> = Vec::new();
    for row in first_row..last_row {
        let y = row as f64 + 0.5;
        crossings.clear();
        for ring in &rings {
            let n = ring.len();
            let mut j = n - 1;
            for i in 0..n {
                let (a, b) = (ring[i], ring[j]);
                if (a.y > y) != (b.y > y) {
                    crossings.push(a.x + (y - a.y) * (b.x - a.x) / (b.y - a.y));
                }
                j = i;
            }
        }
        crossings.sort_by(|a, b| a.total_cmp(b));

        for span in crossings.chunks_exact(2) {
            // columns whose centre c + 0.5 falls in [x0, x1)
            let start = (span[0] - 0.5).ceil().clamp(0.0, cols as f64) as usize;
            let end = (span[1] - 0.5).ceil().clamp(0.0, cols as f64) as usize;
            for col in start..end {
                inside[[row, col]] = true;
            }
        }
    }
}
