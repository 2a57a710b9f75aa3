//! Stage orchestration for the command line tool.
//!
//! Each function here is one subcommand: it reads its inputs through the `io`
//! collaborators, runs the library stages and reports what it wrote. Batch
//! passes run on the rayon global pool and never abort on a single bad item.

use std::collections::HashMap;
use std::fs;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use ndarray::Array3;
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::grid::{BinaryMask, RasterGrid};
use crate::io::{files, geojson, geotiff, npy};
use crate::keys;
use crate::rasterize::{rasterize, NodataPolicy};
use crate::stats::{self, Tier, TierSelection};
use crate::tiler::{check_prefix, tile_filename, PaddedPair, TileSpec, MASK_ROLE, RASTER_ROLE};
use crate::vector::VectorLayer;

pub const RASTER_EXTENSIONS: &[&str] = &["tif", "tiff"];
pub const TILE_EXTENSION: &str = "npy";
pub const RASTER_TILE_DIR: &str = "raster";
pub const MASK_TILE_DIR: &str = "mask";
pub const MASK_TIFF_DIR: &str = "mask_tif";
pub const PREPARE_SUMMARY: &str = "processing_info.txt";
pub const FILTER_SUMMARY: &str = "filter_summary.txt";

pub fn progress_style() -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .map_err(|e| anyhow!("Bad progress template: {}", e))?
        .progress_chars("#>-"))
}

fn progress_bar(len: usize, msg: &'static str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(progress_style()?);
    pb.set_message(msg);
    Ok(pb)
}

/* ============= filter-vector ============= */

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorFilterReport {
    pub features_in: usize,
    pub features_out: usize,
}

/// Drop features whose `field` is one of `exclude` and write the rest as a named layer.
pub fn filter_vector<S: AsRef<str>>(
    input: &Path,
    output: &Path,
    field: &str,
    exclude: &[S],
    layer_name: &str,
) -> Result<VectorFilterReport> {
    let layer = geojson::read_layer(input)?;
    info!("Values of {:?} before filtering: {:?}", field, layer.distinct_values(field));

    let filtered = layer.exclude_values(field, exclude);
    info!("Values of {:?} after filtering: {:?}", field, filtered.distinct_values(field));
    info!(
        "Kept {} of {} feature(s) ({} excluded)",
        filtered.len(),
        layer.len(),
        layer.len() - filtered.len()
    );
    if filtered.is_empty() {
        warn!("No features left after filtering {:?}", input);
    }

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    geojson::write_layer(output, &filtered, Some(layer_name))?;
    Ok(VectorFilterReport {
        features_in: layer.len(),
        features_out: filtered.len(),
    })
}

/* ============= rasterize ============= */

/// Rasterize the layer at `vector` onto the grid of `raster` and save the mask as GeoTIFF.
///
/// Returns the number of foreground pixels.
pub fn rasterize_file(raster: &Path, vector: &Path, output: &Path, policy: NodataPolicy) -> Result<u64> {
    let start = Instant::now();
    let grid = geotiff::read_grid(raster)?;
    let layer = geojson::read_layer(vector)?;
    let mask = rasterize(&layer, &grid, policy)?;
    let foreground = foreground_count(&mask);

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    geotiff::write_mask(output, &mask, &grid.transform, grid.crs)?;
    info!(
        "Rasterized {} feature(s) onto {:?}: {} foreground pixel(s) in {:.2}s",
        layer.len(),
        raster,
        foreground,
        start.elapsed().as_secs_f64()
    );
    Ok(foreground)
}

fn foreground_count(mask: &BinaryMask) -> u64 {
    mask.iter().filter(|&&v| v != 0).count() as u64
}

/* ============= tile ============= */

/// Output locations for one raster/mask tiling.
#[derive(Debug, Clone)]
pub struct TileOutput<'a> {
    pub raster_dir: &'a Path,
    pub mask_dir: &'a Path,
    pub prefix: &'a str,
}

/// Pad and tile a raster/mask pair, writing every window as NPY.
///
/// Raster tiles are `<f4 (bands, T, T)`, mask tiles `|u1 (T, T)`. Returns the
/// number of tile pairs written.
pub fn write_tiles(raster: &Array3<f32>, mask: &BinaryMask, spec: TileSpec, out: &TileOutput, pb: &ProgressBar) -> Result<usize> {
    check_prefix(out.prefix)?;
    let padded = PaddedPair::new(raster, mask, spec)?;
    let (rows, cols) = padded.shape();
    debug!(
        "{}: padded to {}x{}, {} tile(s) of {} px, stride {}",
        out.prefix,
        rows,
        cols,
        padded.tile_count(),
        spec.tile_size(),
        spec.stride()
    );

    let tiles: Vec<_> = padded.tiles().collect();
    if tiles.is_empty() {
        warn!("{}: no tiles produced", out.prefix);
        return Ok(0);
    }
    fs::create_dir_all(out.raster_dir)?;
    fs::create_dir_all(out.mask_dir)?;

    pb.inc_length(tiles.len() as u64);
    tiles.par_iter().try_for_each(|tile| -> Result<()> {
        let raster_path = out
            .raster_dir
            .join(tile_filename(out.prefix, RASTER_ROLE, tile.row_offset, tile.col_offset));
        let mask_path = out
            .mask_dir
            .join(tile_filename(out.prefix, MASK_ROLE, tile.row_offset, tile.col_offset));
        npy::write_array(&raster_path, &tile.raster)?;
        npy::write_array(&mask_path, &tile.mask)?;
        pb.inc(1);
        Ok(())
    })?;
    Ok(tiles.len())
}

/// Single-band GeoTIFF mask as 0/1 cells. NaN counts as background.
pub fn mask_from_grid(grid: &RasterGrid) -> Result<BinaryMask> {
    if grid.bands() != 1 {
        return Err(anyhow!("Mask raster must have one band, found {}", grid.bands()));
    }
    Ok(grid.data.index_axis(ndarray::Axis(0), 0).mapv(|v| (v != 0.0 && !v.is_nan()) as u8))
}

fn file_stem(path: &Path) -> Result<&str> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("{:?} has no usable file stem", path))
}

/// Tile a raster GeoTIFF and its mask GeoTIFF. The prefix defaults to the raster's stem.
pub fn tile_files(raster: &Path, mask: &Path, raster_dir: &Path, mask_dir: &Path, spec: TileSpec, prefix: Option<&str>) -> Result<usize> {
    let start = Instant::now();
    let prefix = match prefix {
        Some(p) => p,
        None => file_stem(raster)?,
    };
    check_prefix(prefix)?;

    let grid = geotiff::read_grid(raster)?;
    let mask_grid = geotiff::read_grid(mask)?;
    let mask = mask_from_grid(&mask_grid).with_context(|| format!("Bad mask {:?}", mask))?;

    let pb = progress_bar(0, "tiles")?;
    let out = TileOutput {
        raster_dir,
        mask_dir,
        prefix,
    };
    let count = write_tiles(&grid.data, &mask, spec, &out, &pb)?;
    pb.finish_with_message("tiles done");
    info!("Wrote {} tile pair(s) from {:?} in {:.2}s", count, raster, start.elapsed().as_secs_f64());
    Ok(count)
}

/* ============= prepare ============= */

#[derive(Debug, Clone)]
pub struct PrepareOptions {
    pub spec: TileSpec,
    pub policy: NodataPolicy,
    /// Also keep each full mask as GeoTIFF under `<out>/mask_tif/`.
    pub write_masks: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrepareReport {
    /// (raster, tile pairs written), sorted by raster path.
    pub processed: Vec<(PathBuf, usize)>,
    pub failed: Vec<PathBuf>,
}

impl PrepareReport {
    pub fn tile_count(&self) -> usize {
        self.processed.iter().map(|(_, n)| n).sum()
    }
}

fn prepare_one(raster: &Path, layer: &VectorLayer, out: &Path, opts: &PrepareOptions, pb: &ProgressBar) -> Result<usize> {
    let prefix = file_stem(raster)?;
    check_prefix(prefix)?;
    let grid = geotiff::read_grid(raster)?;
    let mask = rasterize(layer, &grid, opts.policy)?;
    if opts.write_masks {
        let dir = out.join(MASK_TIFF_DIR);
        fs::create_dir_all(&dir)?;
        geotiff::write_mask(&dir.join(format!("{}.tif", prefix)), &mask, &grid.transform, grid.crs)?;
    }
    let tile_out = TileOutput {
        raster_dir: &out.join(RASTER_TILE_DIR),
        mask_dir: &out.join(MASK_TILE_DIR),
        prefix,
    };
    let count = write_tiles(&grid.data, &mask, opts.spec, &tile_out, pb)?;
    debug!("{:?}: {} foreground pixel(s), {} tile pair(s)", raster, foreground_count(&mask), count);
    Ok(count)
}

/// Split rasters into those whose tile names get a fresh key origin and those
/// whose origin an earlier raster (in path order) already claimed.
///
/// Tiles of two rasters sharing an origin would share spatial keys and be paired
/// across scenes. Unkeyable stems are left for `prepare_one` to reject.
fn unique_origins(rasters: &[PathBuf]) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let mut claimed: HashMap<String, &PathBuf> = HashMap::new();
    let mut accepted = Vec::with_capacity(rasters.len());
    let mut clashing = Vec::new();
    for raster in rasters {
        let origin = file_stem(raster)
            .ok()
            .and_then(|stem| keys::spatial_key(tile_filename(stem, MASK_ROLE, 0, 0)))
            .map(|key| key.origin);
        match origin {
            Some(origin) => match claimed.get(&origin) {
                Some(first) => {
                    error!(
                        "Skipping {:?}: tile origin {:?} is already used by {:?}",
                        raster, origin, first
                    );
                    clashing.push(raster.clone());
                }
                None => {
                    claimed.insert(origin, raster);
                    accepted.push(raster.clone());
                }
            },
            None => accepted.push(raster.clone()),
        }
    }
    (accepted, clashing)
}

/// Rasterize one layer onto every GeoTIFF in `rasters_dir` and tile each pair into
/// `<out>/raster` and `<out>/mask`.
pub fn prepare_dir(rasters_dir: &Path, vector: &Path, out: &Path, opts: &PrepareOptions) -> Result<PrepareReport> {
    let start = Instant::now();
    let rasters = files::list_files(rasters_dir, RASTER_EXTENSIONS)?;
    if rasters.is_empty() {
        warn!("No rasters in {:?}, nothing to prepare", rasters_dir);
        return Ok(PrepareReport::default());
    }
    let layer = geojson::read_layer(vector)?;
    info!("Preparing {} raster(s) against {} feature(s)", rasters.len(), layer.len());
    fs::create_dir_all(out)?;

    let (accepted, clashing) = unique_origins(&rasters);
    let raster_pb = progress_bar(rasters.len(), "rasters")?;
    raster_pb.inc(clashing.len() as u64);
    let tile_pb = ProgressBar::hidden();
    let processed = Mutex::new(Vec::new());
    let failed = Mutex::new(clashing);

    accepted.par_iter().for_each(|raster| {
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| prepare_one(raster, &layer, out, opts, &tile_pb)));
        match result {
            Ok(Ok(count)) => processed.lock().push((raster.clone(), count)),
            Ok(Err(e)) => {
                error!("Error preparing {:?}: {:#}", raster, e);
                failed.lock().push(raster.clone());
            }
            Err(_) => {
                error!("Panic occurred while preparing {:?}. Skipping this raster.", raster);
                failed.lock().push(raster.clone());
            }
        }
        raster_pb.inc(1);
    });
    raster_pb.finish_with_message("rasters done");

    let mut report = PrepareReport {
        processed: processed.into_inner(),
        failed: failed.into_inner(),
    };
    report.processed.sort();
    report.failed.sort();

    if report.processed.is_empty() {
        return Err(anyhow!("All {} raster(s) failed to prepare", rasters.len()));
    }
    if report.tile_count() == 0 {
        warn!("No tiles were produced");
    }

    let info_content = format!(
        "Rasters: {}\nPrepared: {}\nSkipped: {}\nTile pairs: {}\nTile size: {}\nStride: {}\n",
        rasters.len(),
        report.processed.len(),
        report.failed.len(),
        report.tile_count(),
        opts.spec.tile_size(),
        opts.spec.stride()
    );
    fs::write(out.join(PREPARE_SUMMARY), info_content)?;

    info!(
        "Prepared {} of {} raster(s), {} tile pair(s) in {:.2}s",
        report.processed.len(),
        rasters.len(),
        report.tile_count(),
        start.elapsed().as_secs_f64()
    );
    Ok(report)
}

/* ============= filter ============= */

#[derive(Debug, Clone, PartialEq)]
pub struct FilterReport {
    pub mask_count: usize,
    pub raster_count: usize,
    pub median: Option<f64>,
    pub tiers: Vec<TierSelection>,
}

impl FilterReport {
    pub fn tier(&self, tier: Tier) -> Option<&TierSelection> {
        self.tiers.iter().find(|t| t.tier == tier)
    }

    fn summary(&self) -> String {
        let median = self.median.map_or_else(|| "none".to_string(), |m| format!("{}", m));
        let mut text = format!(
            "Masks: {}\nRasters: {}\nMedian foreground count (>0): {}\n",
            self.mask_count, self.raster_count, median
        );
        for sel in &self.tiers {
            text.push_str(&format!(
                "{}: {} mask(s), {} raster(s)\n",
                sel.tier,
                sel.masks.len(),
                sel.rasters.len()
            ));
        }
        text
    }
}

fn export_files(list: &[PathBuf], dest: &Path, pb: &ProgressBar) -> Result<()> {
    fs::create_dir_all(dest)?;
    list.par_iter().try_for_each(|file| -> Result<()> {
        files::copy_into(file, dest)?;
        pb.inc(1);
        Ok(())
    })
}

/// Statistics over the mask tiles, tier selection and export of each tier to
/// `<out>/<tier>/masks` and `<out>/<tier>/rasters`.
pub fn filter_tiers(masks_dir: &Path, rasters_dir: &Path, out: &Path) -> Result<FilterReport> {
    let start = Instant::now();
    let masks = files::list_files(masks_dir, &[TILE_EXTENSION])?;
    let rasters = files::list_files(rasters_dir, &[TILE_EXTENSION])?;
    info!("Dataset: {} mask(s), {} raster(s)", masks.len(), rasters.len());
    keys::duplicate_keys(&masks);
    keys::duplicate_keys(&rasters);

    let stats_pb = progress_bar(masks.len(), "statistics")?;
    let stats = stats::compute_stats_with_progress(&masks, &stats_pb)?;
    stats_pb.finish_with_message("statistics done");

    if let Some((path, stat)) = stats.iter().next() {
        info!("First entry: {:?} -> {:?}", path, stat);
    }
    let median = stats.median_nonzero();
    info!(
        "Masks with foreground: {}, median foreground count: {:?}",
        stats.select_tier(Tier::AboveZero).len(),
        median
    );

    let tiers = stats::select_tiers(&stats, &rasters);
    let total: usize = tiers.iter().map(|t| t.masks.len() + t.rasters.len()).sum();
    let export_pb = progress_bar(total, "export")?;
    for sel in &tiers {
        if sel.is_empty() {
            warn!("Tier {} is empty", sel.tier);
        }
        let tier_dir = out.join(sel.tier.name());
        export_files(&sel.masks, &tier_dir.join("masks"), &export_pb)?;
        export_files(&sel.rasters, &tier_dir.join("rasters"), &export_pb)?;
    }
    export_pb.finish_with_message("export done");

    let report = FilterReport {
        mask_count: masks.len(),
        raster_count: rasters.len(),
        median,
        tiers,
    };
    fs::write(out.join(FILTER_SUMMARY), report.summary())?;
    info!("Filtering finished in {:.2}s, output in {:?}", start.elapsed().as_secs_f64(), out);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::Crs;
    use crate::grid::GeoTransform;
    use crate::io::npy::NpyMmap;
    use crate::vector::Feature;
    use geo::{polygon, MultiPolygon};
    use ndarray::Array2;
    use serde_json::json;
    use tempfile::TempDir;

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> Feature {
        Feature::new(MultiPolygon(vec![polygon![
            (x: x0, y: y0),
            (x: x1, y: y0),
            (x: x1, y: y1),
            (x: x0, y: y1),
            (x: x0, y: y0),
        ]]))
    }

    #[test]
    fn write_tiles_names_and_shapes() {
        let dir = TempDir::new().unwrap();
        let raster = Array3::<f32>::from_elem((2, 5, 5), 1.0);
        let mask = Array2::<u8>::ones((5, 5));
        let spec = TileSpec::new(4, 4).unwrap();
        let out = TileOutput {
            raster_dir: &dir.path().join("r"),
            mask_dir: &dir.path().join("m"),
            prefix: "a_b",
        };
        let n = write_tiles(&raster, &mask, spec, &out, &ProgressBar::hidden()).unwrap();
        assert_eq!(n, 4);

        let r = NpyMmap::open(&dir.path().join("r/a_b_raster_tile_4_4.npy")).unwrap();
        assert_eq!(r.header().descr, "<f4");
        assert_eq!(r.header().shape, vec![2, 4, 4]);
        let m = NpyMmap::open(&dir.path().join("m/a_b_mask_tile_4_4.npy")).unwrap();
        assert_eq!(m.header().descr, "|u1");
        assert_eq!(m.count_nonzero().unwrap(), 1);
    }

    #[test]
    fn write_tiles_rejects_bad_prefix_before_io() {
        let dir = TempDir::new().unwrap();
        let out = TileOutput {
            raster_dir: &dir.path().join("r"),
            mask_dir: &dir.path().join("m"),
            prefix: "single",
        };
        let err = write_tiles(
            &Array3::zeros((1, 4, 4)),
            &Array2::zeros((4, 4)),
            TileSpec::new(4, 4).unwrap(),
            &out,
            &ProgressBar::hidden(),
        )
        .unwrap_err();
        assert!(err.downcast_ref::<crate::PrepError>().is_some());
        assert!(!dir.path().join("r").exists());
    }

    #[test]
    fn rasterize_file_writes_mask() {
        let dir = TempDir::new().unwrap();
        let raster = dir.path().join("r.tif");
        let grid = RasterGrid::new(
            Array3::from_elem((1, 4, 4), 3.0),
            GeoTransform([0.0, 1.0, 0.0, 4.0, 0.0, -1.0]),
            Some(Crs(32632)),
        );
        geotiff::write_grid(&raster, &grid).unwrap();
        let vector = dir.path().join("v.geojson");
        geojson::write_layer(&vector, &VectorLayer::new(Crs(32632), vec![square(0.0, 2.0, 2.0, 4.0)]), None).unwrap();

        let out = dir.path().join("out/mask.tif");
        let count = rasterize_file(&raster, &vector, &out, NodataPolicy::default()).unwrap();
        assert_eq!(count, 4);
        let back = geotiff::read_grid(&out).unwrap();
        assert_eq!(back.crs, Some(Crs(32632)));
        assert_eq!(mask_from_grid(&back).unwrap().sum(), 4);
    }

    #[test]
    fn filter_vector_drops_excluded_values() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.geojson");
        let layer = VectorLayer::new(
            Crs(4326),
            vec![
                square(0.0, 0.0, 1.0, 1.0).with_property("parking", json!("surface")),
                square(0.0, 0.0, 1.0, 1.0).with_property("parking", json!("underground")),
                square(0.0, 0.0, 1.0, 1.0),
            ],
        );
        geojson::write_layer(&input, &layer, None).unwrap();
        let output = dir.path().join("out/filtered.geojson");
        let report = filter_vector(&input, &output, "parking", &["underground", "rooftop"], "filtered_parking").unwrap();
        assert_eq!(report, VectorFilterReport { features_in: 3, features_out: 2 });
        let back = geojson::read_layer(&output).unwrap();
        assert_eq!(back.name.as_deref(), Some("filtered_parking"));
        assert_eq!(back.len(), 2);
    }

    #[test]
    fn rasters_sharing_a_tile_origin_keep_only_the_first() {
        let rasters: Vec<PathBuf> = ["d/32562_5513_2019.tif", "d/32562_5513_2020.tif", "d/32563_5513_2019.tif", "d/x.tif"]
            .iter()
            .map(PathBuf::from)
            .collect();
        let (accepted, clashing) = unique_origins(&rasters);
        assert_eq!(accepted, vec![rasters[0].clone(), rasters[2].clone(), rasters[3].clone()]);
        assert_eq!(clashing, vec![rasters[1].clone()]);
    }

    #[test]
    fn mask_grid_must_be_single_band() {
        let grid = RasterGrid::new(Array3::zeros((3, 2, 2)), GeoTransform::identity(), None);
        assert!(mask_from_grid(&grid).is_err());
        let mut one = RasterGrid::new(Array3::zeros((1, 2, 2)), GeoTransform::identity(), None);
        one.data[[0, 1, 1]] = f32::NAN;
        one.data[[0, 0, 1]] = 255.0;
        assert_eq!(mask_from_grid(&one).unwrap().sum(), 1);
    }
}
