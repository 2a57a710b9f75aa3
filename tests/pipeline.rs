use std::fs;
use std::path::Path;

use geo::{polygon, MultiPolygon};
use ndarray::{Array2, Array3};
use tempfile::TempDir;

use geotile_prep::io::npy::NpyMmap;
use geotile_prep::io::{geojson, geotiff};
use geotile_prep::pipeline::{self, PrepareOptions};
use geotile_prep::{Crs, Feature, GeoTransform, NodataPolicy, PrepError, RasterGrid, Tier, TileSpec, VectorLayer};

const X0: f64 = 500_000.0;
const Y0: f64 = 5_400_006.0;

fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> Feature {
    Feature::new(MultiPolygon(vec![polygon![
        (x: X0 + x0, y: Y0 - y0),
        (x: X0 + x1, y: Y0 - y0),
        (x: X0 + x1, y: Y0 - y1),
        (x: X0 + x0, y: Y0 - y1),
        (x: X0 + x0, y: Y0 - y0),
    ]]))
}

fn transform() -> GeoTransform {
    GeoTransform([X0, 1.0, 0.0, Y0, 0.0, -1.0])
}

/// 3-band 6x6 raster at `<dir>/<name>.tif` and a two-feature label layer.
///
/// Per 4px tile the labels cover: (0,0) 12 px, (0,4) 1 px, (4,0) 3 px, (4,4) none.
fn fixture(dir: &Path, name: &str) -> (std::path::PathBuf, std::path::PathBuf) {
    let rasters = dir.join("rasters");
    fs::create_dir_all(&rasters).unwrap();
    let raster = rasters.join(format!("{}.tif", name));
    let data = Array3::from_shape_fn((3, 6, 6), |(b, r, c)| (b * 100 + r * 6 + c) as f32 + 1.0);
    geotiff::write_grid(&raster, &RasterGrid::new(data, transform(), Some(Crs(32632)))).unwrap();

    let vector = dir.join("labels.geojson");
    let layer = VectorLayer::new(Crs(32632), vec![rect(0.0, 0.0, 3.0, 5.0), rect(4.0, 0.0, 5.0, 1.0)]);
    geojson::write_layer(&vector, &layer, None).unwrap();
    (raster, vector)
}

fn options() -> PrepareOptions {
    PrepareOptions {
        spec: TileSpec::new(4, 4).unwrap(),
        policy: NodataPolicy::default(),
        write_masks: true,
    }
}

fn names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

#[test]
fn prepare_then_filter_end_to_end() {
    let dir = TempDir::new().unwrap();
    let (_, vector) = fixture(dir.path(), "32632_0001");
    fs::write(dir.path().join("rasters/32632_0002.tif"), b"not a tiff").unwrap();
    let prepared = dir.path().join("prepared");

    let report = pipeline::prepare_dir(&dir.path().join("rasters"), &vector, &prepared, &options()).unwrap();
    assert_eq!(report.processed.len(), 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.tile_count(), 4);
    assert!(prepared.join("processing_info.txt").exists());
    assert!(prepared.join("mask_tif/32632_0001.tif").exists());

    assert_eq!(
        names(&prepared.join("mask")),
        vec![
            "32632_0001_mask_tile_0_0.npy",
            "32632_0001_mask_tile_0_4.npy",
            "32632_0001_mask_tile_4_0.npy",
            "32632_0001_mask_tile_4_4.npy",
        ]
    );
    let tile = NpyMmap::open(&prepared.join("mask/32632_0001_mask_tile_0_0.npy")).unwrap();
    assert_eq!(tile.count_nonzero().unwrap(), 12);
    let raster_tile = NpyMmap::open(&prepared.join("raster/32632_0001_raster_tile_4_4.npy")).unwrap();
    assert_eq!(raster_tile.header().shape, vec![3, 4, 4]);
    let values = raster_tile.to_array::<f32>().unwrap();
    // bottom-right corner of the tile lies in the padding
    assert_eq!(values[[0, 0, 0]], 29.0);
    assert_eq!(values[[0, 3, 3]], 0.0);

    let filtered = dir.path().join("filtered");
    let report = pipeline::filter_tiers(&prepared.join("mask"), &prepared.join("raster"), &filtered).unwrap();
    assert_eq!(report.median, Some(3.0));
    let counts = |tier| {
        let sel = report.tier(tier).unwrap();
        (sel.masks.len(), sel.rasters.len())
    };
    assert_eq!(counts(Tier::All), (4, 4));
    assert_eq!(counts(Tier::AboveZero), (3, 3));
    assert_eq!(counts(Tier::AboveMedian), (1, 1));

    assert_eq!(names(&filtered.join("above_median/masks")), vec!["32632_0001_mask_tile_0_0.npy"]);
    assert_eq!(names(&filtered.join("above_median/rasters")), vec!["32632_0001_raster_tile_0_0.npy"]);
    assert_eq!(names(&filtered.join("above_zero/rasters")).len(), 3);
    let summary = fs::read_to_string(filtered.join("filter_summary.txt")).unwrap();
    assert!(summary.contains("Median foreground count (>0): 3"));
    assert!(summary.contains("above_median: 1 mask(s), 1 raster(s)"));
}

#[test]
fn unpartnered_tiles_are_not_exported() {
    let dir = TempDir::new().unwrap();
    let masks = dir.path().join("m");
    let rasters = dir.path().join("r");
    fs::create_dir_all(&masks).unwrap();
    fs::create_dir_all(&rasters).unwrap();
    let ones = Array2::<u8>::ones((2, 2));
    for offset in ["0_0", "0_2"] {
        geotile_prep::io::npy::write_array(&masks.join(format!("a_b_mask_tile_{}.npy", offset)), &ones).unwrap();
    }
    geotile_prep::io::npy::write_array(&rasters.join("a_b_raster_tile_0_0.npy"), &Array3::<f32>::zeros((1, 2, 2)))
        .unwrap();
    geotile_prep::io::npy::write_array(&rasters.join("a_b_raster_tile_2_2.npy"), &Array3::<f32>::zeros((1, 2, 2)))
        .unwrap();

    let out = dir.path().join("out");
    let report = pipeline::filter_tiers(&masks, &rasters, &out).unwrap();
    let all = report.tier(Tier::All).unwrap();
    assert_eq!(all.masks.len(), 1);
    assert_eq!(all.rasters.len(), 1);
    assert_eq!(names(&out.join("all/masks")), vec!["a_b_mask_tile_0_0.npy"]);
    assert_eq!(names(&out.join("all/rasters")), vec!["a_b_raster_tile_0_0.npy"]);
    // equal counts: median 4, nothing strictly above it
    assert!(report.tier(Tier::AboveMedian).unwrap().is_empty());
}

#[test]
fn rasterize_then_tile_single_pair() {
    let dir = TempDir::new().unwrap();
    let (raster, vector) = fixture(dir.path(), "32632_0001");
    let mask = dir.path().join("mask.tif");
    assert_eq!(pipeline::rasterize_file(&raster, &vector, &mask, NodataPolicy::default()).unwrap(), 16);

    let n = pipeline::tile_files(
        &raster,
        &mask,
        &dir.path().join("tr"),
        &dir.path().join("tm"),
        TileSpec::new(4, 2).unwrap(),
        Some("site_7"),
    )
    .unwrap();
    // padded 8x8 with stride 2 gives starts 0, 2, 4 per axis
    assert_eq!(n, 9);
    assert!(dir.path().join("tm/site_7_mask_tile_2_4.npy").exists());
    assert!(dir.path().join("tr/site_7_raster_tile_4_2.npy").exists());
}

#[test]
fn tiling_rejects_mismatched_extents() {
    let dir = TempDir::new().unwrap();
    let (raster, _) = fixture(dir.path(), "32632_0001");
    let mask = dir.path().join("small_mask.tif");
    geotiff::write_mask(&mask, &Array2::<u8>::zeros((5, 6)), &transform(), Some(Crs(32632))).unwrap();

    let err = pipeline::tile_files(
        &raster,
        &mask,
        &dir.path().join("tr"),
        &dir.path().join("tm"),
        TileSpec::new(4, 4).unwrap(),
        None,
    )
    .unwrap_err();
    assert_eq!(
        err.downcast_ref::<PrepError>(),
        Some(&PrepError::ExtentMismatch {
            raster: (6, 6),
            mask: (5, 6)
        })
    );
}

#[test]
fn scenes_with_the_same_origin_are_not_cross_paired() {
    let dir = TempDir::new().unwrap();
    let (_, vector) = fixture(dir.path(), "32562_5513_2019");
    fixture(dir.path(), "32562_5513_2020");
    let prepared = dir.path().join("prepared");

    let report = pipeline::prepare_dir(&dir.path().join("rasters"), &vector, &prepared, &options()).unwrap();
    assert_eq!(report.processed.len(), 1);
    assert_eq!(report.failed, vec![dir.path().join("rasters/32562_5513_2020.tif")]);
    assert!(names(&prepared.join("raster")).iter().all(|n| n.starts_with("32562_5513_2019_")));

    let filtered = dir.path().join("filtered");
    let report = pipeline::filter_tiers(&prepared.join("mask"), &prepared.join("raster"), &filtered).unwrap();
    let zero = report.tier(Tier::AboveZero).unwrap();
    assert_eq!(zero.masks.len(), zero.rasters.len());
    assert!(names(&filtered.join("above_zero/rasters")).iter().all(|n| !n.contains("2020")));
}

#[test]
fn prepare_on_empty_directory_is_ok() {
    let dir = TempDir::new().unwrap();
    let rasters = dir.path().join("rasters");
    fs::create_dir_all(&rasters).unwrap();
    let report = pipeline::prepare_dir(&rasters, &dir.path().join("missing.geojson"), &dir.path().join("out"), &options())
        .unwrap();
    assert_eq!(report.tile_count(), 0);
}
