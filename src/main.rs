use std::path::PathBuf;
use std::time::Instant;

use anyhow::{anyhow, Result};
use env_logger::{Builder, Env};
use log::info;
use rayon::ThreadPoolBuilder;
use structopt::StructOpt;

use geotile_prep::pipeline::{self, PrepareOptions};
use geotile_prep::{NodataPolicy, TileSpec};

#[derive(Debug, StructOpt)]
#[structopt(name = "geotile-prep", about = "Prepare paired raster/mask training tiles from imagery and polygon labels")]
struct Opt {
    /// Number of worker threads
    #[structopt(short = "n", long = "num-threads", default_value = "8")]
    num_threads: usize,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(Debug, StructOpt)]
struct NodataOpt {
    /// No-data value used when the raster defines none
    #[structopt(long = "nodata")]
    nodata: Option<f64>,

    /// Keep polygon coverage over no-data cells
    #[structopt(long = "ignore-nodata")]
    ignore_nodata: bool,
}

impl NodataOpt {
    fn policy(&self) -> NodataPolicy {
        if self.ignore_nodata {
            NodataPolicy::Ignore
        } else {
            NodataPolicy::Apply { fallback: self.nodata }
        }
    }
}

#[derive(Debug, StructOpt)]
struct TileOpt {
    /// Tile edge length in pixels
    #[structopt(short = "t", long = "tile-size", default_value = "256")]
    tile_size: usize,

    /// Step between tile origins in pixels
    #[structopt(short = "s", long = "stride", default_value = "256")]
    stride: usize,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Drop vector features by attribute value
    FilterVector {
        #[structopt(short = "i", long = "input", parse(from_os_str))]
        input: PathBuf,
        #[structopt(short = "o", long = "output", parse(from_os_str))]
        output: PathBuf,
        #[structopt(long = "field", default_value = "parking")]
        field: String,
        #[structopt(long = "exclude", default_value = "multi-storey,underground,rooftop,garage,carports", use_delimiter = true)]
        exclude: Vec<String>,
        #[structopt(long = "layer-name", default_value = "filtered_parking")]
        layer_name: String,
    },
    /// Burn a polygon layer into a mask GeoTIFF on a raster's grid
    Rasterize {
        #[structopt(long = "raster", parse(from_os_str))]
        raster: PathBuf,
        #[structopt(long = "vector", parse(from_os_str))]
        vector: PathBuf,
        #[structopt(short = "o", long = "output", parse(from_os_str))]
        output: PathBuf,
        #[structopt(flatten)]
        nodata: NodataOpt,
    },
    /// Cut a raster and its mask into co-located NPY tiles
    Tile {
        #[structopt(long = "raster", parse(from_os_str))]
        raster: PathBuf,
        #[structopt(long = "mask", parse(from_os_str))]
        mask: PathBuf,
        #[structopt(long = "raster-out", parse(from_os_str))]
        raster_out: PathBuf,
        #[structopt(long = "mask-out", parse(from_os_str))]
        mask_out: PathBuf,
        #[structopt(flatten)]
        tiles: TileOpt,
        /// Tile name prefix, defaults to the raster file stem
        #[structopt(long = "prefix")]
        prefix: Option<String>,
    },
    /// Rasterize and tile every GeoTIFF in a directory
    Prepare {
        #[structopt(long = "rasters", parse(from_os_str))]
        rasters: PathBuf,
        #[structopt(long = "vector", parse(from_os_str))]
        vector: PathBuf,
        #[structopt(short = "o", long = "out", parse(from_os_str))]
        out: PathBuf,
        #[structopt(flatten)]
        tiles: TileOpt,
        #[structopt(flatten)]
        nodata: NodataOpt,
        /// Also write each full mask as GeoTIFF
        #[structopt(long = "write-masks")]
        write_masks: bool,
    },
    /// Split mask/raster tiles into the all, >0 and >median foreground tiers
    Filter {
        #[structopt(long = "masks", parse(from_os_str))]
        masks: PathBuf,
        #[structopt(long = "rasters", parse(from_os_str))]
        rasters: PathBuf,
        #[structopt(short = "o", long = "out", parse(from_os_str))]
        out: PathBuf,
    },
}

fn main() -> Result<()> {
    let start_time = Instant::now();

    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    builder.init();

    let opt = Opt::from_args();

    ThreadPoolBuilder::new()
        .num_threads(opt.num_threads)
        .build_global()
        .map_err(|e| anyhow!("Failed to build thread pool: {:?}", e))?;
    info!("Num threads: {}", opt.num_threads);

    match opt.cmd {
        Command::FilterVector {
            input,
            output,
            field,
            exclude,
            layer_name,
        } => {
            info!("Filtering {:?} on {:?}, excluding {:?}", input, field, exclude);
            pipeline::filter_vector(&input, &output, &field, &exclude, &layer_name)?;
        }
        Command::Rasterize {
            raster,
            vector,
            output,
            nodata,
        } => {
            pipeline::rasterize_file(&raster, &vector, &output, nodata.policy())?;
            info!("Mask in {:?}", output);
        }
        Command::Tile {
            raster,
            mask,
            raster_out,
            mask_out,
            tiles,
            prefix,
        } => {
            let spec = TileSpec::new(tiles.tile_size, tiles.stride)?;
            pipeline::tile_files(&raster, &mask, &raster_out, &mask_out, spec, prefix.as_deref())?;
        }
        Command::Prepare {
            rasters,
            vector,
            out,
            tiles,
            nodata,
            write_masks,
        } => {
            let opts = PrepareOptions {
                spec: TileSpec::new(tiles.tile_size, tiles.stride)?,
                policy: nodata.policy(),
                write_masks,
            };
            info!("Rasters dir: {:?}", rasters);
            info!("Vector: {:?}", vector);
            info!("Output dir: {:?}", out);
            info!("Tile size: {}, stride: {}", tiles.tile_size, tiles.stride);
            let report = pipeline::prepare_dir(&rasters, &vector, &out, &opts)?;
            info!(
                "{} raster(s) prepared, {} skipped",
                report.processed.len(),
                report.failed.len()
            );
        }
        Command::Filter { masks, rasters, out } => {
            info!("Masks dir: {:?}", masks);
            info!("Rasters dir: {:?}", rasters);
            let report = pipeline::filter_tiers(&masks, &rasters, &out)?;
            for sel in &report.tiers {
                info!("{}: {} mask(s), {} raster(s)", sel.tier, sel.masks.len(), sel.rasters.len());
            }
        }
    }

    info!("All done! Finished in {:.2} seconds", start_time.elapsed().as_secs_f64());
    Ok(())
}
