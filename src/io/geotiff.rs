//! GeoTIFF grid I/O on top of the `tiff` crate.
//!
//! Reads pixel data plus the georeferencing tags this pipeline needs
//! (ModelPixelScale/ModelTiepoint or ModelTransformation, the EPSG code from the
//! GeoKey directory, GDAL_NODATA) and writes masks back with the same tags.

use std::fs::File;
use std::io::{BufWriter, Cursor, Seek, Write};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};
use memmap2::MmapOptions;
use ndarray::Array3;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::colortype::{Gray32Float, Gray8, RGB32Float, RGBA32Float};
use tiff::encoder::{DirectoryEncoder, TiffEncoder, TiffKind};
use tiff::tags::Tag;

use crate::crs::Crs;
use crate::grid::{BinaryMask, GeoTransform, RasterGrid};

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GDAL_NODATA: u16 = 42113;

const GT_MODEL_TYPE_GEO_KEY: u16 = 1024;
const GT_RASTER_TYPE_GEO_KEY: u16 = 1025;
const GEOGRAPHIC_TYPE_GEO_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_GEO_KEY: u16 = 3072;
const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;
const RASTER_PIXEL_IS_POINT: u16 = 2;
const USER_DEFINED: u16 = 32767;

fn tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

/// Read a GeoTIFF into a channel-first f32 grid.
pub fn read_grid(path: &Path) -> Result<RasterGrid> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mmap = unsafe { MmapOptions::new().map(&file) }.with_context(|| format!("Failed to mmap {:?}", path))?;

    let mut decoder = Decoder::new(Cursor::new(&mmap))
        .with_context(|| format!("Failed to create decoder for {:?}", path))?
        .with_limits(Limits::unlimited());

    let (width, height) = decoder
        .dimensions()
        .with_context(|| format!("Failed to read dimensions from {:?}", path))?;
    let (rows, cols) = (height as usize, width as usize);

    let geokeys = read_geokeys(&mut decoder).unwrap_or_default();
    let transform = match read_transform(&mut decoder) {
        Some(gt) if geokey_value(&geokeys, GT_RASTER_TYPE_GEO_KEY) == Some(RASTER_PIXEL_IS_POINT) => {
            debug!("{:?} is PixelIsPoint; moving origin to the pixel corner", path);
            point_to_area(&gt)
        }
        Some(gt) => gt,
        None => {
            warn!("{:?} has no georeferencing tags; using pixel coordinates", path);
            GeoTransform::identity()
        }
    };
    let crs = geokey_epsg(&geokeys);
    let nodata = read_nodata(&mut decoder);

    let raw: Vec<f32> = match decoder
        .read_image()
        .with_context(|| format!("Failed to decode image from {:?}", path))?
    {
        DecodingResult::U8(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U16(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I8(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I16(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
        #[allow(unreachable_patterns)]
        _ => bail!("Unsupported sample format in {:?}", path),
    };

    let pixels = rows * cols;
    if pixels == 0 || raw.len() % pixels != 0 {
        bail!(
            "Data length mismatch in {:?}: got {} samples for {} x {} pixels",
            path,
            raw.len(),
            rows,
            cols
        );
    }
    let bands = raw.len() / pixels;

    // samples are interleaved per pixel; reorder to (bands, rows, cols)
    let interleaved = Array3::from_shape_vec((rows, cols, bands), raw)
        .map_err(|e| anyhow!("Failed to shape TIFF data for {:?}: {}", path, e))?;
    let data = interleaved.permuted_axes([2, 0, 1]).as_standard_layout().into_owned();

    debug!(
        "Read {:?}: {} band(s), {} x {}, crs {:?}, nodata {:?}",
        path, bands, rows, cols, crs, nodata
    );
    Ok(RasterGrid::new(data, transform, crs).with_nodata(nodata))
}

fn read_f64s<R: std::io::Read + Seek>(decoder: &mut Decoder<R>, code: u16) -> Option<Vec<f64>> {
    decoder
        .find_tag(tag(code))
        .ok()
        .flatten()
        .and_then(|v| v.into_f64_vec().ok())
}

fn read_transform<R: std::io::Read + Seek>(decoder: &mut Decoder<R>) -> Option<GeoTransform> {
    if let Some(matrix) = read_f64s(decoder, MODEL_TRANSFORMATION) {
        return GeoTransform::from_model_transformation(&matrix);
    }
    let scale = read_f64s(decoder, MODEL_PIXEL_SCALE)?;
    let tie = read_f64s(decoder, MODEL_TIEPOINT)?;
    if scale.len() < 2 || tie.len() < 6 {
        return None;
    }
    Some(GeoTransform::from_scale_tiepoint(
        [scale[0], scale[1]],
        [tie[0], tie[1], tie[2], tie[3], tie[4], tie[5]],
    ))
}

fn read_geokeys<R: std::io::Read + Seek>(decoder: &mut Decoder<R>) -> Option<Vec<u16>> {
    decoder
        .find_tag(tag(GEO_KEY_DIRECTORY))
        .ok()
        .flatten()
        .and_then(|v| v.into_u16_vec().ok())
}

/// Inline (SHORT) value of GeoKey `id`.
fn geokey_value(keys: &[u16], id: u16) -> Option<u16> {
    if keys.len() < 4 {
        return None;
    }
    let count = keys[3] as usize;
    keys[4..]
        .chunks_exact(4)
        .take(count)
        .find(|e| e[0] == id && e[1] == 0)
        .map(|e| e[3])
}

/// EPSG code from a GeoKey directory; projected CRS wins over geographic.
fn geokey_epsg(keys: &[u16]) -> Option<Crs> {
    let lookup = |id: u16| geokey_value(keys, id).filter(|&code| code != 0 && code != USER_DEFINED);
    lookup(PROJECTED_CS_TYPE_GEO_KEY)
        .or_else(|| lookup(GEOGRAPHIC_TYPE_GEO_KEY))
        .map(|code| Crs(code as u32))
}

/// PixelIsPoint tiepoints refer to pixel centres; shift the origin half a pixel
/// back so the transform addresses pixel corners like PixelIsArea.
fn point_to_area(gt: &GeoTransform) -> GeoTransform {
    let g = gt.0;
    GeoTransform([
        g[0] - 0.5 * g[1] - 0.5 * g[2],
        g[1],
        g[2],
        g[3] - 0.5 * g[4] - 0.5 * g[5],
        g[4],
        g[5],
    ])
}

fn read_nodata<R: std::io::Read + Seek>(decoder: &mut Decoder<R>) -> Option<f64> {
    let text = decoder
        .find_tag(tag(GDAL_NODATA))
        .ok()
        .flatten()
        .and_then(|v| v.into_string().ok())?;
    text.trim_matches(|c: char| c == '\0' || c.is_whitespace()).parse().ok()
}

fn geokey_directory(crs: Option<Crs>) -> Vec<u16> {
    let raster_type = [GT_RASTER_TYPE_GEO_KEY, 0, 1, RASTER_PIXEL_IS_AREA];
    let Some((crs, code)) = crs.and_then(|c| u16::try_from(c.epsg()).ok().map(|code| (c, code))) else {
        return [[1, 1, 0, 1], raster_type].concat();
    };
    let (model_type, cs_key) = if crs.is_geographic() {
        (MODEL_TYPE_GEOGRAPHIC, GEOGRAPHIC_TYPE_GEO_KEY)
    } else {
        (MODEL_TYPE_PROJECTED, PROJECTED_CS_TYPE_GEO_KEY)
    };
    // entries sorted by key id
    [
        [1, 1, 0, 3],
        [GT_MODEL_TYPE_GEO_KEY, 0, 1, model_type],
        raster_type,
        [cs_key, 0, 1, code],
    ]
    .concat()
}

fn write_geo_tags<W: Write + Seek, K: TiffKind>(
    dir: &mut DirectoryEncoder<W, K>,
    transform: &GeoTransform,
    crs: Option<Crs>,
    nodata: Option<f64>,
) -> Result<()> {
    let gt = &transform.0;
    if transform.is_north_up() && gt[5] < 0.0 {
        let scale = [gt[1], -gt[5], 0.0];
        let tiepoint = [0.0, 0.0, 0.0, gt[0], gt[3], 0.0];
        dir.write_tag(tag(MODEL_PIXEL_SCALE), scale.as_slice())?;
        dir.write_tag(tag(MODEL_TIEPOINT), tiepoint.as_slice())?;
    } else {
        let matrix = [
            gt[1], gt[2], 0.0, gt[0], //
            gt[4], gt[5], 0.0, gt[3], //
            0.0, 0.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ];
        dir.write_tag(tag(MODEL_TRANSFORMATION), matrix.as_slice())?;
    }
    let keys = geokey_directory(crs);
    dir.write_tag(tag(GEO_KEY_DIRECTORY), keys.as_slice())?;
    if let Some(nodata) = nodata {
        let text = nodata.to_string();
        dir.write_tag(tag(GDAL_NODATA), text.as_str())?;
    }
    Ok(())
}

/// Write a binary mask as a single-band u8 GeoTIFF on the given grid.
pub fn write_mask(path: &Path, mask: &BinaryMask, transform: &GeoTransform, crs: Option<Crs>) -> Result<()> {
    let (rows, cols) = mask.dim();
    if rows == 0 || cols == 0 {
        bail!("Refusing to write empty mask to {:?}", path);
    }
    let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file))?;
    let mut image = encoder.new_image::<Gray8>(cols as u32, rows as u32)?;
    write_geo_tags(image.encoder(), transform, crs, None)?;
    let data: Vec<u8> = mask.iter().copied().collect();
    image.write_data(&data)?;
    Ok(())
}

/// Write a 1-, 3- or 4-band grid as f32 GeoTIFF.
pub fn write_grid(path: &Path, grid: &RasterGrid) -> Result<()> {
    let (rows, cols) = grid.shape();
    if rows == 0 || cols == 0 {
        bail!("Refusing to write empty grid to {:?}", path);
    }
    let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file))?;

    // interleave (bands, rows, cols) -> per pixel samples
    let interleaved: Vec<f32> = grid
        .data
        .view()
        .permuted_axes([1, 2, 0])
        .iter()
        .copied()
        .collect();
    let (w, h) = (cols as u32, rows as u32);

    match grid.bands() {
        1 => {
            let mut image = encoder.new_image::<Gray32Float>(w, h)?;
            write_geo_tags(image.encoder(), &grid.transform, grid.crs, grid.nodata)?;
            image.write_data(&interleaved)?;
        }
        3 => {
            let mut image = encoder.new_image::<RGB32Float>(w, h)?;
            write_geo_tags(image.encoder(), &grid.transform, grid.crs, grid.nodata)?;
            image.write_data(&interleaved)?;
        }
        4 => {
            let mut image = encoder.new_image::<RGBA32Float>(w, h)?;
            write_geo_tags(image.encoder(), &grid.transform, grid.crs, grid.nodata)?;
            image.write_data(&interleaved)?;
        }
        n => bail!("Cannot write {} band grid to {:?}: only 1, 3 or 4 bands", n, path),
    }
    Ok(())
}
