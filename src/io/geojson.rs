//! GeoJSON FeatureCollection I/O for polygon layers.
//!
//! Only Polygon and MultiPolygon geometries are kept; other geometry types and
//! null geometries are skipped with a warning. The layer CRS comes from the legacy
//! `crs` member and defaults to EPSG:4326.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use geo::{Coord, LineString, MultiPolygon, Polygon};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::crs::{Crs, EPSG_WGS84};
use crate::vector::{Feature, VectorLayer};

#[derive(Debug, Serialize, Deserialize)]
struct CrsDoc {
    #[serde(rename = "type")]
    kind: String,
    properties: CrsProperties,
}

#[derive(Debug, Serialize, Deserialize)]
struct CrsProperties {
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum GeometryDoc {
    Polygon { coordinates: Vec<Vec<Vec<f64>>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Vec<f64>>>> },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Serialize, Deserialize)]
struct FeatureDoc {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    properties: Option<Map<String, Value>>,
    geometry: Option<GeometryDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FeatureCollectionDoc {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    crs: Option<CrsDoc>,
    features: Vec<FeatureDoc>,
}

fn ring_from(positions: Vec<Vec<f64>>) -> LineString<f64> {
    LineString(
        positions
            .into_iter()
            .filter(|p| p.len() >= 2)
            .map(|p| Coord { x: p[0], y: p[1] })
            .collect(),
    )
}

fn polygon_from(rings: Vec<Vec<Vec<f64>>>) -> Option<Polygon<f64>> {
    let mut rings = rings.into_iter().map(ring_from);
    let exterior = rings.next()?;
    Some(Polygon::new(exterior, rings.collect()))
}

fn ring_to(ring: &LineString<f64>) -> Vec<Vec<f64>> {
    ring.0.iter().map(|c| vec![c.x, c.y]).collect()
}

fn polygon_to(polygon: &Polygon<f64>) -> Vec<Vec<Vec<f64>>> {
    std::iter::once(polygon.exterior())
        .chain(polygon.interiors())
        .map(ring_to)
        .collect()
}

/// Parse a FeatureCollection document.
pub fn parse_layer(text: &str) -> Result<VectorLayer> {
    let doc: FeatureCollectionDoc = serde_json::from_str(text).context("Invalid GeoJSON")?;
    layer_from_doc(doc)
}

fn layer_from_doc(doc: FeatureCollectionDoc) -> Result<VectorLayer> {
    if doc.kind != "FeatureCollection" {
        bail!("Expected a FeatureCollection, got {:?}", doc.kind);
    }
    let crs = match &doc.crs {
        Some(c) => match Crs::parse(&c.properties.name) {
            Some(crs) => crs,
            None => bail!("Unrecognised CRS name {:?}", c.properties.name),
        },
        None => EPSG_WGS84,
    };

    let mut skipped = 0usize;
    let mut features = Vec::with_capacity(doc.features.len());
    for (i, feature) in doc.features.into_iter().enumerate() {
        let geometry = match feature.geometry {
            Some(GeometryDoc::Polygon { coordinates }) => polygon_from(coordinates).map(|p| MultiPolygon(vec![p])),
            Some(GeometryDoc::MultiPolygon { coordinates }) => Some(MultiPolygon(
                coordinates.into_iter().filter_map(polygon_from).collect(),
            )),
            Some(GeometryDoc::Unsupported) | None => None,
        };
        match geometry {
            Some(geometry) => features.push(Feature {
                geometry,
                properties: feature.properties.unwrap_or_default(),
            }),
            None => {
                warn!("Skipping feature {}: not a polygon", i);
                skipped += 1;
            }
        }
    }
    if skipped > 0 {
        warn!("Skipped {} non-polygon feature(s)", skipped);
    }

    Ok(VectorLayer {
        name: doc.name,
        crs,
        features,
    })
}

pub fn read_layer(path: &Path) -> Result<VectorLayer> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let doc: FeatureCollectionDoc = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Invalid GeoJSON in {:?}", path))?;
    let layer = layer_from_doc(doc).with_context(|| format!("Failed to read layer from {:?}", path))?;
    info!("Read {} polygon feature(s) in {} from {:?}", layer.len(), layer.crs, path);
    Ok(layer)
}

fn layer_to_doc(layer: &VectorLayer, name: Option<&str>) -> FeatureCollectionDoc {
    let features = layer
        .features
        .iter()
        .map(|f| {
            let geometry = if f.geometry.0.len() == 1 {
                GeometryDoc::Polygon {
                    coordinates: polygon_to(&f.geometry.0[0]),
                }
            } else {
                GeometryDoc::MultiPolygon {
                    coordinates: f.geometry.0.iter().map(polygon_to).collect(),
                }
            };
            FeatureDoc {
                kind: "Feature".to_string(),
                properties: Some(f.properties.clone()),
                geometry: Some(geometry),
            }
        })
        .collect();
    FeatureCollectionDoc {
        kind: "FeatureCollection".to_string(),
        name: name.map(str::to_string).or_else(|| layer.name.clone()),
        crs: Some(CrsDoc {
            kind: "name".to_string(),
            properties: CrsProperties {
                name: format!("urn:ogc:def:crs:EPSG::{}", layer.crs.epsg()),
            },
        }),
        features,
    }
}

/// Write `layer` as a FeatureCollection named `name` (falls back to the layer's own name).
pub fn write_layer(path: &Path, layer: &VectorLayer, name: Option<&str>) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, &layer_to_doc(layer, name))
        .with_context(|| format!("Failed to write GeoJSON to {:?}", path))?;
    writer.flush()?;
    info!("Wrote {} feature(s) to {:?}", layer.len(), path);
    Ok(())
}
