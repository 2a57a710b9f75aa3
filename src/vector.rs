//! Polygon layers with attributes.

use anyhow::{Context, Result};
use geo::{Coord, MapCoords, MultiPolygon};
use log::debug;
use serde_json::{Map, Value};

use crate::crs::{CoordTransformer, Crs};

#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub geometry: MultiPolygon<f64>,
    pub properties: Map<String, Value>,
}

impl Feature {
    pub fn new(geometry: MultiPolygon<f64>) -> Self {
        Feature {
            geometry,
            properties: Map::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: Value) -> Self {
        self.properties.insert(key.to_string(), value);
        self
    }

    /// String value of an attribute; `None` when missing, null or not a string.
    pub fn attribute(&self, field: &str) -> Option<&str> {
        self.properties.get(field).and_then(Value::as_str)
    }
}

/// Ordered polygon features sharing one CRS.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorLayer {
    pub name: Option<String>,
    pub crs: Crs,
    pub features: Vec<Feature>,
}

impl VectorLayer {
    pub fn new(crs: Crs, features: Vec<Feature>) -> Self {
        VectorLayer {
            name: None,
            crs,
            features,
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Copy of the layer in `target` CRS. Same-CRS layers are cloned as is.
    pub fn reproject(&self, target: Crs) -> Result<VectorLayer> {
        if self.crs == target {
            return Ok(self.clone());
        }
        let transformer = CoordTransformer::new(self.crs, target)?;
        let features = self
            .features
            .iter()
            .enumerate()
            .map(|(i, feature)| {
                let geometry = feature
                    .geometry
                    .try_map_coords(|c: Coord<f64>| {
                        transformer.transform(c.x, c.y).map(|(x, y)| Coord { x, y })
                    })
                    .with_context(|| format!("Failed to reproject feature {}", i))?;
                Ok(Feature {
                    geometry,
                    properties: feature.properties.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        debug!("Reprojected {} features from {} to {}", features.len(), self.crs, target);
        Ok(VectorLayer {
            name: self.name.clone(),
            crs: target,
            features,
        })
    }

    /// Drop features whose `field` attribute is one of `excluded`.
    ///
    /// Features without the attribute (missing or null) are kept.
    pub fn exclude_values<S: AsRef<str>>(&self, field: &str, excluded: &[S]) -> VectorLayer {
        let features = self
            .features
            .iter()
            .filter(|f| match f.attribute(field) {
                Some(v) => !excluded.iter().any(|e| e.as_ref() == v),
                None => true,
            })
            .cloned()
            .collect();
        VectorLayer {
            name: self.name.clone(),
            crs: self.crs,
            features,
        }
    }

    /// Distinct string values of `field`, in first-seen order. Null/missing is `None`.
    pub fn distinct_values(&self, field: &str) -> Vec<Option<String>> {
        let mut seen: Vec<Option<String>> = Vec::new();
        for feature in &self.features {
            let value = feature.attribute(field).map(str::to_string);
            if !seen.contains(&value) {
                seen.push(value);
            }
        }
        seen
    }
}
