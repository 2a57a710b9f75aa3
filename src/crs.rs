//! Coordinate reference systems identified by EPSG code, and point reprojection.
//!
//! Reprojection is pure Rust (proj4rs); only the EPSG codes listed in
//! [`proj_string`] are known.

use std::fmt;

use anyhow::{anyhow, Result};
use proj4rs::proj::Proj;
use proj4rs::transform::transform;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Crs(pub u32);

pub const EPSG_WGS84: Crs = Crs(4326);

impl Crs {
    pub fn epsg(&self) -> u32 {
        self.0
    }

    /// Parse an EPSG reference such as `EPSG:25832`, `epsg:4326` or
    /// `urn:ogc:def:crs:EPSG::25832`. The OGC CRS84 name maps to 4326.
    pub fn parse(name: &str) -> Option<Crs> {
        if name.ends_with("CRS84") {
            return Some(EPSG_WGS84);
        }
        let re = Regex::new(r"(?i)EPSG:{1,2}(?:[0-9.]*:)?(\d+)$").ok()?;
        let caps = re.captures(name.trim())?;
        caps[1].parse().ok().map(Crs)
    }

    pub fn is_geographic(&self) -> bool {
        matches!(self.0, 4326 | 4258)
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.0)
    }
}

/// PROJ definition for the supported EPSG codes.
pub fn proj_string(crs: Crs) -> Option<String> {
    let code = crs.0;
    let def = match code {
        4326 => "+proj=longlat +datum=WGS84 +no_defs".to_string(),
        4258 => "+proj=longlat +ellps=GRS80 +no_defs".to_string(),
        3857 => "+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 +units=m +no_defs"
            .to_string(),
        32601..=32660 => format!("+proj=utm +zone={} +datum=WGS84 +units=m +no_defs", code - 32600),
        32701..=32760 => format!(
            "+proj=utm +zone={} +south +datum=WGS84 +units=m +no_defs",
            code - 32700
        ),
        25828..=25838 => format!("+proj=utm +zone={} +ellps=GRS80 +units=m +no_defs", code - 25800),
        _ => return None,
    };
    Some(def)
}

/// Reusable point transformer between two CRS.
pub struct CoordTransformer {
    source: Crs,
    target: Crs,
    projs: Option<(Proj, Proj)>,
}

impl fmt::Debug for CoordTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordTransformer")
            .field("source", &self.source)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl CoordTransformer {
    pub fn new(source: Crs, target: Crs) -> Result<Self> {
        if source == target {
            return Ok(CoordTransformer {
                source,
                target,
                projs: None,
            });
        }
        let source_def = proj_string(source).ok_or_else(|| anyhow!("{} not supported", source))?;
        let target_def = proj_string(target).ok_or_else(|| anyhow!("{} not supported", target))?;
        let source_proj = Proj::from_proj_string(&source_def)
            .map_err(|e| anyhow!("Invalid source projection {}: {:?}", source, e))?;
        let target_proj = Proj::from_proj_string(&target_def)
            .map_err(|e| anyhow!("Invalid target projection {}: {:?}", target, e))?;
        Ok(CoordTransformer {
            source,
            target,
            projs: Some((source_proj, target_proj)),
        })
    }

    pub fn is_identity(&self) -> bool {
        self.projs.is_none()
    }

    /// Transform one (x, y) point; geographic coordinates are in degrees.
    pub fn transform(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        let Some((source_proj, target_proj)) = &self.projs else {
            return Ok((x, y));
        };
        let mut point = if self.source.is_geographic() {
            (x.to_radians(), y.to_radians(), 0.0)
        } else {
            (x, y, 0.0)
        };
        transform(source_proj, target_proj, &mut point)
            .map_err(|e| anyhow!("Transform {} -> {} failed: {:?}", self.source, self.target, e))?;
        if self.target.is_geographic() {
            Ok((point.0.to_degrees(), point.1.to_degrees()))
        } else {
            Ok((point.0, point.1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_crs_names() {
        assert_eq!(Crs::parse("EPSG:25832"), Some(Crs(25832)));
        assert_eq!(Crs::parse("urn:ogc:def:crs:EPSG::25832"), Some(Crs(25832)));
        assert_eq!(Crs::parse("urn:ogc:def:crs:OGC:1.3:CRS84"), Some(EPSG_WGS84));
        assert_eq!(Crs::parse("epsg:4326"), Some(EPSG_WGS84));
        assert_eq!(Crs::parse("not a crs"), None);
    }

    #[test]
    fn identity_transform_is_passthrough() {
        let t = CoordTransformer::new(Crs(25832), Crs(25832)).unwrap();
        assert!(t.is_identity());
        assert_eq!(t.transform(562000.0, 5513000.0).unwrap(), (562000.0, 5513000.0));
    }

    #[test]
    fn unsupported_code_is_an_error() {
        assert!(CoordTransformer::new(Crs(2056), Crs(4326)).is_err());
    }

    #[test]
    fn lonlat_to_utm32_and_back() {
        // Wuerzburg, inside UTM zone 32N.
        let fwd = CoordTransformer::new(EPSG_WGS84, Crs(32632)).unwrap();
        let (x, y) = fwd.transform(9.93, 49.79).unwrap();
        assert!((560_000.0..570_000.0).contains(&x), "x = {}", x);
        assert!((5_510_000.0..5_520_000.0).contains(&y), "y = {}", y);

        let back = CoordTransformer::new(Crs(32632), EPSG_WGS84).unwrap();
        let (lon, lat) = back.transform(x, y).unwrap();
        assert!((lon - 9.93).abs() < 1e-6);
        assert!((lat - 49.79).abs() < 1e-6);
    }
}
