//! File-format and filesystem collaborators used by the pipeline stages.

pub mod files;
pub mod geojson;
pub mod geotiff;
pub mod npy;
