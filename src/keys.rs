//! Spatial keys parsed from tile filenames, and key-based joins between
//! separately stored raster and mask collections.
//!
//! Filenames follow `<origin0>_<origin1>_..._<row>_<col>.<ext>` with at least six
//! `_`-separated parts. The key is (first two parts, last two parts); the role
//! token and anything else in between is ignored, so `..._raster_tile_0_0.npy`
//! and `..._mask_tile_0_0.npy` share a key.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use log::warn;

const MIN_SEGMENTS: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpatialKey {
    /// Source raster/mask pair, e.g. `32562_5513`.
    pub origin: String,
    /// Pixel offset of the tile inside its source, e.g. `1000_1200`.
    pub offset: String,
}

impl fmt::Display for SpatialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.origin, self.offset)
    }
}

/// Key of a tile file, `None` for names with fewer than six parts.
pub fn spatial_key<P: AsRef<Path>>(path: P) -> Option<SpatialKey> {
    let name = path.as_ref().file_name()?.to_str()?;
    let parts: Vec<&str> = name.split('_').collect();
    if parts.len() < MIN_SEGMENTS {
        return None;
    }
    let last = parts[parts.len() - 1];
    let last = last.rsplit_once('.').map_or(last, |(stem, _)| stem);
    Some(SpatialKey {
        origin: format!("{}_{}", parts[0], parts[1]),
        offset: format!("{}_{}", parts[parts.len() - 2], last),
    })
}

/// Keys of every keyable file in `files`.
pub fn key_set<P: AsRef<Path>>(files: &[P]) -> HashSet<SpatialKey> {
    files.iter().filter_map(spatial_key).collect()
}

/// Candidates whose key is in `reference`, in input order.
///
/// Unkeyable names never match. Files sharing a key all pass.
pub fn match_keys<P: AsRef<Path>>(candidates: &[P], reference: &HashSet<SpatialKey>) -> Vec<PathBuf> {
    candidates
        .iter()
        .filter(|path| spatial_key(path).map_or(false, |key| reference.contains(&key)))
        .map(|path| path.as_ref().to_path_buf())
        .collect()
}

/// Keys claimed by more than one file, sorted. Each is logged once.
pub fn duplicate_keys<P: AsRef<Path>>(files: &[P]) -> Vec<SpatialKey> {
    let mut seen: HashMap<SpatialKey, usize> = HashMap::new();
    for key in files.iter().filter_map(spatial_key) {
        *seen.entry(key).or_default() += 1;
    }
    let mut duplicates: Vec<SpatialKey> = seen
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(key, _)| key)
        .collect();
    duplicates.sort();
    for key in &duplicates {
        warn!("Spatial key {} is shared by several files; all of them are kept", key);
    }
    duplicates
}

/// Both sides of a key join: masks with a raster partner and rasters with a
/// mask partner.
pub fn pair_up<M: AsRef<Path>, R: AsRef<Path>>(masks: &[M], rasters: &[R]) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let mask_keys = key_set(masks);
    let raster_keys = key_set(rasters);
    (match_keys(masks, &raster_keys), match_keys(rasters, &mask_keys))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_from_six_part_name() {
        let key = spatial_key("32562_5513_tileA_foo_1000_1200.npy").unwrap();
        assert_eq!(key.origin, "32562_5513");
        assert_eq!(key.offset, "1000_1200");
    }

    #[test]
    fn key_ignores_directories() {
        let key = spatial_key("/data/masks/32562_5513_dop_mask_tile_0_256.npy").unwrap();
        assert_eq!(key.to_string(), "32562_5513/0_256");
    }

    #[test]
    fn short_names_have_no_key() {
        assert_eq!(spatial_key("32562_5513_1000_1200.npy"), None);
        assert_eq!(spatial_key("a_b_c_d_e.npy"), None);
        assert!(spatial_key("a_b_c_d_e_f").is_some());
    }

    #[test]
    fn matching_is_by_key_not_name() {
        let rasters = vec![
            PathBuf::from("r/32562_5513_dop_raster_tile_0_0.npy"),
            PathBuf::from("r/32562_5513_dop_raster_tile_0_256.npy"),
            PathBuf::from("r/32563_5513_dop_raster_tile_0_0.npy"),
        ];
        let masks = vec![
            PathBuf::from("m/32562_5513_dop_mask_tile_0_256.npy"),
            PathBuf::from("m/32563_5513_dop_mask_tile_0_0.npy"),
            PathBuf::from("m/junk.npy"),
        ];
        let matched = match_keys(&rasters, &key_set(&masks));
        assert_eq!(matched, vec![rasters[1].clone(), rasters[2].clone()]);
    }

    #[test]
    fn unkeyable_candidates_never_match() {
        let reference = key_set(&["x_y_a_b_0_0.npy"]);
        assert!(match_keys(&["0_0.npy", "x_y_0_0.npy"], &reference).is_empty());
    }

    #[test]
    fn duplicates_pass_membership() {
        let candidates = ["o_1_a_mask_5_5.npy", "o_1_b_mask_5_5.npy", "o_1_c_mask_6_6.npy"];
        let reference = key_set(&["o_1_x_raster_5_5.npy"]);
        let matched = match_keys(&candidates, &reference);
        assert_eq!(matched.len(), 2);
        assert_eq!(duplicate_keys(&candidates).len(), 1);
    }

    #[test]
    fn matching_is_deterministic() {
        let candidates: Vec<String> = (0..50).rev().map(|i| format!("o_1_a_mask_{}_{}.npy", i, i)).collect();
        let reference = key_set(&(0..50).step_by(3).map(|i| format!("o_1_r_raster_{}_{}.npy", i, i)).collect::<Vec<_>>());
        let first = match_keys(&candidates, &reference);
        let second = match_keys(&candidates, &reference);
        assert_eq!(first, second);
        assert_eq!(first.len(), 17);
        assert_eq!(first[0], PathBuf::from("o_1_a_mask_48_48.npy"));
    }

    #[test]
    fn pair_up_is_symmetric() {
        let masks = ["o_1_p_mask_0_0.npy", "o_1_p_mask_0_4.npy"];
        let rasters = ["o_1_p_raster_0_4.npy", "o_1_p_raster_4_4.npy"];
        let (m, r) = pair_up(&masks, &rasters);
        assert_eq!(m, vec![PathBuf::from("o_1_p_mask_0_4.npy")]);
        assert_eq!(r, vec![PathBuf::from("o_1_p_raster_0_4.npy")]);
    }
}
