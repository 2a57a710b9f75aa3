//! Foreground statistics over mask tiles and the tiered selections built on them.
//!
//! Tiers:
//! - `all`: every mask with readable statistics
//! - `above_zero`: masks with at least one foreground pixel
//! - `above_median`: masks whose count exceeds the median count of the
//!   `above_zero` tier (zero-count masks never take part in the median)

use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use indicatif::ProgressBar;
use log::{debug, error, info, warn};
use rayon::prelude::*;

use crate::error::PrepError;
use crate::io::npy::NpyMmap;
use crate::keys;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelStat {
    pub foreground_count: u64,
    /// Foreground share of all cells, 0 for empty masks.
    pub foreground_density: f64,
}

impl PixelStat {
    pub fn new(foreground_count: u64, cells: u64) -> Self {
        let foreground_density = if cells == 0 {
            0.0
        } else {
            foreground_count as f64 / cells as f64
        };
        PixelStat {
            foreground_count,
            foreground_density,
        }
    }
}

/// Statistics of one mask tile, read through a memory map.
pub fn mask_stat(path: &Path) -> Result<PixelStat> {
    let npy = NpyMmap::open(path)?;
    let count = npy.count_nonzero()?;
    Ok(PixelStat::new(count, npy.header().len() as u64))
}

/// Per-file statistics in input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PixelStats {
    entries: Vec<(PathBuf, PixelStat)>,
    skipped: Vec<PathBuf>,
}

impl PixelStats {
    /// Build from precomputed entries; a path may appear only once.
    pub fn from_entries(entries: Vec<(PathBuf, PixelStat)>) -> Result<Self, PrepError> {
        reject_duplicates(entries.iter().map(|(p, _)| p))?;
        Ok(PixelStats {
            entries,
            skipped: Vec::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, &PixelStat)> {
        self.entries.iter().map(|(p, s)| (p.as_path(), s))
    }

    pub fn get(&self, path: &Path) -> Option<&PixelStat> {
        self.entries.iter().find(|(p, _)| p == path).map(|(_, s)| s)
    }

    /// Files that could not be read and carry no statistics.
    pub fn skipped(&self) -> &[PathBuf] {
        &self.skipped
    }

    /// Files whose statistics satisfy `predicate`, in input order.
    pub fn select<F: Fn(&PixelStat) -> bool>(&self, predicate: F) -> Vec<PathBuf> {
        self.entries
            .iter()
            .filter(|(_, s)| predicate(s))
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Median foreground count over masks with a non-zero count.
    pub fn median_nonzero(&self) -> Option<f64> {
        let counts: Vec<u64> = self
            .entries
            .iter()
            .map(|(_, s)| s.foreground_count)
            .filter(|&c| c > 0)
            .collect();
        median(&counts)
    }

    pub fn select_tier(&self, tier: Tier) -> Vec<PathBuf> {
        match tier {
            Tier::All => self.select(|_| true),
            Tier::AboveZero => self.select(|s| s.foreground_count > 0),
            Tier::AboveMedian => match self.median_nonzero() {
                Some(median) => self.select(|s| s.foreground_count as f64 > median),
                None => Vec::new(),
            },
        }
    }
}

fn reject_duplicates<'a, I: IntoIterator<Item = &'a PathBuf>>(paths: I) -> Result<(), PrepError> {
    let mut seen = HashSet::new();
    for path in paths {
        if !seen.insert(path) {
            return Err(PrepError::DuplicateMask(path.clone()));
        }
    }
    Ok(())
}

/// Median with the mean of the two middle values for even lengths.
pub fn median(values: &[u64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] as f64 + sorted[mid] as f64) / 2.0)
    } else {
        Some(sorted[mid] as f64)
    }
}

pub fn compute_stats(files: &[PathBuf]) -> Result<PixelStats> {
    compute_stats_with_progress(files, &ProgressBar::hidden())
}

/// Statistics for every mask file, computed in parallel.
///
/// Unreadable files are logged and listed in [`PixelStats::skipped`]; the call
/// fails only when no file at all could be read.
pub fn compute_stats_with_progress(files: &[PathBuf], pb: &ProgressBar) -> Result<PixelStats> {
    reject_duplicates(files)?;

    pb.set_length(files.len() as u64);
    let results: Vec<(PathBuf, Result<PixelStat>)> = files
        .par_iter()
        .map(|path| {
            let stat = std::panic::catch_unwind(AssertUnwindSafe(|| mask_stat(path)))
                .unwrap_or_else(|_| Err(anyhow!("Panic occurred while reading {:?}", path)));
            pb.inc(1);
            (path.clone(), stat)
        })
        .collect();

    let mut stats = PixelStats::default();
    for (path, result) in results {
        match result {
            Ok(stat) => stats.entries.push((path, stat)),
            Err(e) => {
                error!("Skipping mask {:?}: {:#}", path, e);
                stats.skipped.push(path);
            }
        }
    }

    if stats.is_empty() && !files.is_empty() {
        return Err(anyhow!("None of the {} mask file(s) could be read", files.len()));
    }
    if let Some((path, stat)) = stats.iter().next() {
        debug!("Example entry: {:?} -> {:?}", path, stat);
    }
    info!(
        "Computed statistics for {} mask(s), skipped {}",
        stats.len(),
        stats.skipped.len()
    );
    Ok(stats)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    All,
    AboveZero,
    AboveMedian,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::All, Tier::AboveZero, Tier::AboveMedian];

    /// Directory name used for exports.
    pub fn name(&self) -> &'static str {
        match self {
            Tier::All => "all",
            Tier::AboveZero => "above_zero",
            Tier::AboveMedian => "above_median",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Masks of a tier and their raster partners, joined by spatial key.
#[derive(Debug, Clone, PartialEq)]
pub struct TierSelection {
    pub tier: Tier,
    pub masks: Vec<PathBuf>,
    pub rasters: Vec<PathBuf>,
}

impl TierSelection {
    pub fn is_empty(&self) -> bool {
        self.masks.is_empty() && self.rasters.is_empty()
    }
}

/// One selection per tier, each re-matched against the full raster collection.
pub fn select_tiers(stats: &PixelStats, rasters: &[PathBuf]) -> Vec<TierSelection> {
    Tier::ALL
        .iter()
        .map(|&tier| {
            let selected = stats.select_tier(tier);
            let (masks, rasters) = keys::pair_up(&selected, rasters);
            if masks.len() < selected.len() {
                warn!(
                    "Tier {}: {} of {} mask(s) have no matching raster",
                    tier,
                    selected.len() - masks.len(),
                    selected.len()
                );
            }
            info!("Tier {}: {} mask(s), {} raster(s)", tier, masks.len(), rasters.len());
            TierSelection { tier, masks, rasters }
        })
        .collect()
}
