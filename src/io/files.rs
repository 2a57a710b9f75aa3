//! File enumeration and export copies.
//!
//! Listings are always sorted lexicographically by full path so that every
//! stage sees the same order on every run and platform.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use glob::glob;
use log::{info, warn};

/// Files directly under `dir` with one of `extensions` (without dot, case-sensitive).
pub fn list_files(dir: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(anyhow!("Not a directory: {:?}", dir));
    }
    let mut files = Vec::new();
    for ext in extensions {
        let pattern = dir.join(format!("*.{}", ext)).to_string_lossy().to_string();
        for entry in glob(&pattern)? {
            match entry {
                Ok(path) if path.is_file() => files.push(path),
                Ok(_) => {}
                Err(e) => warn!("Bad path from glob: {:?}", e),
            }
        }
    }
    files.sort();
    files.dedup();
    info!("Found {} {:?} file(s) in {:?}", files.len(), extensions, dir);
    Ok(files)
}

/// Copy `file` into `dest_dir` under its own name, creating the directory if needed.
pub fn copy_into(file: &Path, dest_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dest_dir).with_context(|| format!("Failed to create {:?}", dest_dir))?;
    let name = file
        .file_name()
        .ok_or_else(|| anyhow!("{:?} has no file name", file))?;
    let dest = dest_dir.join(name);
    fs::copy(file, &dest).with_context(|| format!("Failed to copy {:?} to {:?}", file, dest))?;
    Ok(dest)
}
