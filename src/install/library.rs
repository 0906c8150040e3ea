// src/install/library.rs

//! Installed-library inspection

use crate::error::{Error, Result};
use crate::packages::description::read_description;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directory-name prefix marking a backup made before an update
pub const BACKUP_PREFIX: &str = "__OLD__";

/// A package found in the target library
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
    /// Whether statpkg installed it
    pub managed: bool,
    pub path: PathBuf,
}

/// Backup directory for a package in `library`
pub fn backup_dir(library: &Path, package: &str) -> PathBuf {
    library.join(format!("{}{}", BACKUP_PREFIX, package))
}

/// Scan a library directory, keyed by package name
///
/// A missing library is an empty library. Directories without a readable
/// `DESCRIPTION` and backup directories are skipped.
pub fn scan_library(library: &Path) -> Result<BTreeMap<String, InstalledPackage>> {
    if !library.is_dir() {
        return Ok(BTreeMap::new());
    }

    let entries = fs::read_dir(library)
        .map_err(|e| Error::IoError(format!("Failed to read library {}: {}", library.display(), e)))?;

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(BACKUP_PREFIX) || name.starts_with('.') {
            continue;
        }
        if entry.file_type()?.is_dir() {
            dirs.push((name, entry.path()));
        }
    }

    let installed: Vec<InstalledPackage> = dirs
        .par_iter()
        .filter_map(|(dir_name, path)| match read_description(path) {
            Ok(desc) => {
                if desc.record.name != *dir_name {
                    warn!(
                        "{} declares package {}, skipping",
                        path.display(),
                        desc.record.name
                    );
                    return None;
                }
                Some(InstalledPackage {
                    name: desc.record.name,
                    version: desc.record.version,
                    managed: desc.install_agent.is_some(),
                    path: path.clone(),
                })
            }
            Err(e) => {
                debug!("Skipping {}: {}", path.display(), e);
                None
            }
        })
        .collect();

    debug!("Found {} installed packages in {}", installed.len(), library.display());
    Ok(installed.into_iter().map(|p| (p.name.clone(), p)).collect())
}

/// Whether `dir` holds a complete statpkg install of `package`
///
/// The build tool writes `DESCRIPTION` last and statpkg stamps it after the
/// tool succeeds, so an interrupted or failed install never passes.
pub fn is_valid_install(dir: &Path, package: &str) -> bool {
    match read_description(dir) {
        Ok(desc) => desc.record.name == package && desc.install_agent.is_some(),
        Err(_) => false,
    }
}

/// Remove a directory tree if it exists
pub(crate) fn remove_tree(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    fs::remove_dir_all(path)
        .map_err(|e| Error::IoError(format!("Failed to remove {}: {}", path.display(), e)))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::fs;
    use std::path::Path;

    /// Write `<library>/<name>/DESCRIPTION`, optionally stamped as managed
    pub fn install_fake(library: &Path, name: &str, version: &str, managed: bool) {
        let dir = library.join(name);
        fs::create_dir_all(&dir).unwrap();
        let mut body = format!("Package: {}\nVersion: {}\n", name, version);
        if managed {
            body.push_str("InstallAgent: statpkg/test\nInstallRepository: CRAN\n");
        }
        fs::write(dir.join("DESCRIPTION"), body).unwrap();
    }
}
