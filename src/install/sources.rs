// src/install/sources.rs

//! Extra local source tarballs
//!
//! A tarball given on the command line is hashed, unpacked once into
//! `<cache>/sources/<sha256>/` and read like a catalog entry. The unpacked
//! directory is reused on later runs.

use crate::error::{Error, Result};
use crate::packages::PackageRecord;
use crate::packages::description::read_description;
use crate::repository::CacheStore;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tar::Archive;
use tracing::{debug, info};

/// An unpacked source tarball
#[derive(Debug, Clone, PartialEq)]
pub struct ExtraSource {
    pub archive: PathBuf,
    pub sha256: String,
    /// Package directory inside the unpacked tree
    pub source_dir: PathBuf,
    pub record: PackageRecord,
}

/// Hash, unpack and read every tarball
pub fn prepare_extra_sources(tarballs: &[PathBuf], cache: &CacheStore) -> Result<Vec<ExtraSource>> {
    tarballs.iter().map(|t| prepare_one(t, cache)).collect()
}

fn prepare_one(archive: &Path, cache: &CacheStore) -> Result<ExtraSource> {
    let sha256 = hash_file(archive)?;
    let target = cache.source_dir(&sha256);

    if target.is_dir() {
        debug!("Reusing unpacked {} at {}", archive.display(), target.display());
    } else {
        unpack(archive, &cache.sources_root(), &target)?;
    }

    let source_dir = package_dir(&target)?;
    let mut record = read_description(&source_dir)?.record;
    record.source_dir = Some(source_dir.clone());

    info!(
        "Extra source {} {} from {}",
        record.name,
        record.version,
        archive.display()
    );
    Ok(ExtraSource {
        archive: archive.to_path_buf(),
        sha256,
        source_dir,
        record,
    })
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|e| Error::IoError(format!("Failed to open {}: {}", path.display(), e)))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .map_err(|e| Error::IoError(format!("Failed to hash {}: {}", path.display(), e)))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Extract into a staging directory next to `target`, then move it into place
fn unpack(archive: &Path, sources_root: &Path, target: &Path) -> Result<()> {
    fs::create_dir_all(sources_root).map_err(|e| {
        Error::IoError(format!("Failed to create {}: {}", sources_root.display(), e))
    })?;

    let staging = tempfile::Builder::new()
        .prefix(".unpack-")
        .tempdir_in(sources_root)
        .map_err(|e| Error::IoError(format!("Failed to create staging dir: {}", e)))?;

    let file = File::open(archive)
        .map_err(|e| Error::IoError(format!("Failed to open {}: {}", archive.display(), e)))?;
    Archive::new(GzDecoder::new(file))
        .unpack(staging.path())
        .map_err(|e| Error::ParseError(format!("Failed to unpack {}: {}", archive.display(), e)))?;

    match fs::rename(staging.path(), target) {
        Ok(()) => {}
        // Another run unpacked the same archive first
        Err(_) if target.is_dir() => {}
        Err(e) => {
            return Err(Error::IoError(format!(
                "Failed to move unpacked {} to {}: {}",
                archive.display(),
                target.display(),
                e
            )));
        }
    }

    debug!("Unpacked {} to {}", archive.display(), target.display());
    Ok(())
}

/// The directory holding `DESCRIPTION`: the root itself or its single child
fn package_dir(root: &Path) -> Result<PathBuf> {
    if root.join("DESCRIPTION").is_file() {
        return Ok(root.to_path_buf());
    }

    let mut candidates = Vec::new();
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if path.join("DESCRIPTION").is_file() {
            candidates.push(path);
        }
    }

    match candidates.len() {
        1 => Ok(candidates.swap_remove(0)),
        0 => Err(Error::ParseError(format!(
            "No DESCRIPTION found in {}",
            root.display()
        ))),
        n => Err(Error::ParseError(format!(
            "{} holds {} package directories, expected one",
            root.display(),
            n
        ))),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::source_tarball;
    use super::*;

    #[test]
    fn test_prepare_extra_source() {
        let work = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(work.path().join("cache"));
        let tarball = source_tarball(work.path(), "mypkg", "0.3.0");

        let sources = prepare_extra_sources(&[tarball.clone()], &cache).unwrap();
        assert_eq!(sources.len(), 1);

        let source = &sources[0];
        assert_eq!(source.record.name, "mypkg");
        assert_eq!(source.record.version, "0.3.0");
        assert_eq!(source.record.imports.len(), 1);
        assert_eq!(source.source_dir, cache.source_dir(&source.sha256).join("mypkg"));
        assert_eq!(source.record.source_dir.as_deref(), Some(source.source_dir.as_path()));
    }

    #[test]
    fn test_existing_extraction_is_reused() {
        let work = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(work.path().join("cache"));
        let tarball = source_tarball(work.path(), "mypkg", "0.3.0");

        let first = prepare_extra_sources(&[tarball.clone()], &cache).unwrap();
        let marker = first[0].source_dir.join("marker");
        fs::write(&marker, "kept").unwrap();

        let second = prepare_extra_sources(&[tarball], &cache).unwrap();
        assert_eq!(first[0].sha256, second[0].sha256);
        assert!(marker.exists());
    }

    #[test]
    fn test_archive_without_description_fails() {
        let work = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(work.path().join("cache"));
        let path = work.path().join("empty.tar.gz");
        let file = File::create(&path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        tar::Builder::new(encoder).into_inner().unwrap().finish().unwrap();

        assert!(matches!(
            prepare_extra_sources(&[path], &cache),
            Err(Error::ParseError(_))
        ));
    }
}
