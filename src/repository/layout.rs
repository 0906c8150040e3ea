// src/repository/layout.rs

//! Repository directory layout
//!
//! Catalog and archive locations depend on the distribution variant, the
//! host platform and the language's `major.minor` version.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Distribution form of a package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceVariant {
    Source,
    Binary,
}

impl SourceVariant {
    pub fn as_str(&self) -> &str {
        match self {
            SourceVariant::Source => "source",
            SourceVariant::Binary => "binary",
        }
    }
}

impl fmt::Display for SourceVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceVariant {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "source" => Ok(SourceVariant::Source),
            "binary" => Ok(SourceVariant::Binary),
            _ => Err(format!("Invalid source variant: {}", s)),
        }
    }
}

/// Host platform, which decides binary availability and archive formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
}

impl Platform {
    /// Platform this binary was compiled for
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }

    pub fn supports_binary(&self) -> bool {
        !matches!(self, Platform::Linux)
    }

    /// Variants worth tracking on this platform
    pub fn tracked_variants(&self) -> Vec<SourceVariant> {
        if self.supports_binary() {
            vec![SourceVariant::Source, SourceVariant::Binary]
        } else {
            vec![SourceVariant::Source]
        }
    }

    fn binary_dir(&self) -> Option<&'static str> {
        match self {
            Platform::Linux => None,
            Platform::MacOs => Some("bin/macosx"),
            Platform::Windows => Some("bin/windows"),
        }
    }

    fn binary_extension(&self) -> &'static str {
        match self {
            Platform::Windows => "zip",
            _ => "tgz",
        }
    }
}

/// Reduce a full language version (`4.3.2`) to the `major.minor` used in paths
pub fn minor_version(version: &str) -> String {
    version.split('.').take(2).collect::<Vec<_>>().join(".")
}

/// Directory holding the catalog and archives for one variant
pub fn contrib_location(
    repo_location: &str,
    variant: SourceVariant,
    platform: Platform,
    language_version: &str,
) -> Option<String> {
    let base = repo_location.trim_end_matches('/');
    match variant {
        SourceVariant::Source => Some(format!("{}/src/contrib", base)),
        SourceVariant::Binary => platform.binary_dir().map(|dir| {
            format!("{}/{}/contrib/{}", base, dir, minor_version(language_version))
        }),
    }
}

/// Catalog file locations to try, compressed first
pub fn catalog_locations(
    repo_location: &str,
    variant: SourceVariant,
    platform: Platform,
    language_version: &str,
) -> Option<Vec<String>> {
    contrib_location(repo_location, variant, platform, language_version).map(|contrib| {
        vec![
            format!("{}/PACKAGES.gz", contrib),
            format!("{}/PACKAGES", contrib),
        ]
    })
}

/// File name of a package archive
pub fn archive_file_name(
    name: &str,
    version: &str,
    variant: SourceVariant,
    platform: Platform,
) -> String {
    match variant {
        SourceVariant::Source => format!("{}_{}.tar.gz", name, version),
        SourceVariant::Binary => format!("{}_{}.{}", name, version, platform.binary_extension()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_catalog_location() {
        let locs = catalog_locations(
            "https://cran.r-project.org/",
            SourceVariant::Source,
            Platform::Linux,
            "4.3.2",
        )
        .unwrap();
        assert_eq!(locs[0], "https://cran.r-project.org/src/contrib/PACKAGES.gz");
        assert_eq!(locs[1], "https://cran.r-project.org/src/contrib/PACKAGES");
    }

    #[test]
    fn test_binary_catalog_location() {
        let loc = contrib_location("https://cran.example", SourceVariant::Binary, Platform::MacOs, "4.3.2");
        assert_eq!(loc.as_deref(), Some("https://cran.example/bin/macosx/contrib/4.3"));

        let loc = contrib_location("/srv/repo", SourceVariant::Binary, Platform::Windows, "4.2");
        assert_eq!(loc.as_deref(), Some("/srv/repo/bin/windows/contrib/4.2"));

        assert!(contrib_location("/srv/repo", SourceVariant::Binary, Platform::Linux, "4.2").is_none());
    }

    #[test]
    fn test_archive_names() {
        assert_eq!(
            archive_file_name("glue", "1.7.0", SourceVariant::Source, Platform::MacOs),
            "glue_1.7.0.tar.gz"
        );
        assert_eq!(
            archive_file_name("glue", "1.7.0", SourceVariant::Binary, Platform::Windows),
            "glue_1.7.0.zip"
        );
    }

    #[test]
    fn test_linux_tracks_source_only() {
        assert_eq!(Platform::Linux.tracked_variants(), vec![SourceVariant::Source]);
        assert_eq!(Platform::MacOs.tracked_variants().len(), 2);
    }

    #[test]
    fn test_variant_parse() {
        assert_eq!("binary".parse::<SourceVariant>().unwrap(), SourceVariant::Binary);
        assert!("wheel".parse::<SourceVariant>().is_err());
    }
}
