// src/packages/description.rs

//! DCF metadata parsing
//!
//! Repository catalogs (`PACKAGES`) and installed `DESCRIPTION` files share
//! an RFC 822-like format: records separated by blank lines, `Key: value`
//! fields, and indented continuation lines.

use super::{DependencySpec, PackageRecord};
use crate::error::{Error, Result};
use crate::version::VersionConstraint;
use serde::Deserialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{debug, warn};

/// Field stamped into `DESCRIPTION` by statpkg after a successful install
pub const INSTALL_AGENT_FIELD: &str = "InstallAgent";

/// Field recording which repository the installed copy came from
pub const INSTALL_REPOSITORY_FIELD: &str = "InstallRepository";

/// Catalog entry structure for rfc822-like parsing
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescriptionEntry {
    package: String,
    version: String,
    #[serde(default)]
    depends: Option<String>,
    #[serde(default)]
    imports: Option<String>,
    #[serde(default)]
    linking_to: Option<String>,
    #[serde(default)]
    suggests: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    install_agent: Option<String>,
}

impl DescriptionEntry {
    fn into_record(self) -> (PackageRecord, Option<String>) {
        let mut record = PackageRecord::new(collapse(&self.package), collapse(&self.version));
        record.depends = self.depends.as_deref().map(parse_dependency_list).unwrap_or_default();
        record.imports = self.imports.as_deref().map(parse_dependency_list).unwrap_or_default();
        record.linking_to = self
            .linking_to
            .as_deref()
            .map(parse_dependency_list)
            .unwrap_or_default();
        record.suggests = self.suggests.as_deref().map(parse_dependency_list).unwrap_or_default();
        record.path = self.path.map(|s| collapse(&s));

        (record, self.install_agent.map(|s| collapse(&s)))
    }
}

/// Collapse indentation and line breaks of a continued value into single spaces
fn collapse(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_entries(content: &str) -> Result<Vec<DescriptionEntry>> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    rfc822_like::from_str(content)
        .map_err(|e| Error::ParseError(format!("Failed to parse package records: {}", e)))
}

/// Parse a repository catalog into package records
pub fn parse_catalog(content: &str) -> Result<Vec<PackageRecord>> {
    let entries = parse_entries(content)?;
    debug!("Parsed {} catalog entries", entries.len());

    Ok(entries
        .into_iter()
        .map(|entry| entry.into_record().0)
        .collect())
}

/// Metadata read from an installed package's `DESCRIPTION`
#[derive(Debug, Clone)]
pub struct InstalledDescription {
    pub record: PackageRecord,
    /// Value of the `InstallAgent` field, present when statpkg installed it
    pub install_agent: Option<String>,
}

/// Parse a single `DESCRIPTION` file's content
pub fn parse_description(content: &str) -> Result<InstalledDescription> {
    let mut entries = parse_entries(content)?;
    if entries.len() > 1 {
        warn!("DESCRIPTION holds {} records, using the first", entries.len());
    }
    if entries.is_empty() {
        return Err(Error::ParseError("DESCRIPTION is empty".to_string()));
    }

    let (record, install_agent) = entries.swap_remove(0).into_record();
    Ok(InstalledDescription {
        record,
        install_agent,
    })
}

/// Read and parse `<dir>/DESCRIPTION`
pub fn read_description(package_dir: &Path) -> Result<InstalledDescription> {
    let path = package_dir.join("DESCRIPTION");
    let bytes = std::fs::read(&path)
        .map_err(|e| Error::IoError(format!("Failed to read {}: {}", path.display(), e)))?;

    // DESCRIPTION files may declare a non-UTF-8 encoding
    parse_description(&String::from_utf8_lossy(&bytes))
}

/// Append statpkg's install fields to an installed package's `DESCRIPTION`
pub fn stamp_description(package_dir: &Path, agent: &str, repository: &str) -> Result<()> {
    let path = package_dir.join("DESCRIPTION");
    let existing = std::fs::read(&path)
        .map_err(|e| Error::IoError(format!("Failed to read {}: {}", path.display(), e)))?;

    let mut file = OpenOptions::new()
        .append(true)
        .open(&path)
        .map_err(|e| Error::IoError(format!("Failed to open {}: {}", path.display(), e)))?;

    let mut stamp = String::new();
    if !existing.ends_with(b"\n") && !existing.is_empty() {
        stamp.push('\n');
    }
    stamp.push_str(&format!("{}: {}\n", INSTALL_AGENT_FIELD, agent));
    stamp.push_str(&format!("{}: {}\n", INSTALL_REPOSITORY_FIELD, repository));

    file.write_all(stamp.as_bytes())
        .map_err(|e| Error::IoError(format!("Failed to write {}: {}", path.display(), e)))?;
    Ok(())
}

/// Parse a dependency field
/// Format: "R (>= 3.5.0), methods, Rcpp (>= 1.0.0)"
pub fn parse_dependency_list(field: &str) -> Vec<DependencySpec> {
    let field = collapse(field);
    let mut dependencies = Vec::new();

    for entry in field.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        if let Some(dep) = parse_dependency(entry) {
            dependencies.push(dep);
        }
    }

    dependencies
}

/// Parse a single dependency entry
/// Format: "package (>= 1.0)" or "package"
fn parse_dependency(entry: &str) -> Option<DependencySpec> {
    let Some(paren_pos) = entry.find('(') else {
        return Some(DependencySpec::new(entry.trim()));
    };

    let name = entry[..paren_pos].trim();
    if name.is_empty() {
        return None;
    }

    let constraint_text = entry[paren_pos + 1..].trim_end().trim_end_matches(')');
    match VersionConstraint::parse(constraint_text) {
        Ok(constraint) => Some(DependencySpec::versioned(name, constraint)),
        Err(e) => {
            warn!("Ignoring unparseable constraint on {}: {}", name, e);
            Some(DependencySpec::new(name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::ConstraintOp;

    const CATALOG: &str = "\
Package: A3
Version: 1.0.0
Depends: R (>= 2.15.0), xtable, pbapply
Suggests: randomForest, e1071
License: GPL (>= 2)
MD5sum: 027ebdd8affce8f0effaecfcd5f5ade2
NeedsCompilation: no

Package: abc
Version: 2.2.1
Depends: R (>= 2.10), abc.data, nnet, quantreg, MASS,
        locfit
Imports: grDevices, graphics, stats
LinkingTo: Rcpp (>= 1.0.0)
NeedsCompilation: yes
";

    #[test]
    fn test_parse_catalog_records() {
        let records = parse_catalog(CATALOG).unwrap();
        assert_eq!(records.len(), 2);

        let a3 = &records[0];
        assert_eq!(a3.name, "A3");
        assert_eq!(a3.version, "1.0.0");
        assert_eq!(a3.depends.len(), 3);
        assert_eq!(a3.suggests.len(), 2);

        let abc = &records[1];
        let names: Vec<_> = abc.depends.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["R", "abc.data", "nnet", "quantreg", "MASS", "locfit"]);
        assert_eq!(abc.linking_to[0].name, "Rcpp");
    }

    #[test]
    fn test_parse_empty_catalog() {
        assert!(parse_catalog("\n\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_dependency_constraints() {
        let deps = parse_dependency_list("R (>= 3.5.0), methods,Rcpp (>=1.0.0)");
        assert_eq!(deps.len(), 3);
        let r = deps[0].constraint.as_ref().unwrap();
        assert_eq!(r.op, ConstraintOp::GreaterEqual);
        assert_eq!(r.version.as_str(), "3.5.0");
        assert!(deps[1].constraint.is_none());
        assert_eq!(deps[2].name, "Rcpp");
        assert!(deps[2].constraint.is_some());
    }

    #[test]
    fn test_parse_dependency_with_line_breaks() {
        let deps = parse_dependency_list("rlang (>=\n    1.1.0),\n  vctrs");
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].constraint.as_ref().unwrap().to_string(), ">= 1.1.0");
    }

    #[test]
    fn test_stamp_and_read_description() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("DESCRIPTION"),
            "Package: glue\nVersion: 1.7.0\nImports: methods",
        )
        .unwrap();

        let before = read_description(dir.path()).unwrap();
        assert!(before.install_agent.is_none());

        stamp_description(dir.path(), "statpkg/0.1.0", "CRAN").unwrap();
        let after = read_description(dir.path()).unwrap();
        assert_eq!(after.record.name, "glue");
        assert_eq!(after.install_agent.as_deref(), Some("statpkg/0.1.0"));
    }
}
