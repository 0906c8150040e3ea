// src/error.rs

use thiserror::Error;

/// A package the nexus could not find, with close matches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingPackage {
    pub name: String,
    pub suggestions: Vec<String>,
}

/// One package whose external build step did not succeed
#[derive(Debug, Clone)]
pub struct FailedInstall {
    pub package: String,
    /// Exit status of the build tool, `None` when it never ran or was killed
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Failure before the build tool ran (download, cancellation, ...)
    pub reason: Option<String>,
}

/// Core error types for statpkg
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid override or settings reference
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Every tracked variant of a repository failed to fetch
    #[error("Repository '{repository}' is unavailable: {}", .reasons.join("; "))]
    RepositoryUnavailable {
        repository: String,
        reasons: Vec<String>,
    },

    /// Requested packages not present in any repository
    #[error("Package(s) not found: {}", describe_missing(.0))]
    PackageNotFound(Vec<MissingPackage>),

    /// The dependency graph cannot be layered
    #[error("Circular dependency among: {}", .0.join(", "))]
    CircularDependency(Vec<String>),

    /// The external build tool failed for one or more packages
    #[error("Installation failed for: {}", describe_failed(.0))]
    InstallationFailure(Vec<FailedInstall>),

    /// Recovery after a failed install did not complete
    #[error("Rollback failed: {}", .0.join("; "))]
    RollbackFailure(Vec<String>),

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O error with path context
    #[error("I/O error: {0}")]
    IoError(String),

    /// Catalog or package download failure
    #[error("Download error: {0}")]
    DownloadError(String),

    /// Malformed catalog, DESCRIPTION or version string
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Cache store could not be read or written
    #[error("Cache error: {0}")]
    CacheError(String),

    /// A cancellation token fired or its deadline passed
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),
}

fn describe_missing(missing: &[MissingPackage]) -> String {
    missing
        .iter()
        .map(|m| {
            if m.suggestions.is_empty() {
                m.name.clone()
            } else {
                format!("{} (did you mean: {}?)", m.name, m.suggestions.join(", "))
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_failed(failed: &[FailedInstall]) -> String {
    failed
        .iter()
        .map(|f| match (f.status, &f.reason) {
            (_, Some(reason)) => format!("{} ({})", f.package, reason),
            (Some(code), None) => format!("{} (exit status {})", f.package, code),
            (None, None) => f.package.clone(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Names of packages that failed to install, empty for other variants
    pub fn failed_packages(&self) -> Vec<&str> {
        match self {
            Error::InstallationFailure(failed) => {
                failed.iter().map(|f| f.package.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Result type alias using statpkg's Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message_includes_suggestions() {
        let err = Error::PackageNotFound(vec![MissingPackage {
            name: "dplyer".to_string(),
            suggestions: vec!["dplyr".to_string()],
        }]);
        assert_eq!(
            err.to_string(),
            "Package(s) not found: dplyer (did you mean: dplyr?)"
        );
    }

    #[test]
    fn test_installation_failure_lists_every_package() {
        let err = Error::InstallationFailure(vec![
            FailedInstall {
                package: "a".to_string(),
                status: Some(1),
                stdout: String::new(),
                stderr: "boom".to_string(),
                reason: None,
            },
            FailedInstall {
                package: "b".to_string(),
                status: None,
                stdout: String::new(),
                stderr: String::new(),
                reason: Some("download failed".to_string()),
            },
        ]);
        assert_eq!(err.failed_packages(), vec!["a", "b"]);
        let msg = err.to_string();
        assert!(msg.contains("a (exit status 1)"));
        assert!(msg.contains("b (download failed)"));
    }
}
