// src/lib.rs

//! statpkg Package Manager
//!
//! Installs R-style packages from several repositories into a package
//! library, building independent packages in parallel and restoring the
//! library when a run fails.
//!
//! # Architecture
//!
//! - Repositories: catalogs read over HTTP or from disk, cached per fingerprint
//! - Nexus: ordered lookup across repositories with per-package pins
//! - Resolver: dependency graph and layering into parallel install batches
//! - Install: planning against the library, then a worker pool per layer
//! - Rollback: backups staged before a run, restored or purged after it
//! - Ledger: every run and its per-package outcome recorded in SQLite

pub mod cancel;
pub mod config;
pub mod db;
mod error;
pub mod install;
pub mod nexus;
pub mod ops;
pub mod packages;
pub mod repository;
pub mod resolver;
pub mod rollback;
pub mod version;

pub use cancel::CancelToken;
pub use config::Config;
pub use error::{Error, FailedInstall, MissingPackage, Result};
