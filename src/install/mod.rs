// src/install/mod.rs

//! Installation pipeline
//!
//! This module provides functionality for:
//! - Scanning the target library
//! - Unpacking extra source tarballs
//! - Planning which packages to install, update or skip
//! - Fetching archives and running the build tool on a worker pool

pub mod build_tool;
pub mod download;
pub mod engine;
pub mod library;
pub mod planner;
pub mod sources;

pub use build_tool::{BuildOutput, BuildRequest, BuildTool, RCommand};
pub use download::{DownloadTracker, PackageFetcher};
pub use engine::{
    EngineConfig, InstallOutcome, InstallReport, InstallRequest, InstallUpdate,
    InstallationEngine, PackageState,
};
pub use library::{BACKUP_PREFIX, InstalledPackage, is_valid_install, scan_library};
pub use planner::{
    InstallPlan, InstallPlanner, OutdatedPackage, PackageRelation, PackageSettings,
    PackageSource, PlanAction, PlannedPackage, PlannerConfig,
};
pub use sources::{ExtraSource, prepare_extra_sources};
