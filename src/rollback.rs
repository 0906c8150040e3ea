// src/rollback.rs

//! Undo bookkeeping for one install run
//!
//! Before the engine runs, every package about to be replaced is renamed to
//! `__OLD__<name>` in the same library. After a successful run the backups
//! are deleted. After a failed run:
//! - a library the run created is deleted outright
//! - packages that did not exist before the run are deleted
//! - a backup is renamed back only when no valid install sits in its place,
//!   so an update that completed before an unrelated failure is kept

use crate::error::{Error, Result};
use crate::install::library::{
    BACKUP_PREFIX, InstalledPackage, backup_dir, is_valid_install, remove_tree,
};
use crate::install::{InstallPlan, PlanAction};
use crate::nexus::LOCAL_SOURCES_REPOSITORY;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Where an update attempt currently stands on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// Only the active directory exists
    Active,
    /// Only the backup exists
    BackedUp,
    /// Both exist: the new version is being or has been installed
    MidTransition,
}

/// One package replaced by the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateAttempt {
    pub package: String,
    pub active_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub old_version: String,
    pub new_version: String,
}

impl UpdateAttempt {
    fn new(library: &Path, package: &str, old_version: &str, new_version: &str) -> Self {
        Self {
            package: package.to_string(),
            active_dir: library.join(package),
            backup_dir: backup_dir(library, package),
            old_version: old_version.to_string(),
            new_version: new_version.to_string(),
        }
    }

    /// Current state, `None` if neither directory exists
    pub fn state(&self) -> Option<AttemptState> {
        match (self.active_dir.exists(), self.backup_dir.exists()) {
            (true, false) => Some(AttemptState::Active),
            (false, true) => Some(AttemptState::BackedUp),
            (true, true) => Some(AttemptState::MidTransition),
            (false, false) => None,
        }
    }
}

/// Undo information derived from an `InstallPlan`
#[derive(Debug, Clone)]
pub struct RollbackPlan<'a> {
    pub plan: &'a InstallPlan,
    pub universe: BTreeSet<String>,
    /// Packages absent from the library before the run
    pub new_packages: Vec<String>,
    /// Outdated packages being replaced
    pub updates: Vec<UpdateAttempt>,
    /// Installed packages overwritten by an extra source
    pub overwrites: Vec<UpdateAttempt>,
    pub preexisting: &'a BTreeMap<String, InstalledPackage>,
    pub library: &'a Path,
}

impl<'a> RollbackPlan<'a> {
    pub fn new(plan: &'a InstallPlan) -> Self {
        let mut updates = Vec::new();
        let mut overwrites = Vec::new();

        for package in plan.packages.values() {
            if package.action != PlanAction::Update {
                continue;
            }
            let Some(installed) = plan.installed.get(&package.name) else {
                continue;
            };
            let attempt = UpdateAttempt::new(
                &plan.library,
                &package.name,
                &installed.version,
                &package.version,
            );
            if package.repository == LOCAL_SOURCES_REPOSITORY {
                overwrites.push(attempt);
            } else {
                updates.push(attempt);
            }
        }

        Self {
            plan,
            universe: plan.universe(),
            new_packages: plan.new_packages(),
            updates,
            overwrites,
            preexisting: &plan.installed,
            library: &plan.library,
        }
    }

    /// Update and overwrite attempts together
    pub fn attempts(&self) -> impl Iterator<Item = &UpdateAttempt> + '_ {
        self.updates.iter().chain(self.overwrites.iter())
    }
}

/// What a commit or rollback did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackSummary {
    /// Package directories deleted
    pub removed: Vec<String>,
    /// Backups renamed back into place
    pub restored: Vec<String>,
    /// New versions left in place, their backups deleted
    pub kept: Vec<String>,
    pub library_removed: bool,
}

/// Stages backups before a run and settles them afterwards
#[derive(Debug)]
pub struct RollbackCoordinator<'a> {
    plan: RollbackPlan<'a>,
}

impl<'a> RollbackCoordinator<'a> {
    pub fn new(plan: &'a InstallPlan) -> Self {
        Self {
            plan: RollbackPlan::new(plan),
        }
    }

    pub fn plan(&self) -> &RollbackPlan<'a> {
        &self.plan
    }

    /// Move every package about to be replaced to its backup name
    ///
    /// On failure the backups made so far are moved back.
    pub fn stage_backups(&self) -> Result<Vec<String>> {
        for attempt in self.plan.attempts() {
            if attempt.backup_dir.exists() {
                return Err(Error::IoError(format!(
                    "stale backup {} exists; recover the library first",
                    attempt.backup_dir.display()
                )));
            }
        }

        let mut staged: Vec<&UpdateAttempt> = Vec::new();
        for attempt in self.plan.attempts() {
            if !attempt.active_dir.exists() {
                debug!("{} is not in the library, nothing to back up", attempt.package);
                continue;
            }

            if let Err(e) = fs::rename(&attempt.active_dir, &attempt.backup_dir) {
                return Err(unstage(
                    &staged,
                    format!("Failed to back up {}: {}", attempt.package, e),
                ));
            }

            info!(
                package = %attempt.package,
                version = %attempt.old_version,
                action = "backup",
                "Staged backup"
            );
            staged.push(attempt);
        }

        Ok(staged.iter().map(|a| a.package.clone()).collect())
    }

    /// Settle backups after a successful run
    pub fn commit(self) -> Result<RollbackSummary> {
        let mut summary = RollbackSummary::default();
        let mut failures = Vec::new();

        for attempt in self.plan.attempts() {
            if !attempt.backup_dir.exists() {
                continue;
            }
            if is_valid_install(&attempt.active_dir, &attempt.package) {
                match remove_tree(&attempt.backup_dir) {
                    Ok(()) => {
                        info!(package = %attempt.package, action = "cleanup", "Removed backup");
                        summary.kept.push(attempt.package.clone());
                    }
                    Err(e) => failures.push(e.to_string()),
                }
            } else {
                warn!("{} has no valid install after the run, restoring backup", attempt.package);
                match restore(attempt) {
                    Ok(()) => summary.restored.push(attempt.package.clone()),
                    Err(e) => failures.push(e.to_string()),
                }
            }
        }

        finish(summary, failures)
    }

    /// Undo a failed run
    pub fn rollback(self) -> Result<RollbackSummary> {
        let mut summary = RollbackSummary::default();
        let mut failures = Vec::new();
        let library = self.plan.library;

        if self.plan.plan.create_library {
            info!(library = %library.display(), action = "remove-library", "Rolling back");
            return match remove_tree(library) {
                Ok(()) => {
                    summary.library_removed = true;
                    summary.removed = self.plan.new_packages.clone();
                    Ok(summary)
                }
                Err(e) => Err(Error::RollbackFailure(vec![e.to_string()])),
            };
        }

        for name in &self.plan.new_packages {
            let dir = library.join(name);
            if !dir.exists() {
                continue;
            }
            match remove_tree(&dir) {
                Ok(()) => {
                    info!(package = %name, action = "remove", "Rolling back");
                    summary.removed.push(name.clone());
                }
                Err(e) => failures.push(e.to_string()),
            }
        }

        for attempt in self.plan.attempts() {
            match attempt.state() {
                Some(AttemptState::Active) => {
                    debug!("{} was never backed up, leaving it", attempt.package);
                }
                Some(AttemptState::BackedUp) | Some(AttemptState::MidTransition) => {
                    if is_valid_install(&attempt.active_dir, &attempt.package) {
                        info!(
                            package = %attempt.package,
                            version = %attempt.new_version,
                            action = "keep",
                            "Update completed, keeping it"
                        );
                        match remove_tree(&attempt.backup_dir) {
                            Ok(()) => summary.kept.push(attempt.package.clone()),
                            Err(e) => failures.push(e.to_string()),
                        }
                    } else {
                        match restore(attempt) {
                            Ok(()) => summary.restored.push(attempt.package.clone()),
                            Err(e) => failures.push(e.to_string()),
                        }
                    }
                }
                None => failures.push(format!(
                    "{} {} could not be restored: no copy remains",
                    attempt.package, attempt.old_version
                )),
            }
        }

        finish(summary, failures)
    }
}

/// Move staged backups back after staging failed part way
///
/// Returns the staging error, or a `RollbackFailure` naming it and every
/// backup left behind.
fn unstage(staged: &[&UpdateAttempt], cause: String) -> Error {
    let mut failures = Vec::new();
    for done in staged.iter().rev() {
        if let Err(e) = fs::rename(&done.backup_dir, &done.active_dir) {
            warn!("Failed to unstage backup of {}: {}", done.package, e);
            failures.push(format!(
                "{} left at {}: {}",
                done.package,
                done.backup_dir.display(),
                e
            ));
        }
    }

    if failures.is_empty() {
        Error::IoError(cause)
    } else {
        failures.insert(0, cause);
        Error::RollbackFailure(failures)
    }
}

/// Replace whatever is in the active directory with the backup
fn restore(attempt: &UpdateAttempt) -> Result<()> {
    if attempt.active_dir.exists() {
        remove_tree(&attempt.active_dir)?;
    }
    fs::rename(&attempt.backup_dir, &attempt.active_dir).map_err(|e| {
        Error::IoError(format!(
            "Failed to restore {} from {}: {}",
            attempt.package,
            attempt.backup_dir.display(),
            e
        ))
    })?;
    info!(
        package = %attempt.package,
        version = %attempt.old_version,
        action = "restore",
        "Restored backup"
    );
    Ok(())
}

fn finish(summary: RollbackSummary, failures: Vec<String>) -> Result<RollbackSummary> {
    if failures.is_empty() {
        Ok(summary)
    } else {
        Err(Error::RollbackFailure(failures))
    }
}

/// Settle backups left behind by a run that never finished
///
/// A backup whose active directory holds a valid install is deleted;
/// otherwise it is moved back into place. Returns restored package names.
pub fn recover_interrupted(library: &Path) -> Result<Vec<String>> {
    if !library.is_dir() {
        return Ok(Vec::new());
    }

    let mut restored = Vec::new();
    let mut failures = Vec::new();
    for entry in fs::read_dir(library)? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let Some(package) = file_name.strip_prefix(BACKUP_PREFIX) else {
            continue;
        };
        if package.is_empty() {
            continue;
        }

        let attempt = UpdateAttempt::new(library, package, "", "");
        if is_valid_install(&attempt.active_dir, package) {
            warn!("Dropping leftover backup of {}", package);
            if let Err(e) = remove_tree(&attempt.backup_dir) {
                failures.push(e.to_string());
            }
        } else {
            warn!("Restoring {} from an interrupted run", package);
            match restore(&attempt) {
                Ok(()) => restored.push(package.to_string()),
                Err(e) => failures.push(e.to_string()),
            }
        }
    }

    if !failures.is_empty() {
        return Err(Error::RollbackFailure(failures));
    }
    restored.sort();
    Ok(restored)
}
