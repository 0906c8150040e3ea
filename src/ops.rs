// src/ops.rs

//! End-to-end operations behind the CLI
//!
//! `install` runs the whole pipeline: recover stray backups, unpack extra
//! sources, build the nexus, plan, stage backups, run the engine, then commit
//! or roll back, recording the run in the ledger when one is configured.

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::db::{
    self,
    models::{InstallRun, PackageOutcome, RunPackage, RunStatus},
};
use crate::error::{Error, Result};
use crate::install::{
    BuildTool, ExtraSource, InstallPlan, InstallPlanner, InstallReport, InstallationEngine,
    PackageFetcher, PackageState, PlanAction, prepare_extra_sources,
};
use crate::nexus::PackageNexus;
use crate::rollback::{RollbackCoordinator, RollbackSummary, recover_interrupted};
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// What an install run did
#[derive(Debug)]
pub struct InstallSummary {
    pub plan: InstallPlan,
    /// `None` when there was nothing to do
    pub report: Option<InstallReport>,
    /// Backups restored from an earlier interrupted run
    pub recovered: Vec<String>,
    /// Backups settled after the run
    pub settled: RollbackSummary,
    pub run_id: Option<i64>,
}

/// Fetch every configured repository into a nexus
pub fn build_nexus(config: &Config, cancel: &CancelToken) -> Result<PackageNexus> {
    config.validate()?;
    let ctx = config.fetch_context(cancel)?;
    PackageNexus::build(config.repositories.clone(), config.nexus.clone(), &ctx)
}

/// Plan without touching the library
pub fn plan<S: AsRef<str>>(
    config: &Config,
    packages: &[S],
    tarballs: &[PathBuf],
    cancel: &CancelToken,
) -> Result<InstallPlan> {
    let extra_sources = prepare_extra_sources(tarballs, &config.cache())?;
    let mut nexus = build_nexus(config, cancel)?;
    InstallPlanner::new(config.planner_config()).plan(&mut nexus, packages, extra_sources)
}

/// Install `packages` and every extra source tarball into the library
pub fn install<S: AsRef<str>>(
    config: &Config,
    packages: &[S],
    tarballs: &[PathBuf],
    tool: &dyn BuildTool,
    cancel: &CancelToken,
) -> Result<InstallSummary> {
    let recovered = recover_interrupted(&config.library)?;
    if !recovered.is_empty() {
        warn!("Recovered backups from an interrupted run: {}", recovered.join(", "));
    }

    let extra_sources = prepare_extra_sources(tarballs, &config.cache())?;
    let mut nexus = build_nexus(config, cancel)?;
    let mut summary = install_with_nexus(config, &mut nexus, packages, extra_sources, tool, cancel)?;
    summary.recovered = recovered;
    Ok(summary)
}

/// Install against an already assembled nexus
pub fn install_with_nexus<S: AsRef<str>>(
    config: &Config,
    nexus: &mut PackageNexus,
    packages: &[S],
    extra_sources: Vec<ExtraSource>,
    tool: &dyn BuildTool,
    cancel: &CancelToken,
) -> Result<InstallSummary> {
    let plan = InstallPlanner::new(config.planner_config()).plan(nexus, packages, extra_sources)?;

    if !plan.has_work() {
        info!("All requested packages are installed and current");
        return Ok(InstallSummary {
            plan,
            report: None,
            recovered: Vec::new(),
            settled: RollbackSummary::default(),
            run_id: None,
        });
    }

    let mut ledger = Ledger::open(config.db_path.as_deref(), &plan)?;

    let coordinator = RollbackCoordinator::new(&plan);
    if let Err(e) = coordinator.stage_backups() {
        ledger.finish(&plan, RunStatus::Failed, &BTreeMap::new(), Some(&e.to_string()))?;
        return Err(e);
    }

    let fetcher = PackageFetcher::new(config.client()?, config.cache().downloads_root());
    let engine = InstallationEngine::new(config.engine.clone(), tool, &fetcher)
        .with_cancel(cancel.clone());

    match engine.run(&plan) {
        Ok(report) => {
            let outcomes = report_outcomes(&report);
            let settled = match coordinator.commit() {
                Ok(settled) => settled,
                Err(e) => {
                    error!("Install finished but backups could not be settled: {}", e);
                    ledger.finish(&plan, RunStatus::Failed, &outcomes, Some(&e.to_string()))?;
                    return Err(e);
                }
            };
            ledger.finish(&plan, RunStatus::Applied, &outcomes, None)?;
            info!(
                "Installed {} packages, {} already current",
                report.installed().len(),
                report.skipped().len()
            );
            Ok(InstallSummary {
                plan,
                report: Some(report),
                recovered: Vec::new(),
                settled,
                run_id: ledger.run_id(),
            })
        }
        Err(failure) => {
            error!("Install failed, rolling back: {}", failure);
            let outcome = coordinator.rollback();
            let mut outcomes = BTreeMap::new();
            for name in failure.failed_packages() {
                outcomes.insert(name.to_string(), PackageOutcome::Failed);
            }

            match outcome {
                Ok(settled) => {
                    log_rollback(&settled);
                    for name in settled.removed.iter().chain(&settled.restored) {
                        outcomes
                            .entry(name.clone())
                            .or_insert(PackageOutcome::RolledBack);
                    }
                    for name in &settled.kept {
                        outcomes
                            .entry(name.clone())
                            .or_insert(PackageOutcome::Succeeded);
                    }
                    ledger.finish(
                        &plan,
                        RunStatus::RolledBack,
                        &outcomes,
                        Some(&failure.to_string()),
                    )?;
                    Err(failure)
                }
                Err(Error::RollbackFailure(mut reasons)) => {
                    reasons.insert(0, format!("after {}", failure));
                    let err = Error::RollbackFailure(reasons);
                    ledger.finish(&plan, RunStatus::Failed, &outcomes, Some(&err.to_string()))?;
                    Err(err)
                }
                Err(other) => {
                    ledger.finish(&plan, RunStatus::Failed, &outcomes, Some(&other.to_string()))?;
                    Err(other)
                }
            }
        }
    }
}

/// Settle backups left by an interrupted run
pub fn recover(config: &Config) -> Result<Vec<String>> {
    recover_interrupted(&config.library)
}

/// Recorded runs, newest first, with their packages
pub fn history(db_path: &Path) -> Result<Vec<(InstallRun, Vec<RunPackage>)>> {
    let path = db_path.to_string_lossy();
    if !db_path.exists() {
        return Ok(Vec::new());
    }
    let conn = db::open(&path)?;
    db::schema::migrate(&conn)?;

    InstallRun::list_all(&conn)?
        .into_iter()
        .map(|run| {
            let packages = match run.id {
                Some(id) => RunPackage::find_by_run(&conn, id)?,
                None => Vec::new(),
            };
            Ok((run, packages))
        })
        .collect()
}

fn report_outcomes(report: &InstallReport) -> BTreeMap<String, PackageOutcome> {
    report
        .states
        .iter()
        .map(|(name, state)| {
            let outcome = match state {
                PackageState::Succeeded => PackageOutcome::Succeeded,
                PackageState::Skipped => PackageOutcome::Skipped,
                PackageState::Failed => PackageOutcome::Failed,
                PackageState::Pending | PackageState::Dispatched => PackageOutcome::NotAttempted,
            };
            (name.clone(), outcome)
        })
        .collect()
}

fn log_rollback(settled: &RollbackSummary) {
    if settled.library_removed {
        warn!("Removed the newly created library");
    }
    if !settled.removed.is_empty() {
        warn!("Removed: {}", settled.removed.join(", "));
    }
    if !settled.restored.is_empty() {
        warn!("Restored previous versions: {}", settled.restored.join(", "));
    }
    if !settled.kept.is_empty() {
        info!("Kept completed updates: {}", settled.kept.join(", "));
    }
}

fn describe(plan: &InstallPlan) -> String {
    format!("Install {}", plan.requested.join(", "))
}

/// Ledger handle for one run; a no-op without a database path
struct Ledger {
    conn: Option<Connection>,
    run: Option<InstallRun>,
}

impl Ledger {
    fn open(db_path: Option<&Path>, plan: &InstallPlan) -> Result<Self> {
        let Some(path) = db_path else {
            return Ok(Self {
                conn: None,
                run: None,
            });
        };

        let conn = db::open_or_init(&path.to_string_lossy())?;
        let mut run = InstallRun::new(describe(plan), plan.library.display().to_string());
        run.insert(&conn)?;
        info!("Recording install run {}", run.id.unwrap_or_default());

        Ok(Self {
            conn: Some(conn),
            run: Some(run),
        })
    }

    fn run_id(&self) -> Option<i64> {
        self.run.as_ref().and_then(|r| r.id)
    }

    /// Write every package row and the final status in one transaction
    fn finish(
        &mut self,
        plan: &InstallPlan,
        status: RunStatus,
        outcomes: &BTreeMap<String, PackageOutcome>,
        error: Option<&str>,
    ) -> Result<()> {
        let (Some(conn), Some(run)) = (self.conn.as_mut(), self.run.as_mut()) else {
            return Ok(());
        };
        let Some(run_id) = run.id else {
            return Ok(());
        };

        db::transaction(conn, |tx| {
            for package in plan.packages.values() {
                let outcome = outcomes.get(&package.name).copied().unwrap_or(
                    if package.action == PlanAction::Skip {
                        PackageOutcome::Skipped
                    } else {
                        PackageOutcome::NotAttempted
                    },
                );
                RunPackage {
                    id: None,
                    run_id,
                    name: package.name.clone(),
                    version: package.version.clone(),
                    action: package.action.as_str().to_string(),
                    repository: package.repository.clone(),
                    variant: package.variant.as_str().to_string(),
                    outcome,
                }
                .insert(tx)?;
            }
            run.update_status(tx, status, error)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::engine::testing::FakeTool;
    use crate::install::library::{backup_dir, testing::install_fake};
    use crate::install::{BuildOutput, BuildRequest};
    use crate::install::sources::testing::source_tarball;
    use crate::packages::{PackageRecord, Relation};
    use crate::repository::index::{RepositoryIndex, VariantCatalog};
    use crate::repository::{RepositoryReference, SourceVariant};
    use crate::nexus::NexusConfig;
    use tempfile::TempDir;

    /// Local repository with placeholder archives for every record
    fn nexus(dir: &TempDir) -> PackageNexus {
        let records = vec![
            PackageRecord::new("rlang", "1.1.3"),
            PackageRecord::new("glue", "1.7.0"),
            PackageRecord::new("vctrs", "0.6.5")
                .with_dependencies(Relation::Imports, &["rlang", "glue"]),
        ];
        let repo = dir.path().join("repo");
        let contrib = repo.join("src/contrib");
        std::fs::create_dir_all(&contrib).unwrap();
        for record in &records {
            std::fs::write(
                contrib.join(format!("{}_{}.tar.gz", record.name, record.version)),
                b"archive",
            )
            .unwrap();
        }

        let index = RepositoryIndex::from_catalogs(
            RepositoryReference::new("CRAN", repo.display().to_string()),
            vec![VariantCatalog::from_records(SourceVariant::Source, records)],
        );
        PackageNexus::from_indexes(vec![index], NexusConfig::default()).unwrap()
    }

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::new(dir.path().join("lib"), dir.path().join("cache"))
            .with_repository("CRAN", dir.path().join("repo").display().to_string());
        config.db_path = Some(dir.path().join("ledger.db"));
        config.engine = crate::install::EngineConfig::with_threads(2);
        config
    }

    fn installed_version(library: &Path, name: &str) -> String {
        crate::packages::description::read_description(&library.join(name))
            .unwrap()
            .record
            .version
    }

    #[test]
    fn test_install_records_applied_run() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let tool = FakeTool::default();

        let summary = install_with_nexus(
            &config,
            &mut nexus(&dir),
            &["vctrs"],
            Vec::new(),
            &tool,
            &CancelToken::new(),
        )
        .unwrap();

        let report = summary.report.unwrap();
        assert_eq!(report.installed(), vec!["glue", "rlang", "vctrs"]);

        let runs = history(config.db_path.as_deref().unwrap()).unwrap();
        assert_eq!(runs.len(), 1);
        let (run, packages) = &runs[0];
        assert_eq!(run.status, RunStatus::Applied);
        assert_eq!(Some(run.id.unwrap()), summary.run_id);
        assert_eq!(packages.len(), 3);
        assert!(packages.iter().all(|p| p.outcome == PackageOutcome::Succeeded));
    }

    #[test]
    fn test_nothing_to_do_records_nothing() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let library = config.library.clone();
        std::fs::create_dir_all(&library).unwrap();
        install_fake(&library, "rlang", "1.1.3", true);

        let summary = install_with_nexus(
            &config,
            &mut nexus(&dir),
            &["rlang"],
            Vec::new(),
            &FakeTool::default(),
            &CancelToken::new(),
        )
        .unwrap();

        assert!(summary.report.is_none());
        assert!(summary.run_id.is_none());
        assert!(history(config.db_path.as_deref().unwrap()).unwrap().is_empty());
    }

    #[test]
    fn test_failed_install_rolls_back_and_records() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.update = true;
        let library = config.library.clone();
        std::fs::create_dir_all(&library).unwrap();
        install_fake(&library, "rlang", "1.0.0", true);

        let tool = FakeTool::failing(&["vctrs"]);
        let err = install_with_nexus(
            &config,
            &mut nexus(&dir),
            &["vctrs"],
            Vec::new(),
            &tool,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert_eq!(err.failed_packages(), vec!["vctrs"]);

        // rlang finished its update in an earlier layer, so it is kept;
        // glue was new and is removed
        assert!(!library.join("vctrs").exists());
        assert!(!library.join("glue").exists());
        assert_eq!(installed_version(&library, "rlang"), "2.0");
        assert!(!library.join("__OLD__rlang").exists());

        let runs = history(config.db_path.as_deref().unwrap()).unwrap();
        let (run, packages) = &runs[0];
        assert_eq!(run.status, RunStatus::RolledBack);
        assert!(run.error.as_deref().unwrap().contains("vctrs"));
        let outcome = |name: &str| {
            packages
                .iter()
                .find(|p| p.name == name)
                .map(|p| p.outcome)
                .unwrap()
        };
        assert_eq!(outcome("vctrs"), PackageOutcome::Failed);
        assert_eq!(outcome("glue"), PackageOutcome::RolledBack);
        assert_eq!(outcome("rlang"), PackageOutcome::Succeeded);
    }

    /// Installs like `FakeTool`, then leaves a plain file where the backup
    /// of `package` was, so the backup cannot be removed afterwards
    struct BlockedBackupTool {
        inner: FakeTool,
        package: &'static str,
    }

    impl BuildTool for BlockedBackupTool {
        fn install(&self, request: &BuildRequest<'_>) -> Result<BuildOutput> {
            let output = self.inner.install(request)?;
            if request.package == self.package {
                let backup = backup_dir(request.library, request.package);
                std::fs::remove_dir_all(&backup).unwrap();
                std::fs::write(&backup, b"not a directory").unwrap();
            }
            Ok(output)
        }
    }

    #[test]
    fn test_commit_failure_is_recorded() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.update = true;
        let library = config.library.clone();
        std::fs::create_dir_all(&library).unwrap();
        install_fake(&library, "rlang", "1.0.0", true);

        let tool = BlockedBackupTool {
            inner: FakeTool::default(),
            package: "rlang",
        };
        let err = install_with_nexus(
            &config,
            &mut nexus(&dir),
            &["rlang"],
            Vec::new(),
            &tool,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::RollbackFailure(_)));

        let runs = history(config.db_path.as_deref().unwrap()).unwrap();
        let (run, packages) = &runs[0];
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.as_deref().unwrap().contains("__OLD__rlang"));
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].outcome, PackageOutcome::Succeeded);
    }

    #[test]
    fn test_install_without_ledger() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.db_path = None;

        let summary = install_with_nexus(
            &config,
            &mut nexus(&dir),
            &["glue"],
            Vec::new(),
            &FakeTool::default(),
            &CancelToken::new(),
        )
        .unwrap();
        assert!(summary.run_id.is_none());
        assert_eq!(summary.report.unwrap().installed(), vec!["glue"]);
    }

    #[test]
    fn test_extra_source_installs_from_cache() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let tarball = source_tarball(dir.path(), "localpkg", "0.1.0");
        let extra = prepare_extra_sources(&[tarball], &config.cache()).unwrap();

        let tool = FakeTool::default();
        let no_roots: [&str; 0] = [];
        let summary = install_with_nexus(
            &config,
            &mut nexus(&dir),
            &no_roots,
            extra,
            &tool,
            &CancelToken::new(),
        )
        .unwrap();

        assert!(summary.plan.requested.contains(&"localpkg".to_string()));
        assert!(tool.calls().contains(&"start localpkg".to_string()));
    }

    #[test]
    fn test_history_without_database() {
        let dir = TempDir::new().unwrap();
        assert!(history(&dir.path().join("missing.db")).unwrap().is_empty());
    }
}
