// src/install/engine.rs

//! Layered concurrent installation
//!
//! The dispatcher walks the plan's layers in order. For each layer it sends
//! one `InstallRequest` per member to a bounded worker pool, then blocks until
//! the aggregator has acknowledged exactly that many `InstallUpdate`s. The
//! aggregator is the only thread that writes run state; workers only report.
//!
//! A failed package lets its in-flight siblings finish but stops dispatch of
//! any later layer.

use super::build_tool::{BuildOutput, BuildRequest, BuildTool};
use super::download::PackageFetcher;
use super::planner::{InstallPlan, PlanAction, PlannedPackage};
use crate::cancel::CancelToken;
use crate::error::{Error, FailedInstall, Result};
use crate::packages::description::stamp_description;
use crate::resolver::Layer;
use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Value written to the `InstallAgent` field of installed packages
pub fn default_agent() -> String {
    format!("statpkg/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker count; `None` picks one less than the CPU count
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default = "default_agent")]
    pub agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: None,
            agent: default_agent(),
        }
    }
}

impl EngineConfig {
    pub fn with_threads(threads: usize) -> Self {
        Self {
            threads: Some(threads),
            ..Self::default()
        }
    }

    /// Effective worker count, never below one
    pub fn worker_count(&self) -> usize {
        self.threads
            .filter(|&n| n > 0)
            .unwrap_or_else(|| num_cpus::get().saturating_sub(1))
            .max(1)
    }
}

/// Per-package run state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageState {
    Pending,
    Dispatched,
    Succeeded,
    Failed,
    Skipped,
}

impl PackageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageState::Pending => "pending",
            PackageState::Dispatched => "dispatched",
            PackageState::Succeeded => "succeeded",
            PackageState::Failed => "failed",
            PackageState::Skipped => "skipped",
        }
    }
}

impl fmt::Display for PackageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work item for one package
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub package: PlannedPackage,
    pub layer: usize,
}

#[derive(Debug, Clone)]
pub enum InstallOutcome {
    Succeeded(BuildOutput),
    Skipped,
    Failed(FailedInstall),
}

/// Terminal report for one request
#[derive(Debug, Clone)]
pub struct InstallUpdate {
    pub package: String,
    pub layer: usize,
    pub worker: usize,
    pub outcome: InstallOutcome,
    pub elapsed: Duration,
}

impl InstallUpdate {
    pub fn state(&self) -> PackageState {
        match self.outcome {
            InstallOutcome::Succeeded(_) => PackageState::Succeeded,
            InstallOutcome::Skipped => PackageState::Skipped,
            InstallOutcome::Failed(_) => PackageState::Failed,
        }
    }
}

enum Event {
    Dispatched(String),
    Finished(InstallUpdate),
}

/// What the aggregator recorded over a run
#[derive(Debug, Clone, Default)]
pub struct InstallReport {
    pub states: BTreeMap<String, PackageState>,
    /// Updates in the order the aggregator drained them
    pub updates: Vec<InstallUpdate>,
    pub layers_completed: usize,
}

impl InstallReport {
    fn names_in(&self, state: PackageState) -> Vec<String> {
        self.states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn installed(&self) -> Vec<String> {
        self.names_in(PackageState::Succeeded)
    }

    pub fn skipped(&self) -> Vec<String> {
        self.names_in(PackageState::Skipped)
    }

    /// Leading layers whose members all succeeded or were skipped
    fn completed_layers(&self, layers: &[Layer]) -> usize {
        layers
            .iter()
            .take_while(|layer| {
                layer.iter().all(|name| {
                    self.states.get(name).is_none_or(|state| {
                        matches!(state, PackageState::Succeeded | PackageState::Skipped)
                    })
                })
            })
            .count()
    }

    pub fn failures(&self) -> Vec<FailedInstall> {
        self.updates
            .iter()
            .filter_map(|u| match &u.outcome {
                InstallOutcome::Failed(f) => Some(f.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Executes an `InstallPlan` against a build tool
pub struct InstallationEngine<'a> {
    config: EngineConfig,
    tool: &'a dyn BuildTool,
    fetcher: &'a PackageFetcher,
    cancel: CancelToken,
}

impl<'a> InstallationEngine<'a> {
    pub fn new(config: EngineConfig, tool: &'a dyn BuildTool, fetcher: &'a PackageFetcher) -> Self {
        Self {
            config,
            tool,
            fetcher,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Install every layer of the plan
    ///
    /// Returns the aggregated report when every package succeeded or was
    /// skipped, `InstallationFailure` naming each failed package otherwise,
    /// and `Cancelled` when the token stopped dispatch first.
    pub fn run(&self, plan: &InstallPlan) -> Result<InstallReport> {
        fs::create_dir_all(&plan.library).map_err(|e| {
            Error::IoError(format!(
                "Failed to create library {}: {}",
                plan.library.display(),
                e
            ))
        })?;

        let workers = self.config.worker_count();
        info!(
            "Installing {} packages in {} layers with {} workers",
            plan.packages.len(),
            plan.layers.len(),
            workers
        );

        let (request_tx, request_rx) = channel::bounded::<InstallRequest>(workers);
        let (event_tx, event_rx) = channel::unbounded::<Event>();
        let (ack_tx, ack_rx) = channel::unbounded::<PackageState>();

        let (report, stopped_early) = thread::scope(|scope| {
            for worker in 0..workers {
                let requests = request_rx.clone();
                let events = event_tx.clone();
                let library = plan.library.as_path();
                scope.spawn(move || self.work(worker, requests, events, library));
            }
            drop(request_rx);

            let initial = plan.packages.keys().cloned().collect::<Vec<_>>();
            let aggregator = scope.spawn(move || aggregate(initial, event_rx, ack_tx));

            let stopped_early = self.dispatch(plan, &request_tx, &event_tx, &ack_rx);

            // Closing the request channel lets workers exit, which closes the
            // event channel and ends the aggregator
            drop(request_tx);
            drop(event_tx);
            let report = aggregator.join();
            (report, stopped_early)
        });

        let mut report = report
            .map_err(|_| Error::IoError("install aggregator panicked".to_string()))?;
        report.layers_completed = report.completed_layers(&plan.layers);

        let failures = report.failures();
        if !failures.is_empty() {
            for failure in &failures {
                error!(package = %failure.package, status = ?failure.status, "Install failed");
            }
            return Err(Error::InstallationFailure(failures));
        }
        if stopped_early {
            return Err(Error::Cancelled(format!(
                "installation stopped after {} of {} layers",
                report.layers_completed,
                plan.layers.len()
            )));
        }

        info!(
            "Installed {} packages, {} already current",
            report.installed().len(),
            report.skipped().len()
        );
        Ok(report)
    }

    /// Send layers one at a time; returns true when dispatch stopped early
    fn dispatch(
        &self,
        plan: &InstallPlan,
        requests: &Sender<InstallRequest>,
        events: &Sender<Event>,
        acks: &Receiver<PackageState>,
    ) -> bool {
        for (index, layer) in plan.layers.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!("Cancelled before layer {}", index);
                return true;
            }

            let mut sent = 0;
            for name in layer {
                let Some(package) = plan.packages.get(name) else {
                    warn!("{} is layered but not planned, skipping", name);
                    continue;
                };
                let _ = events.send(Event::Dispatched(name.clone()));
                let request = InstallRequest {
                    package: package.clone(),
                    layer: index,
                };
                if requests.send(request).is_err() {
                    return true;
                }
                sent += 1;
            }

            // Barrier: every member of this layer has reached a terminal state
            let mut layer_failed = false;
            for _ in 0..sent {
                match acks.recv() {
                    Ok(PackageState::Failed) => layer_failed = true,
                    Ok(_) => {}
                    Err(_) => return true,
                }
            }

            if layer_failed {
                warn!("Layer {} had failures, not dispatching further layers", index);
                return true;
            }
            debug!("Layer {} complete ({} packages)", index, sent);
        }
        false
    }

    fn work(
        &self,
        worker: usize,
        requests: Receiver<InstallRequest>,
        events: Sender<Event>,
        library: &Path,
    ) {
        for request in requests {
            let started = Instant::now();
            let outcome = self.install_one(&request.package, library);
            let update = InstallUpdate {
                package: request.package.name.clone(),
                layer: request.layer,
                worker,
                outcome,
                elapsed: started.elapsed(),
            };
            if events.send(Event::Finished(update)).is_err() {
                break;
            }
        }
    }

    fn install_one(&self, package: &PlannedPackage, library: &Path) -> InstallOutcome {
        if package.action == PlanAction::Skip {
            debug!("{} is current, skipping", package.name);
            return InstallOutcome::Skipped;
        }

        let failed = |reason: String| {
            InstallOutcome::Failed(FailedInstall {
                package: package.name.clone(),
                status: None,
                stdout: String::new(),
                stderr: String::new(),
                reason: Some(reason),
            })
        };

        if let Err(e) = self.cancel.check(&package.name) {
            return failed(e.to_string());
        }

        info!(
            package = %package.name,
            version = %package.version,
            action = %package.action,
            "Install started"
        );

        let source = match self.fetcher.fetch(package, &self.cancel) {
            Ok(path) => path,
            Err(e) => return failed(e.to_string()),
        };

        let output = match self.tool.install(&BuildRequest {
            package: &package.name,
            source: &source,
            library,
            cancel: &self.cancel,
        }) {
            Ok(output) => output,
            Err(e) => return failed(e.to_string()),
        };

        if !output.success() {
            return InstallOutcome::Failed(FailedInstall {
                package: package.name.clone(),
                status: output.status,
                stdout: output.stdout,
                stderr: output.stderr,
                reason: None,
            });
        }

        if let Err(e) = stamp_description(
            &library.join(&package.name),
            &self.config.agent,
            &package.repository,
        ) {
            return failed(format!("installed but not stamped: {}", e));
        }

        info!(package = %package.name, version = %package.version, "Install finished");
        InstallOutcome::Succeeded(output)
    }
}

/// Sole writer of run state; acknowledges every finished update
fn aggregate(
    packages: Vec<String>,
    events: Receiver<Event>,
    acks: Sender<PackageState>,
) -> InstallReport {
    let mut report = InstallReport {
        states: packages
            .into_iter()
            .map(|name| (name, PackageState::Pending))
            .collect(),
        ..InstallReport::default()
    };

    for event in events {
        match event {
            Event::Dispatched(name) => {
                report.states.insert(name, PackageState::Dispatched);
            }
            Event::Finished(update) => {
                let state = update.state();
                debug!(
                    "{} {} on worker {} after {:.1}s",
                    update.package,
                    state,
                    update.worker,
                    update.elapsed.as_secs_f64()
                );
                report.states.insert(update.package.clone(), state);
                report.updates.push(update);
                let _ = acks.send(state);
            }
        }
    }

    report
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::install::library::is_valid_install;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_worker_count() {
        assert_eq!(EngineConfig::with_threads(4).worker_count(), 4);
        assert_eq!(
            EngineConfig::with_threads(0).worker_count(),
            EngineConfig::default().worker_count()
        );
        assert!(EngineConfig::default().worker_count() >= 1);
    }

    #[test]
    fn test_layer_barrier() {
        let lib = tempfile::tempdir().unwrap();
        let plan = layered_plan(lib.path(), &[&["a", "b", "c"], &["d"], &["e", "f"]]);
        let tool = FakeTool {
            delay: Duration::from_millis(20),
            ..FakeTool::default()
        };
        let fetcher = fetcher();

        let report = InstallationEngine::new(EngineConfig::with_threads(2), &tool, &fetcher)
            .run(&plan)
            .unwrap();

        assert_eq!(report.updates.len(), 6);
        assert_eq!(report.layers_completed, 3);
        assert!(tool.max_running.load(Ordering::SeqCst) <= 2);

        let calls = tool.calls();
        let index = |entry: &str| calls.iter().position(|c| c == entry).unwrap();
        for first in ["a", "b", "c"] {
            assert!(index(&format!("end {}", first)) < index("start d"));
        }
        assert!(index("end d") < index("start e"));
        assert!(index("end d") < index("start f"));

        // Drained order respects layers too
        let layers: Vec<usize> = report.updates.iter().map(|u| u.layer).collect();
        assert!(layers.windows(2).all(|w| w[0] <= w[1]));

        for name in ["a", "b", "c", "d", "e", "f"] {
            assert_eq!(report.states[name], PackageState::Succeeded);
            assert!(is_valid_install(&lib.path().join(name), name));
        }
    }

    #[test]
    fn test_failure_stops_later_layers() {
        let lib = tempfile::tempdir().unwrap();
        let plan = layered_plan(lib.path(), &[&["a", "b"], &["c"]]);
        let tool = FakeTool::failing(&["b"]);
        let fetcher = fetcher();

        let err = InstallationEngine::new(EngineConfig::with_threads(2), &tool, &fetcher)
            .run(&plan)
            .unwrap_err();

        match &err {
            Error::InstallationFailure(failed) => {
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].package, "b");
                assert_eq!(failed[0].status, Some(1));
                assert_eq!(failed[0].stderr, "compilation failed");
            }
            other => panic!("unexpected error: {other}"),
        }

        let calls = tool.calls();
        assert!(calls.contains(&"end a".to_string()));
        assert!(!calls.iter().any(|c| c.ends_with(" c")));
        assert!(is_valid_install(&lib.path().join("a"), "a"));
        assert!(!is_valid_install(&lib.path().join("b"), "b"));
    }

    #[test]
    fn test_skip_short_circuits_but_reports() {
        let lib = tempfile::tempdir().unwrap();
        let mut plan = layered_plan(lib.path(), &[&["a", "b"]]);
        plan.packages.insert("a".to_string(), planned("a", PlanAction::Skip));
        let tool = FakeTool::default();
        let fetcher = fetcher();

        let report = InstallationEngine::new(EngineConfig::with_threads(1), &tool, &fetcher)
            .run(&plan)
            .unwrap();

        assert_eq!(report.updates.len(), 2);
        assert_eq!(report.skipped(), vec!["a".to_string()]);
        assert_eq!(report.installed(), vec!["b".to_string()]);
        assert_eq!(tool.calls(), vec!["start b".to_string(), "end b".into()]);
    }

    #[test]
    fn test_failed_layer_is_not_counted_as_completed() {
        let layers: Vec<Layer> = vec![
            vec!["a".to_string()],
            vec!["b".to_string(), "c".to_string()],
            vec!["d".to_string()],
        ];
        let mut report = InstallReport::default();
        report.states.insert("a".to_string(), PackageState::Skipped);
        report.states.insert("b".to_string(), PackageState::Succeeded);
        report.states.insert("c".to_string(), PackageState::Failed);
        report.states.insert("d".to_string(), PackageState::Pending);
        assert_eq!(report.completed_layers(&layers), 1);

        report.states.insert("c".to_string(), PackageState::Succeeded);
        assert_eq!(report.completed_layers(&layers), 2);
    }

    /// Installs like `FakeTool`, then fires the token
    struct CancellingTool {
        inner: FakeTool,
        cancel: CancelToken,
    }

    impl BuildTool for CancellingTool {
        fn install(&self, request: &BuildRequest<'_>) -> Result<BuildOutput> {
            let output = self.inner.install(request)?;
            self.cancel.cancel();
            Ok(output)
        }
    }

    #[test]
    fn test_cancel_between_layers_reports_progress() {
        let lib = tempfile::tempdir().unwrap();
        let plan = layered_plan(lib.path(), &[&["a"], &["b"]]);
        let cancel = CancelToken::new();
        let tool = CancellingTool {
            inner: FakeTool::default(),
            cancel: cancel.clone(),
        };
        let fetcher = fetcher();

        let err = InstallationEngine::new(EngineConfig::with_threads(1), &tool, &fetcher)
            .with_cancel(cancel)
            .run(&plan)
            .unwrap_err();
        match err {
            Error::Cancelled(msg) => assert!(msg.contains("after 1 of 2 layers"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(tool.inner.calls(), vec!["start a".to_string(), "end a".into()]);
    }

    #[test]
    fn test_cancelled_engine_dispatches_nothing() {
        let lib = tempfile::tempdir().unwrap();
        let plan = layered_plan(lib.path(), &[&["a"]]);
        let tool = FakeTool::default();
        let fetcher = fetcher();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = InstallationEngine::new(EngineConfig::with_threads(1), &tool, &fetcher)
            .with_cancel(cancel)
            .run(&plan)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert!(tool.calls().is_empty());
    }
}
