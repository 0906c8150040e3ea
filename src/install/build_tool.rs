// src/install/build_tool.rs

//! External build tool invocation

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// How often a running build is checked for cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// One package handed to the build tool
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    pub package: &'a str,
    /// Archive file or unpacked source directory
    pub source: &'a Path,
    pub library: &'a Path,
    pub cancel: &'a CancelToken,
}

/// Exit status and captured output of one build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl BuildOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Installs one package into a library
///
/// A non-zero exit is reported through `BuildOutput`, not as an error.
/// Errors are reserved for failing to run the tool at all.
pub trait BuildTool: Send + Sync {
    fn install(&self, request: &BuildRequest<'_>) -> Result<BuildOutput>;
}

/// `R CMD INSTALL` based build tool
#[derive(Debug, Clone)]
pub struct RCommand {
    executable: PathBuf,
    timeout: Option<Duration>,
}

impl Default for RCommand {
    fn default() -> Self {
        Self::new("R")
    }
}

impl RCommand {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            timeout: None,
        }
    }

    /// Kill a single build after `timeout`
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, request: &BuildRequest<'_>) -> Command {
        let mut command = Command::new(&self.executable);
        command
            .arg("CMD")
            .arg("INSTALL")
            .arg(format!("--library={}", request.library.display()))
            .arg(request.source)
            .env("R_LIBS", library_path_var(request.library))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

/// `R_LIBS` with the target library first, so freshly installed
/// dependencies are found by later builds
fn library_path_var(library: &Path) -> OsString {
    let mut value = OsString::from(library.as_os_str());
    if let Some(existing) = std::env::var_os("R_LIBS").filter(|v| !v.is_empty()) {
        value.push(if cfg!(windows) { ";" } else { ":" });
        value.push(existing);
    }
    value
}

impl BuildTool for RCommand {
    fn install(&self, request: &BuildRequest<'_>) -> Result<BuildOutput> {
        request.cancel.check(request.package)?;
        debug!(
            "Running {} CMD INSTALL for {}",
            self.executable.display(),
            request.package
        );

        let mut child = self.command(request).spawn().map_err(|e| {
            Error::IoError(format!(
                "Failed to run {}: {}",
                self.executable.display(),
                e
            ))
        })?;

        let stdout = capture(child.stdout.take());
        let stderr = capture(child.stderr.take());

        let status = wait(&mut child, self.timeout, request);

        let output = BuildOutput {
            status: status.as_ref().ok().copied().flatten(),
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        };
        status?;
        Ok(output)
    }
}

fn capture<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut text = String::new();
        if let Some(mut pipe) = pipe {
            let mut bytes = Vec::new();
            if pipe.read_to_end(&mut bytes).is_ok() {
                text = String::from_utf8_lossy(&bytes).into_owned();
            }
        }
        text
    })
}

/// Wait for the child, killing it on timeout or cancellation
fn wait(child: &mut Child, timeout: Option<Duration>, request: &BuildRequest<'_>) -> Result<Option<i32>> {
    let started = Instant::now();

    loop {
        let status = child
            .wait_timeout(POLL_INTERVAL)
            .map_err(|e| Error::IoError(format!("Failed to wait for build of {}: {}", request.package, e)))?;
        if let Some(status) = status {
            return Ok(status.code());
        }

        let timed_out = timeout.is_some_and(|t| started.elapsed() >= t);
        if timed_out || request.cancel.is_cancelled() {
            warn!("Stopping build of {}", request.package);
            if let Err(e) = child.kill() {
                warn!("Failed to kill build of {}: {}", request.package, e);
            }
            let _ = child.wait();

            let why = if timed_out { "timed out" } else { "cancelled" };
            return Err(Error::Cancelled(format!("build of {} {}", request.package, why)));
        }
    }
}
