//! Launching worker processes.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::error::{Error, Result};
use crate::ipc::WorkerKind;
use crate::settings::ResolvedSettings;

/// Environment variable naming the worker binary explicitly.
pub const WORKER_PATH_ENV: &str = "REGEN_WORKER_PATH";

const WORKER_NAME: &str = if cfg!(windows) {
    "regen-worker.exe"
} else {
    "regen-worker"
};

/// Creates worker OS processes.
///
/// The returned child must have piped stdin and stdout; they become the
/// worker's control channel.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, kind: WorkerKind) -> Result<Child>;
}

/// Spawns the `regen-worker` binary.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    binary: PathBuf,
}

impl ProcessSpawner {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Use the configured binary, or search for one.
    pub fn from_settings(settings: &ResolvedSettings) -> Result<Self> {
        match &settings.worker_binary {
            Some(path) if path.exists() => Ok(Self::new(path)),
            Some(path) => Err(Error::Spawn(format!(
                "configured worker binary '{}' does not exist",
                path.display()
            ))),
            None => find_worker_binary().map(Self::new),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, kind: WorkerKind) -> Result<Child> {
        tracing::debug!(binary = %self.binary.display(), %kind, "Spawning worker process");
        Command::new(&self.binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Spawn(format!(
                    "failed to start '{}': {}",
                    self.binary.display(),
                    e
                ))
            })
    }
}

/// Locate the `regen-worker` binary.
///
/// Search order:
/// 1. `REGEN_WORKER_PATH`
/// 2. Same directory as the current executable (and its parent, for test
///    binaries under `target/<profile>/deps`)
/// 3. System PATH
/// 4. The user's executable directory (e.g. `~/.local/bin`)
/// 5. `target/debug` or `target/release` of the workspace
pub fn find_worker_binary() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!(path = %path.display(), "{} points at a missing file", WORKER_PATH_ENV);
    }

    if let Ok(exe_path) = std::env::current_exe()
        && let Some(exe_dir) = exe_path.parent()
    {
        for dir in [Some(exe_dir), exe_dir.parent()].into_iter().flatten() {
            let candidate = dir.join(WORKER_NAME);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    if let Ok(path) = which::which(WORKER_NAME) {
        return Ok(path);
    }

    if let Some(bin_dir) = dirs::executable_dir() {
        let candidate = bin_dir.join(WORKER_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        for profile in ["debug", "release"] {
            let path = PathBuf::from(&manifest_dir)
                .join("..")
                .join("..")
                .join("target")
                .join(profile)
                .join(WORKER_NAME);
            if path.exists() {
                return Ok(path.canonicalize().unwrap_or(path));
            }
        }
    }

    Err(Error::Spawn(format!(
        "could not find the {WORKER_NAME} binary; set {WORKER_PATH_ENV} or put it in PATH"
    )))
}
