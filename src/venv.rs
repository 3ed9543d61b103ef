//! Virtual environment lifecycle management.
//!
//! Exactly one environment is active per host process. The manager creates it
//! on first use, validates it on demand, and tears it down and recreates it on
//! an explicit, user-confirmed reset. A reset is deliberately not transactional:
//! the embedded interpreter cannot be re-initialized in-process, so a completed
//! reset leaves the environment in the `Restarting` state and a failed one in
//! `Invalidated`. Either way the host must restart before the environment is
//! used again.

use crate::{Confirm, HostError, Result};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// The binaries directory inside a venv. "Scripts" on Windows, "bin" on Unix.
#[cfg(windows)]
pub const VENV_BIN_DIR: &str = "Scripts";
#[cfg(not(windows))]
pub const VENV_BIN_DIR: &str = "bin";

/// Candidate interpreter executable names, in lookup order.
#[cfg(windows)]
const PYTHON_EXE_CANDIDATES: &[&str] = &["python.exe", "python3.exe"];
#[cfg(not(windows))]
const PYTHON_EXE_CANDIDATES: &[&str] = &["python3", "python"];

/// Marker file recording the interpreter version the venv was created with.
const VERSION_MARKER: &str = ".interpreter-version";

/// Confirmation prompt presented before a reset.
pub const RESET_PROMPT: &str =
    "Resetting the virtual environment requires a restart. Restart now?";

/// Lifecycle state of the active environment.
///
/// No operation other than a host restart is permitted on an `Invalidated` or
/// `Restarting` environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvState {
    Valid,
    Invalidated,
    Restarting,
}

/// An isolated interpreter installation rooted at a filesystem path.
#[derive(Debug, Clone)]
pub struct Environment {
    root: PathBuf,
    python: PathBuf,
    created_at: SystemTime,
    state: EnvState,
}

impl Environment {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the environment's interpreter executable.
    pub fn python(&self) -> &Path {
        &self.python
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn state(&self) -> EnvState {
        self.state
    }

    pub fn is_usable(&self) -> bool {
        self.state == EnvState::Valid && self.python.exists()
    }

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        match self.state {
            EnvState::Valid if self.python.exists() => Ok(()),
            EnvState::Valid => Err(HostError::Environment(format!(
                "interpreter executable missing at {}",
                self.python.display()
            ))),
            EnvState::Invalidated => Err(HostError::Environment(format!(
                "environment at {} is invalidated; restart the host before reuse",
                self.root.display()
            ))),
            EnvState::Restarting => Err(HostError::Environment(format!(
                "environment at {} awaits a host restart",
                self.root.display()
            ))),
        }
    }
}

/// Outcome of a [`EnvironmentManager::reset`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// The user declined the confirmation prompt. Nothing changed.
    Declined,
    /// A load pass is in flight; the reset runs once it completes.
    Queued,
    /// The environment was recreated. The host must restart before reuse.
    RestartRequired,
}

/// Exclusive owner of the host's virtual environment.
pub struct EnvironmentManager {
    root: PathBuf,
    search_path: Option<OsString>,
    environment: Option<Environment>,
    load_in_progress: bool,
    pending_reset: bool,
}

impl EnvironmentManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            search_path: None,
            environment: None,
            load_in_progress: false,
            pending_reset: false,
        }
    }

    /// Override the executable search path used to locate the base
    /// interpreter. Defaults to the process `$PATH`.
    pub fn with_search_path(mut self, path: impl Into<OsString>) -> Self {
        self.search_path = Some(path.into());
        self
    }

    /// Default environment root under the user data directory.
    pub fn default_root() -> Result<PathBuf> {
        let data_dir = dirs::data_dir().ok_or(HostError::NoDataDir)?;
        Ok(data_dir.join("pyhost").join("venv"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn environment(&self) -> Option<&Environment> {
        self.environment.as_ref()
    }

    pub fn pending_reset(&self) -> bool {
        self.pending_reset
    }

    /// Open the environment at the manager's root, creating it on first use.
    ///
    /// Interpreter lookup happens before any filesystem mutation: when no
    /// interpreter executable is discoverable on the search path this fails
    /// without touching the root. If the base interpreter version changed
    /// since the venv was created, the venv is discarded and rebuilt.
    pub fn open(&mut self) -> Result<&Environment> {
        let base = self.find_base_interpreter()?;
        let base_version = interpreter_version(&base);

        if self.root.is_dir() {
            if let (Some(current), Some(recorded)) = (&base_version, self.recorded_version()) {
                if *current != recorded {
                    info!(
                        "Interpreter version changed ({} -> {}); resetting virtual environment",
                        recorded, current
                    );
                    fs::remove_dir_all(&self.root)?;
                }
            }
        }

        if !self.root.is_dir() {
            create_venv(&base, &self.root)?;
            self.record_version(base_version.as_deref());
        } else {
            debug!("Using existing venv: {}", self.root.display());
        }

        let python = venv_python(&self.root)?;
        debug!("Environment interpreter: {}", python.display());

        self.environment = Some(Environment {
            root: self.root.clone(),
            python,
            created_at: SystemTime::now(),
            state: EnvState::Valid,
        });
        self.environment
            .as_ref()
            .ok_or_else(|| HostError::Environment("environment not open".to_string()))
    }

    /// Re-check that the active environment's interpreter still exists,
    /// invalidating the environment if it disappeared.
    pub fn validate(&mut self) -> bool {
        match &mut self.environment {
            Some(env) => {
                if env.state == EnvState::Valid && !env.python.exists() {
                    warn!(
                        "Interpreter executable disappeared from {}; invalidating environment",
                        env.root.display()
                    );
                    env.state = EnvState::Invalidated;
                }
                env.state == EnvState::Valid
            }
            None => false,
        }
    }

    /// Tear down and recreate the environment at the same root.
    ///
    /// Interactive: the user must accept [`RESET_PROMPT`] first. While a load
    /// pass is in flight the request is queued instead of executed. A failure
    /// mid-reset leaves the environment `Invalidated`; success leaves it
    /// `Restarting`. Both require a host restart, modeled by a fresh
    /// [`EnvironmentManager::open`] in the next process.
    pub fn reset(&mut self, confirm: &dyn Confirm) -> Result<ResetOutcome> {
        if self.load_in_progress {
            info!("Load pass in progress; queueing environment reset");
            self.pending_reset = true;
            return Ok(ResetOutcome::Queued);
        }

        if !confirm.confirm(RESET_PROMPT) {
            debug!("Environment reset declined");
            return Ok(ResetOutcome::Declined);
        }

        self.perform_reset()
    }

    fn perform_reset(&mut self) -> Result<ResetOutcome> {
        let base = self.find_base_interpreter()?;

        if self.root.exists() {
            info!("Removing virtual environment at {}", self.root.display());
            if let Err(e) = fs::remove_dir_all(&self.root) {
                self.invalidate();
                return Err(e.into());
            }
        }

        if let Err(err) = create_venv(&base, &self.root) {
            self.invalidate();
            return Err(err);
        }
        self.record_version(interpreter_version(&base).as_deref());

        let python = match venv_python(&self.root) {
            Ok(python) => python,
            // The recreate reported success but left no interpreter behind.
            Err(err) => {
                self.invalidate();
                return Err(err);
            }
        };
        self.environment = Some(Environment {
            root: self.root.clone(),
            python,
            created_at: SystemTime::now(),
            state: EnvState::Restarting,
        });
        info!("Virtual environment recreated; restart required before reuse");
        Ok(ResetOutcome::RestartRequired)
    }

    fn invalidate(&mut self) {
        match &mut self.environment {
            Some(env) => env.state = EnvState::Invalidated,
            None => {
                self.environment = Some(Environment {
                    root: self.root.clone(),
                    python: self.root.join(VENV_BIN_DIR).join(PYTHON_EXE_CANDIDATES[0]),
                    created_at: SystemTime::now(),
                    state: EnvState::Invalidated,
                });
            }
        }
    }

    /// Mark the start of a plugin load pass. Fails once, with interpreter
    /// context, if the environment is missing or unusable.
    pub fn begin_load_pass(&mut self) -> Result<()> {
        let usable = self.validate();
        match &self.environment {
            None => Err(HostError::InterpreterInit(
                "no environment open; open() must succeed before loading plugins".to_string(),
            )),
            Some(env) if usable => {
                debug!("Beginning load pass for {}", env.root.display());
                self.load_in_progress = true;
                Ok(())
            }
            Some(env) => Err(HostError::InterpreterInit(format!(
                "environment at {} is not usable (state: {:?}, interpreter: {})",
                env.root.display(),
                env.state,
                env.python.display()
            ))),
        }
    }

    /// Mark the end of a load pass. Returns whether a reset request was
    /// queued while the pass was running; the caller is expected to re-issue
    /// [`EnvironmentManager::reset`] in that case.
    pub fn end_load_pass(&mut self) -> bool {
        self.load_in_progress = false;
        std::mem::take(&mut self.pending_reset)
    }

    fn find_base_interpreter(&self) -> Result<PathBuf> {
        for name in PYTHON_EXE_CANDIDATES {
            let found = match &self.search_path {
                Some(paths) => which::which_in(name, Some(paths), "."),
                None => which::which(name),
            };
            if let Ok(path) = found {
                debug!("Base interpreter: {}", path.display());
                return Ok(path);
            }
        }
        Err(HostError::ExecutableNotFound(
            PYTHON_EXE_CANDIDATES[0].to_string(),
        ))
    }

    fn recorded_version(&self) -> Option<String> {
        fs::read_to_string(self.root.join(VERSION_MARKER))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn record_version(&self, version: Option<&str>) {
        if let Some(version) = version {
            if let Err(e) = fs::write(self.root.join(VERSION_MARKER), version) {
                debug!("Failed recording interpreter version: {}", e);
            }
        }
    }
}

fn create_venv(base_python: &Path, root: &Path) -> Result<()> {
    info!("Creating virtual environment at {}", root.display());

    let status = Command::new(base_python)
        .args(["-m", "venv"])
        .arg(root)
        .status()
        .map_err(|e| {
            HostError::InterpreterInit(format!(
                "failed to spawn '{}': {}",
                base_python.display(),
                e
            ))
        })?;

    if !status.success() {
        return Err(HostError::VenvInit(status.code().unwrap_or(-1)));
    }

    Ok(())
}

fn venv_python(root: &Path) -> Result<PathBuf> {
    let bin_dir = root.join(VENV_BIN_DIR);
    for name in PYTHON_EXE_CANDIDATES {
        let candidate = bin_dir.join(name);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(HostError::Environment(format!(
        "Python executable not found in {}",
        bin_dir.display()
    )))
}

fn interpreter_version(python: &Path) -> Option<String> {
    let output = Command::new(python)
        .args(["-c", "import sys; print('.'.join(map(str, sys.version_info[:3])))"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if version.is_empty() {
        None
    } else {
        Some(version)
    }
}
