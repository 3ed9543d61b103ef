//! Plugin dependency resolution and installation.
//!
//! The resolver computes the difference between a plugin's declared packages
//! and what the environment has installed, from a single `pip freeze` of the
//! environment. The installer satisfies the missing set with one batched
//! `pip install` invocation, so a failure is atomic for the attempt and the
//! report stays simple. Neither automatically retries.

use crate::loader::PluginDescriptor;
use crate::venv::Environment;
use crate::{HostError, Result};
use std::collections::BTreeMap;
use std::process::Command;
use std::sync::mpsc::Sender;
use std::thread;
use tracing::{debug, info, warn};

/// One declared dependency checked against the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyStatus {
    /// The requirement spec as declared, e.g. "requests>=2.0".
    pub requirement: String,
    /// Installed version, or `None` when the package is absent.
    pub installed: Option<String>,
}

/// Derived, ephemeral mapping from dependency name to its status.
/// Recomputed on demand, never persisted. Deterministic given identical
/// environment state and descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencySet {
    entries: BTreeMap<String, DependencyStatus>,
}

impl DependencySet {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DependencyStatus)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Names of the dependencies that are absent from the environment.
    pub fn missing(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, status)| status.installed.is_none())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Requirement specs for the missing dependencies, as declared.
    pub fn requirements_to_install(&self) -> Vec<String> {
        self.entries
            .values()
            .filter(|status| status.installed.is_none())
            .map(|status| status.requirement.clone())
            .collect()
    }

    pub fn is_satisfied(&self) -> bool {
        self.entries.values().all(|status| status.installed.is_some())
    }
}

/// Subprocess boundary to the environment's package manager. A trait so load
/// passes can run against simulated environments in tests.
pub trait PackageBackend {
    /// Installed distributions of the environment, `pip freeze` formatted.
    fn freeze(&self, env: &Environment) -> Result<String>;

    /// Install the given requirement specs in one batched invocation,
    /// returning the subprocess exit code.
    fn install(&self, env: &Environment, requirements: &[String]) -> Result<i32>;
}

/// The real backend: `python -m pip` inside the environment.
pub struct Pip;

impl PackageBackend for Pip {
    fn freeze(&self, env: &Environment) -> Result<String> {
        let output = Command::new(env.python())
            .args(["-m", "pip", "freeze"])
            .output()?;

        if !output.status.success() {
            return Err(HostError::Environment(format!(
                "pip freeze exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn install(&self, env: &Environment, requirements: &[String]) -> Result<i32> {
        debug!("pip install {}", requirements.join(" "));
        let status = Command::new(env.python())
            .args(["-m", "pip", "install", "--disable-pip-version-check"])
            .args(requirements)
            .status()?;
        Ok(status.code().unwrap_or(-1))
    }
}

/// Computes a plugin's [`DependencySet`] against an environment.
pub struct DependencyResolver<'a> {
    backend: &'a dyn PackageBackend,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(backend: &'a dyn PackageBackend) -> Self {
        Self { backend }
    }

    /// Check each declared dependency for installed presence/version.
    /// Read-only with respect to the environment.
    pub fn resolve(&self, descriptor: &PluginDescriptor, env: &Environment) -> Result<DependencySet> {
        if descriptor.metadata().requires.is_empty() {
            return Ok(DependencySet::default());
        }
        env.ensure_usable()?;

        let freeze = self.backend.freeze(env)?;
        let set = compute_set(&descriptor.metadata().requires, &freeze);
        debug!(
            plugin = descriptor.name(),
            "{} of {} dependencies missing",
            set.missing().len(),
            set.len()
        );
        Ok(set)
    }
}

/// Satisfies missing dependencies via the environment's package manager.
pub struct DependencyInstaller<'a> {
    backend: &'a dyn PackageBackend,
}

/// Successful installation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallReport {
    pub exit_code: i32,
}

impl<'a> DependencyInstaller<'a> {
    pub fn new(backend: &'a dyn PackageBackend) -> Self {
        Self { backend }
    }

    /// Install the full missing set in one batched invocation. Non-zero exit
    /// is terminal for this attempt; the caller decides whether to retry,
    /// abort the plugin load, or load in degraded mode.
    pub fn install(&self, set: &DependencySet, env: &Environment) -> Result<InstallReport> {
        env.ensure_usable()?;

        let requirements = set.requirements_to_install();
        if requirements.is_empty() {
            return Ok(InstallReport { exit_code: 0 });
        }

        info!("Installing {} missing dependencies", requirements.len());
        let exit_code = self.backend.install(env, &requirements)?;
        if exit_code != 0 {
            warn!("Dependency installation exited with {}", exit_code);
            return Err(HostError::InstallFailed {
                exit_code: Some(exit_code),
            });
        }
        Ok(InstallReport { exit_code })
    }
}

/// Run an installation on a worker thread, delivering the result over `tx`.
///
/// The invocation itself blocks the worker until the subprocess completes; no
/// cancellation is offered once it has started.
pub fn install_in_background<B>(
    backend: B,
    set: DependencySet,
    env: Environment,
    tx: Sender<Result<InstallReport>>,
) -> thread::JoinHandle<()>
where
    B: PackageBackend + Send + 'static,
{
    thread::spawn(move || {
        let installer = DependencyInstaller::new(&backend);
        let result = installer.install(&set, &env);
        if tx.send(result).is_err() {
            debug!("Install completion receiver dropped");
        }
    })
}

/// Compare declared requirements against `pip freeze` output.
pub(crate) fn compute_set(requires: &[String], freeze: &str) -> DependencySet {
    let installed = parse_freeze(freeze);

    let mut entries = BTreeMap::new();
    for requirement in requires {
        let name = package_name(requirement);
        let status = DependencyStatus {
            requirement: requirement.clone(),
            installed: installed.get(&name).cloned(),
        };
        entries.insert(name, status);
    }
    DependencySet { entries }
}

/// Parse `pip freeze` output into normalized name -> version.
fn parse_freeze(freeze: &str) -> BTreeMap<String, String> {
    let mut installed = BTreeMap::new();
    for line in freeze.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((name, version)) = line.split_once("==") {
            installed.insert(package_name(name), version.trim().to_string());
        } else if let Some((name, source)) = line.split_once('@') {
            // Editable/URL installs report no version
            installed.insert(package_name(name), source.trim().to_string());
        }
    }
    installed
}

/// Normalized package name from a requirement spec: the part before any
/// version operator, lowercased, with underscores folded to hyphens.
fn package_name(spec: &str) -> String {
    spec.split(['>', '<', '=', '!', '~', '@', ' ', ';'])
        .next()
        .unwrap_or(spec)
        .trim()
        .to_lowercase()
        .replace('_', "-")
}
