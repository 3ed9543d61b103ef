//! Plugin discovery and loading.
//!
//! A load pass sweeps the user and system plugin directories, resolves each
//! plugin's dependencies, optionally installs missing ones on user consent,
//! and imports each plugin under the managed environment. One plugin's
//! failure never aborts loading of subsequent plugins: per-plugin errors are
//! converted into a `Failed` state and a reported reason at the loader
//! boundary. Environment-level failures abort the whole pass and surface
//! once, with interpreter context.

use crate::deps::{DependencyInstaller, DependencyResolver, PackageBackend};
use crate::metadata::{MetadataError, PluginMetadata};
use crate::venv::{Environment, EnvironmentManager};
use crate::{probe, Confirm, HostError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Failure reason recorded when the user declines a dependency installation.
pub const DECLINED_INSTALL: &str = "missing dependencies, user declined install";

/// Load state of one discovered plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    NotLoaded,
    Resolving,
    NeedsInstall,
    Loading,
    Loaded,
    Failed(String),
}

/// One discovered plugin directory entry.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    name: String,
    path: PathBuf,
    source_path: PathBuf,
    metadata: PluginMetadata,
    state: LoadState,
}

impl PluginDescriptor {
    /// Build a descriptor from a plugin directory entry: either a `*.py`
    /// file or a package directory containing `__init__.py`.
    pub fn from_path(path: &Path) -> std::result::Result<Self, MetadataError> {
        let source_path = if path.is_file() {
            if path.extension().and_then(|e| e.to_str()) == Some("py") {
                path.to_path_buf()
            } else {
                return Err(MetadataError::NotAPlugin(
                    "not a Python file".to_string(),
                ));
            }
        } else if path.is_dir() {
            let init = path.join("__init__.py");
            if init.is_file() {
                init
            } else {
                return Err(MetadataError::NotAPlugin(
                    "package init file does not exist".to_string(),
                ));
            }
        } else {
            return Err(MetadataError::NotAPlugin("path does not exist".to_string()));
        };

        let source = fs::read_to_string(&source_path).map_err(|e| {
            MetadataError::Invalid(format!("cannot read {}: {}", source_path.display(), e))
        })?;
        let metadata = PluginMetadata::parse(&source)?;

        if !metadata.platform_supported() {
            return Err(MetadataError::Invalid(format!(
                "Platform not supported. Supported: {}",
                metadata.platforms.join(", ")
            )));
        }

        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        Ok(Self {
            name,
            path: path.to_path_buf(),
            source_path,
            metadata,
            state: LoadState::NotLoaded,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    pub fn state(&self) -> &LoadState {
        &self.state
    }
}

/// Result of one plugin within a load pass.
#[derive(Debug, Clone)]
pub struct LoadReport {
    pub name: String,
    pub state: LoadState,
    /// Per-plugin diagnostic, "Loading: {ms} ms" on success.
    pub message: Option<String>,
}

/// Import boundary: brings one plugin module up inside the environment.
/// A trait so load passes can run against simulated interpreters in tests.
pub trait PluginImport {
    fn import(&mut self, descriptor: &PluginDescriptor, env: &Environment) -> Result<()>;
}

/// The real import: executes the plugin module in a subprocess of the
/// environment's interpreter and instantiates its entry-point class.
pub struct PythonImport;

const IMPORT_SCRIPT: &str = r#"
import importlib.util, sys
source, name, entry = sys.argv[1], sys.argv[2], sys.argv[3]
spec = importlib.util.spec_from_file_location("plugins." + name, source)
module = importlib.util.module_from_spec(spec)
spec.loader.exec_module(module)
getattr(module, entry)()
"#;

impl PluginImport for PythonImport {
    fn import(&mut self, descriptor: &PluginDescriptor, env: &Environment) -> Result<()> {
        let output = Command::new(env.python())
            .arg("-c")
            .arg(IMPORT_SCRIPT)
            .arg(descriptor.source_path())
            .arg(descriptor.name())
            .arg(descriptor.metadata().entry_point())
            .output()
            .map_err(|e| HostError::PluginLoad {
                name: descriptor.name().to_string(),
                reason: format!("failed to spawn interpreter: {}", e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("import failed")
                .trim()
                .to_string();
            return Err(HostError::PluginLoad {
                name: descriptor.name().to_string(),
                reason,
            });
        }
        Ok(())
    }
}

/// Discovers plugins and drives the per-plugin load state machine.
pub struct PluginLoader {
    user_dir: PathBuf,
    system_dirs: Vec<PathBuf>,
    descriptors: Vec<PluginDescriptor>,
}

impl PluginLoader {
    pub fn new(user_dir: impl Into<PathBuf>) -> Self {
        Self {
            user_dir: user_dir.into(),
            system_dirs: Vec::new(),
            descriptors: Vec::new(),
        }
    }

    pub fn with_system_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.system_dirs.push(dir.into());
        self
    }

    /// Default user plugin directory under the user data directory.
    pub fn default_user_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_dir().ok_or(HostError::NoDataDir)?;
        Ok(data_dir.join("pyhost").join("plugins"))
    }

    pub fn user_dir(&self) -> &Path {
        &self.user_dir
    }

    pub fn descriptors(&self) -> &[PluginDescriptor] {
        &self.descriptors
    }

    /// Scan the user and system plugin directories, replacing any previously
    /// discovered descriptors. Returns the number of valid plugins found.
    pub fn discover(&mut self) -> usize {
        let start = Instant::now();
        self.descriptors.clear();

        let dirs: Vec<PathBuf> = std::iter::once(self.user_dir.clone())
            .chain(self.system_dirs.iter().cloned())
            .collect();

        for dir in dirs {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    debug!("Skipping plugin directory {}: {}", dir.display(), e);
                    continue;
                }
            };
            debug!("Searching plugins in {}", dir.display());

            for entry in entries.flatten() {
                let path = entry.path();
                match PluginDescriptor::from_path(&path) {
                    Ok(descriptor) => {
                        if self.descriptors.iter().any(|d| d.name == descriptor.name) {
                            debug!(
                                "Skipping {}: plugin '{}' already discovered",
                                path.display(),
                                descriptor.name
                            );
                            continue;
                        }
                        debug!("Found valid plugin {}", path.display());
                        self.descriptors.push(descriptor);
                    }
                    Err(MetadataError::NotAPlugin(reason)) => {
                        debug!("Not a plugin {}: {}", path.display(), reason);
                    }
                    Err(MetadataError::Invalid(reason)) => {
                        warn!("Invalid plugin {}: {}", path.display(), reason);
                    }
                }
            }
        }

        info!(
            "[{} ms] plugin scan, {} plugins",
            start.elapsed().as_millis(),
            self.descriptors.len()
        );
        self.descriptors.len()
    }

    /// Run one full load pass over all discovered plugins.
    ///
    /// The pass begins only after the environment validates and the version
    /// probe succeeds; either failing is fatal for the whole pass and is
    /// surfaced once. Per-plugin failures are isolated and recorded in the
    /// returned reports. A reset requested while the pass runs is queued by
    /// the manager and reported back via [`EnvironmentManager::end_load_pass`].
    pub fn load_all(
        &mut self,
        manager: &mut EnvironmentManager,
        backend: &dyn PackageBackend,
        import: &mut dyn PluginImport,
        consent: &dyn Confirm,
    ) -> Result<Vec<LoadReport>> {
        manager.begin_load_pass()?;
        let env = match manager.environment() {
            Some(env) => env.clone(),
            None => {
                manager.end_load_pass();
                return Err(HostError::InterpreterInit(
                    "environment vanished before load pass".to_string(),
                ));
            }
        };

        let versions = probe::probe(&env);
        if versions.is_unknown() {
            manager.end_load_pass();
            return Err(HostError::InterpreterInit(format!(
                "version probe failed for interpreter at {}",
                env.python().display()
            )));
        }
        debug!(
            "Interpreter {} / binding {} / API {}",
            versions.interpreter, versions.binding, versions.api
        );

        let resolver = DependencyResolver::new(backend);
        let installer = DependencyInstaller::new(backend);
        let reports = self
            .descriptors
            .iter_mut()
            .map(|descriptor| load_one(descriptor, &env, &resolver, &installer, import, consent))
            .collect();

        if manager.end_load_pass() {
            info!("Load pass complete; a queued environment reset is pending");
        }
        Ok(reports)
    }
}

fn load_one(
    descriptor: &mut PluginDescriptor,
    env: &Environment,
    resolver: &DependencyResolver<'_>,
    installer: &DependencyInstaller<'_>,
    import: &mut dyn PluginImport,
    consent: &dyn Confirm,
) -> LoadReport {
    descriptor.state = LoadState::Resolving;

    // Required executables first; a missing one fails the plugin outright.
    for exe in &descriptor.metadata.executables {
        if which::which(exe).is_err() {
            let reason = HostError::ExecutableNotFound(exe.clone()).to_string();
            warn!(plugin = descriptor.name.as_str(), "{}", reason);
            descriptor.state = LoadState::Failed(reason);
            return report(descriptor);
        }
    }

    match resolver.resolve(descriptor, env) {
        Ok(set) if !set.is_satisfied() => {
            descriptor.state = LoadState::NeedsInstall;
            let prompt = format!(
                "Plugin '{}' is missing required packages: {}. Install now?",
                descriptor.name,
                set.missing().join(", ")
            );
            if !consent.confirm(&prompt) {
                info!(plugin = descriptor.name.as_str(), "{}", DECLINED_INSTALL);
                descriptor.state = LoadState::Failed(DECLINED_INSTALL.to_string());
                return report(descriptor);
            }
            if let Err(e) = installer.install(&set, env) {
                warn!(plugin = descriptor.name.as_str(), "{}", e);
                descriptor.state = LoadState::Failed(e.to_string());
                return report(descriptor);
            }
            // Confirm the install actually satisfied the set.
            match resolver.resolve(descriptor, env) {
                Ok(set) if set.is_satisfied() => {}
                Ok(_) => {
                    descriptor.state =
                        LoadState::Failed("dependencies still missing after install".to_string());
                    return report(descriptor);
                }
                Err(e) => {
                    descriptor.state = LoadState::Failed(e.to_string());
                    return report(descriptor);
                }
            }
        }
        Ok(_) => {}
        Err(e) => {
            warn!(plugin = descriptor.name.as_str(), "{}", e);
            descriptor.state = LoadState::Failed(e.to_string());
            return report(descriptor);
        }
    }

    descriptor.state = LoadState::Loading;
    let start = Instant::now();
    match import.import(descriptor, env) {
        Ok(()) => {
            let message = format!("Loading: {} ms", start.elapsed().as_millis());
            info!(plugin = descriptor.name.as_str(), "{}", message);
            descriptor.state = LoadState::Loaded;
            LoadReport {
                name: descriptor.name.clone(),
                state: LoadState::Loaded,
                message: Some(message),
            }
        }
        Err(e) => {
            warn!(plugin = descriptor.name.as_str(), "{}", e);
            descriptor.state = LoadState::Failed(e.to_string());
            report(descriptor)
        }
    }
}

fn report(descriptor: &PluginDescriptor) -> LoadReport {
    LoadReport {
        name: descriptor.name.clone(),
        state: descriptor.state.clone(),
        message: None,
    }
}
