//! End-to-end scenarios for the environment lifecycle and plugin load pass.
//!
//! The environment tests drive the real subprocess path against a scripted
//! stand-in interpreter; the load-pass tests exercise the loader against
//! scripted package and import backends.

#![cfg(unix)]

use pyhost::deps::{install_in_background, DependencyResolver, InstallReport, PackageBackend};
use pyhost::loader::{LoadState, PluginImport, PluginLoader, DECLINED_INSTALL};
use pyhost::probe;
use pyhost::venv::{EnvState, Environment, EnvironmentManager, ResetOutcome};
use pyhost::{HostError, Result};
use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Mutex;

/// Interpreter stand-in: creates a venv layout on `-m venv` and answers `-c`
/// scripts with a fixed version payload.
fn write_interpreter(dir: &Path, version: &str) -> PathBuf {
    let path = dir.join("python3");
    let script = format!(
        "#!/bin/sh\n\
         if [ \"$1\" = \"-m\" ] && [ \"$2\" = \"venv\" ]; then\n\
         \x20 mkdir -p \"$3/bin\"\n\
         \x20 cp \"$0\" \"$3/bin/python3\"\n\
         \x20 exit 0\n\
         fi\n\
         if [ \"$1\" = \"-c\" ]; then\n\
         \x20 echo '{{\"interpreter\": \"{version}\", \"binding\": \"0.3.0\"}}'\n\
         \x20 exit 0\n\
         fi\n\
         exit 0\n"
    );
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Interpreter stand-in whose venv creation fails with the given exit code.
fn write_broken_interpreter(dir: &Path, exit_code: i32) -> PathBuf {
    let path = dir.join("python3");
    let script = format!("#!/bin/sh\nexit {exit_code}\n");
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn write_plugin(dir: &Path, name: &str, body: &str) {
    fs::write(dir.join(format!("{name}.py")), body).unwrap();
}

#[derive(Default)]
struct FakeBackend {
    installed: Mutex<BTreeSet<String>>,
    install_calls: Mutex<Vec<Vec<String>>>,
    install_exit: i32,
}

impl FakeBackend {
    fn with_installed(packages: &[&str]) -> Self {
        Self {
            installed: Mutex::new(packages.iter().map(|p| p.to_string()).collect()),
            ..Self::default()
        }
    }

    fn failing(exit_code: i32) -> Self {
        Self {
            install_exit: exit_code,
            ..Self::default()
        }
    }
}

impl PackageBackend for FakeBackend {
    fn freeze(&self, _env: &Environment) -> Result<String> {
        let installed = self.installed.lock().unwrap();
        Ok(installed
            .iter()
            .map(|name| format!("{name}==1.0"))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    fn install(&self, _env: &Environment, requirements: &[String]) -> Result<i32> {
        self.install_calls.lock().unwrap().push(requirements.to_vec());
        if self.install_exit == 0 {
            let mut installed = self.installed.lock().unwrap();
            for requirement in requirements {
                installed.insert(requirement.clone());
            }
        }
        Ok(self.install_exit)
    }
}

#[derive(Default)]
struct FakeImport {
    fail: BTreeSet<String>,
    imported: Vec<String>,
}

impl PluginImport for FakeImport {
    fn import(&mut self, descriptor: &pyhost::loader::PluginDescriptor, _env: &Environment) -> Result<()> {
        if self.fail.contains(descriptor.name()) {
            return Err(HostError::PluginLoad {
                name: descriptor.name().to_string(),
                reason: "boom".to_string(),
            });
        }
        self.imported.push(descriptor.name().to_string());
        Ok(())
    }
}

struct Fixture {
    _bin: tempfile::TempDir,
    root: tempfile::TempDir,
    manager: EnvironmentManager,
}

fn open_environment() -> Fixture {
    let bin = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    write_interpreter(bin.path(), "3.12.1");

    let mut manager = EnvironmentManager::new(root.path().join("venv"))
        .with_search_path(bin.path());
    manager.open().unwrap();

    Fixture {
        _bin: bin,
        root,
        manager,
    }
}

#[test]
fn open_fails_without_interpreter_and_leaves_no_state() {
    let empty = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let venv = root.path().join("venv");

    let mut manager = EnvironmentManager::new(&venv).with_search_path(empty.path());
    let err = manager.open().unwrap_err();

    assert_eq!(err.to_string(), "No 'python3' in $PATH.");
    assert!(!venv.exists());
    assert!(manager.environment().is_none());
}

#[test]
fn open_creates_environment_and_probe_succeeds() {
    let fixture = open_environment();
    let env = fixture.manager.environment().unwrap();

    assert_eq!(env.state(), EnvState::Valid);
    assert!(env.python().exists());

    let versions = probe::probe(env);
    assert!(!versions.is_unknown());
    assert_eq!(versions.interpreter, "3.12.1");
    assert_eq!(versions.binding, "0.3.0");
    assert_eq!(versions.api, probe::api_version_string());
}

#[test]
fn probe_returns_sentinel_for_unusable_environment() {
    let mut fixture = open_environment();
    fixture
        .manager
        .reset(&|_: &str| true)
        .unwrap();

    let env = fixture.manager.environment().unwrap();
    assert!(probe::probe(env).is_unknown());
}

#[test]
fn declined_reset_leaves_environment_valid() {
    let mut fixture = open_environment();
    let outcome = fixture.manager.reset(&|_: &str| false).unwrap();

    assert_eq!(outcome, ResetOutcome::Declined);
    assert_eq!(
        fixture.manager.environment().unwrap().state(),
        EnvState::Valid
    );
}

#[test]
fn reset_recreates_environment_and_requires_restart() {
    let mut fixture = open_environment();
    let venv = fixture.manager.root().to_path_buf();

    // Residual state from before the reset must not carry over.
    let canary = venv.join("residue.txt");
    fs::write(&canary, "stale").unwrap();

    let outcome = fixture.manager.reset(&|_: &str| true).unwrap();
    assert_eq!(outcome, ResetOutcome::RestartRequired);
    assert!(!canary.exists());

    let env = fixture.manager.environment().unwrap();
    assert_eq!(env.state(), EnvState::Restarting);
    let err = fixture.manager.begin_load_pass().unwrap_err();
    assert!(matches!(err, HostError::InterpreterInit(_)));

    // A fresh open models the host restart.
    let env = fixture.manager.open().unwrap();
    assert_eq!(env.state(), EnvState::Valid);
}

#[test]
fn failed_reset_surfaces_exit_code_and_invalidates() {
    let mut fixture = open_environment();

    // The interpreter breaks before the reset runs.
    write_broken_interpreter(fixture._bin.path(), 1);

    let err = fixture.manager.reset(&|_: &str| true).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Failed initializing virtual environment. Exit code: 1."
    );

    let env = fixture.manager.environment().unwrap();
    assert_eq!(env.state(), EnvState::Invalidated);
    assert!(fixture.manager.begin_load_pass().is_err());
}

#[test]
fn disappearing_interpreter_invalidates_environment() {
    let mut fixture = open_environment();
    let python = fixture
        .manager
        .environment()
        .unwrap()
        .python()
        .to_path_buf();

    fs::remove_file(&python).unwrap();

    assert!(!fixture.manager.validate());
    let env = fixture.manager.environment().unwrap();
    assert_eq!(env.state(), EnvState::Invalidated);
    // Invalidated, not deleted: the venv root stays on disk.
    assert!(fixture.manager.root().is_dir());

    let err = fixture.manager.begin_load_pass().unwrap_err();
    assert!(matches!(err, HostError::InterpreterInit(_)));
}

#[test]
fn reset_leaving_no_interpreter_invalidates() {
    let mut fixture = open_environment();

    // Venv creation reports success but produces no interpreter.
    let path = fixture._bin.path().join("python3");
    let script = "#!/bin/sh\n\
                  if [ \"$1\" = \"-m\" ] && [ \"$2\" = \"venv\" ]; then\n\
                  \x20 mkdir -p \"$3\"\n\
                  fi\n\
                  exit 0\n";
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

    let err = fixture.manager.reset(&|_: &str| true).unwrap_err();
    assert!(err.to_string().contains("Python executable not found"));
    assert_eq!(
        fixture.manager.environment().unwrap().state(),
        EnvState::Invalidated
    );
}

#[test]
fn interpreter_version_change_rebuilds_environment() {
    let mut fixture = open_environment();
    let canary = fixture.manager.root().join("residue.txt");
    fs::write(&canary, "stale").unwrap();

    // Same interpreter version: the venv is reused.
    fixture.manager.open().unwrap();
    assert!(canary.exists());

    // New interpreter version: the venv is discarded and rebuilt.
    write_interpreter(fixture._bin.path(), "3.13.0");
    fixture.manager.open().unwrap();
    assert!(!canary.exists());
    assert_eq!(
        fixture.manager.environment().unwrap().state(),
        EnvState::Valid
    );
}

#[test]
fn declined_install_fails_plugin_and_accept_loads_it() {
    let mut fixture = open_environment();
    let plugin_dir = fixture.root.path().join("plugins");
    fs::create_dir(&plugin_dir).unwrap();
    write_plugin(
        &plugin_dir,
        "foo",
        "plugin_api = \"2.0\"\nplugin_requires = [\"bar\"]\n",
    );

    let mut loader = PluginLoader::new(&plugin_dir);
    assert_eq!(loader.discover(), 1);

    let backend = FakeBackend::default();
    let mut import = FakeImport::default();

    // Decline: the plugin fails with the recorded reason, nothing installs.
    let reports = loader
        .load_all(&mut fixture.manager, &backend, &mut import, &|_: &str| false)
        .unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(
        reports[0].state,
        LoadState::Failed(DECLINED_INSTALL.to_string())
    );
    assert!(backend.install_calls.lock().unwrap().is_empty());

    // Accept: one batched install, then the plugin loads with a timing line.
    let reports = loader
        .load_all(&mut fixture.manager, &backend, &mut import, &|_: &str| true)
        .unwrap();
    assert_eq!(reports[0].state, LoadState::Loaded);
    let message = reports[0].message.as_deref().unwrap();
    assert!(message.starts_with("Loading: "));
    assert!(message.ends_with(" ms"));

    let calls = backend.install_calls.lock().unwrap();
    assert_eq!(calls.as_slice(), &[vec!["bar".to_string()]]);
}

#[test]
fn install_failure_is_terminal_for_the_attempt() {
    let mut fixture = open_environment();
    let plugin_dir = fixture.root.path().join("plugins");
    fs::create_dir(&plugin_dir).unwrap();
    write_plugin(
        &plugin_dir,
        "foo",
        "plugin_api = \"2.0\"\nplugin_requires = [\"bar\"]\n",
    );

    let mut loader = PluginLoader::new(&plugin_dir);
    loader.discover();

    let backend = FakeBackend::failing(1);
    let mut import = FakeImport::default();
    let reports = loader
        .load_all(&mut fixture.manager, &backend, &mut import, &|_: &str| true)
        .unwrap();

    assert_eq!(
        reports[0].state,
        LoadState::Failed("Failed installing dependencies".to_string())
    );
    // No retry: one invocation only.
    assert_eq!(backend.install_calls.lock().unwrap().len(), 1);
}

#[test]
fn one_failing_plugin_does_not_abort_the_pass() {
    let mut fixture = open_environment();
    let plugin_dir = fixture.root.path().join("plugins");
    fs::create_dir(&plugin_dir).unwrap();
    for name in ["alpha", "beta", "gamma"] {
        write_plugin(&plugin_dir, name, "plugin_api = \"2.0\"\n");
    }

    let mut loader = PluginLoader::new(&plugin_dir);
    assert_eq!(loader.discover(), 3);

    let backend = FakeBackend::default();
    let mut import = FakeImport {
        fail: ["beta".to_string()].into(),
        ..FakeImport::default()
    };
    let reports = loader
        .load_all(&mut fixture.manager, &backend, &mut import, &|_: &str| true)
        .unwrap();

    let state_of = |name: &str| {
        reports
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.state.clone())
            .unwrap()
    };
    assert_eq!(state_of("alpha"), LoadState::Loaded);
    assert_eq!(state_of("gamma"), LoadState::Loaded);
    assert!(matches!(state_of("beta"), LoadState::Failed(_)));
    assert_eq!(import.imported, vec!["alpha", "gamma"]);
}

#[test]
fn missing_executable_fails_plugin_with_path_message() {
    let mut fixture = open_environment();
    let plugin_dir = fixture.root.path().join("plugins");
    fs::create_dir(&plugin_dir).unwrap();
    write_plugin(
        &plugin_dir,
        "foo",
        "plugin_api = \"2.0\"\nplugin_executables = [\"definitely-not-a-real-tool\"]\n",
    );

    let mut loader = PluginLoader::new(&plugin_dir);
    loader.discover();

    let backend = FakeBackend::default();
    let mut import = FakeImport::default();
    let reports = loader
        .load_all(&mut fixture.manager, &backend, &mut import, &|_: &str| true)
        .unwrap();

    assert_eq!(
        reports[0].state,
        LoadState::Failed("No 'definitely-not-a-real-tool' in $PATH.".to_string())
    );
}

#[test]
fn background_install_delivers_completion_message() {
    let fixture = open_environment();
    let env = fixture.manager.environment().unwrap().clone();

    let plugin_dir = fixture.root.path().join("plugins");
    fs::create_dir(&plugin_dir).unwrap();
    write_plugin(
        &plugin_dir,
        "foo",
        "plugin_api = \"2.0\"\nplugin_requires = [\"bar\"]\n",
    );
    let mut loader = PluginLoader::new(&plugin_dir);
    loader.discover();

    let backend = FakeBackend::with_installed(&[]);
    let set = DependencyResolver::new(&backend)
        .resolve(&loader.descriptors()[0], &env)
        .unwrap();
    assert_eq!(set.missing(), vec!["bar"]);

    let (tx, rx) = mpsc::channel();
    let handle = install_in_background(backend, set, env, tx);
    let result = rx.recv().unwrap();
    assert_eq!(result.unwrap(), InstallReport { exit_code: 0 });
    handle.join().unwrap();
}
