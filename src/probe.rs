//! Version probing for the active environment.
//!
//! A probe is read-only and never fails the host: when the environment is
//! unusable or the interpreter cannot answer, the caller gets a sentinel
//! "unknown" [`VersionInfo`] and decides itself whether that is fatal.

use crate::venv::Environment;
use crate::{MAJOR_API_VERSION, MINOR_API_VERSION};
use serde::Deserialize;
use std::process::Command;
use tracing::debug;

const UNKNOWN: &str = "unknown";

/// Interpreter script emitting the version payload as a single JSON line.
/// The binding layer is the bridge distribution plugins import to talk to the
/// host; its absence is reported as null rather than as a failure.
const PROBE_SCRIPT: &str = r#"
import json, sys
try:
    from importlib import metadata
    binding = metadata.version("pyhost-bridge")
except Exception:
    binding = None
print(json.dumps({
    "interpreter": ".".join(map(str, sys.version_info[:3])),
    "binding": binding,
}))
"#;

/// Immutable version triple for one environment snapshot at probe time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    /// Interpreter version, e.g. "3.12.1".
    pub interpreter: String,
    /// Binding-layer (host bridge) version.
    pub binding: String,
    /// Plugin API version the host speaks.
    pub api: String,
}

impl VersionInfo {
    /// Sentinel returned when the environment cannot be probed. The API
    /// version is a host constant and stays known regardless.
    pub fn unknown() -> Self {
        Self {
            interpreter: UNKNOWN.to_string(),
            binding: UNKNOWN.to_string(),
            api: api_version_string(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.interpreter == UNKNOWN
    }
}

pub fn api_version_string() -> String {
    format!("{}.{}", MAJOR_API_VERSION, MINOR_API_VERSION)
}

#[derive(Deserialize)]
struct ProbePayload {
    interpreter: String,
    binding: Option<String>,
}

/// Query interpreter and binding-layer versions from the environment.
///
/// Reflects the environment state as of the most recently completed
/// open/reset; no side effects.
pub fn probe(env: &Environment) -> VersionInfo {
    if !env.is_usable() {
        debug!("Probe skipped: environment at {} not usable", env.root().display());
        return VersionInfo::unknown();
    }

    let output = match Command::new(env.python()).args(["-c", PROBE_SCRIPT]).output() {
        Ok(output) => output,
        Err(e) => {
            debug!("Probe failed to spawn interpreter: {}", e);
            return VersionInfo::unknown();
        }
    };

    if !output.status.success() {
        debug!(
            "Probe interpreter exited with {:?}: {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return VersionInfo::unknown();
    }

    parse_probe_output(&String::from_utf8_lossy(&output.stdout))
}

fn parse_probe_output(stdout: &str) -> VersionInfo {
    match serde_json::from_str::<ProbePayload>(stdout.trim()) {
        Ok(payload) => VersionInfo {
            interpreter: payload.interpreter,
            binding: payload.binding.unwrap_or_else(|| UNKNOWN.to_string()),
            api: api_version_string(),
        },
        Err(e) => {
            debug!("Probe output not parseable: {}", e);
            VersionInfo::unknown()
        }
    }
}
