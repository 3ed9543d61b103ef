//! pyhost: embedded Python plugin host with virtual environment lifecycle management
//!
//! The host owns one isolated Python environment per process. It creates and
//! validates the environment, probes interpreter/binding/API versions, resolves
//! and installs plugin dependencies on user consent, and loads plugins with
//! per-plugin failure isolation and load-time diagnostics.

pub mod deps;
mod error;
pub mod loader;
pub mod metadata;
pub mod probe;
pub mod venv;

pub use error::{HostError, Result};

/// Major plugin API version the host speaks. Plugins declaring a different
/// major version are rejected at discovery.
pub const MAJOR_API_VERSION: u32 = 2;

/// Highest minor plugin API revision this host supports.
pub const MINOR_API_VERSION: u32 = 5;

/// User consent seam for disruptive actions: resetting the virtual
/// environment and installing missing plugin dependencies.
pub trait Confirm {
    /// Present `prompt` to the user and return whether they accepted.
    fn confirm(&self, prompt: &str) -> bool;
}

impl<F: Fn(&str) -> bool> Confirm for F {
    fn confirm(&self, prompt: &str) -> bool {
        self(prompt)
    }
}

pub fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pyhost=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().compact())
        .init();
}
