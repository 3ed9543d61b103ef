use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    /// An executable required by the host or a plugin is not on the search path.
    #[error("No '{0}' in $PATH.")]
    ExecutableNotFound(String),

    /// The environment-creation subprocess exited non-zero.
    #[error("Failed initializing virtual environment. Exit code: {0}.")]
    VenvInit(i32),

    /// Environment missing, corrupt, or otherwise unusable.
    #[error("Virtual environment error: {0}")]
    Environment(String),

    /// The batched dependency-installation subprocess failed.
    #[error("Failed installing dependencies")]
    InstallFailed { exit_code: Option<i32> },

    /// A single plugin failed to import or bind. Never propagates past the
    /// loader boundary; recorded per plugin instead.
    #[error("Plugin '{name}' failed to load: {reason}")]
    PluginLoad { name: String, reason: String },

    /// Host-level interpreter bootstrap failure. Fatal for the whole load pass.
    #[error("Interpreter initialization failed: {0}")]
    InterpreterInit(String),

    #[error("No data directory found")]
    NoDataDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HostError>;

#[cfg(test)]
mod tests {
    use super::*;

    // The user-visible message strings are format contracts. Keep them verbatim.

    #[test]
    fn executable_not_found_message() {
        let err = HostError::ExecutableNotFound("python3".to_string());
        assert_eq!(err.to_string(), "No 'python3' in $PATH.");
    }

    #[test]
    fn venv_init_message() {
        let err = HostError::VenvInit(1);
        assert_eq!(
            err.to_string(),
            "Failed initializing virtual environment. Exit code: 1."
        );
    }

    #[test]
    fn install_failed_message() {
        let err = HostError::InstallFailed { exit_code: Some(2) };
        assert_eq!(err.to_string(), "Failed installing dependencies");
    }
}
