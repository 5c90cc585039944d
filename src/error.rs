use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlaypenError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    #[error("Invalid project: {0}")]
    InvalidProject(String),

    // Session errors
    #[error("Sandbox boot failed: {0}")]
    BootFailure(String),

    #[error("Failed to mount project: {0}")]
    MountFailure(String),

    #[error("Failed to spawn '{command}': {reason}")]
    SpawnFailure { command: String, reason: String },

    #[error("Failed to write '{path}': {reason}")]
    WriteFailure { path: String, reason: String },

    #[error("Dependency install exited with code {code}")]
    InstallFailed { code: i32 },

    // Relay errors
    #[error("Output relay to {sink} failed: {reason}")]
    RelayFailure { sink: String, reason: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PlaypenError {
    pub(crate) fn spawn(command: &str, reason: impl ToString) -> Self {
        Self::SpawnFailure {
            command: command.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn write(path: &str, reason: impl ToString) -> Self {
        Self::WriteFailure {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PlaypenError>;
