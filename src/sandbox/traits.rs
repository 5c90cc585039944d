use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::{PlaypenError, Result};
use crate::project::ProjectDescriptor;
use crate::sandbox::ManagedProcess;

/// Pseudo-terminal geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TerminalSize {
    pub columns: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub fn new(columns: u16, rows: u16) -> Self {
        Self { columns, rows }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

/// Options for a single spawn.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Run under a pseudo-terminal with this initial geometry
    pub terminal: Option<TerminalSize>,
    /// Extra environment variables for this process only
    pub env: Vec<(String, String)>,
}

impl SpawnOptions {
    pub fn terminal(size: TerminalSize) -> Self {
        Self {
            terminal: Some(size),
            ..Default::default()
        }
    }
}

/// A process inside the sandbox started listening on a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerReady {
    pub port: u16,
    pub url: String,
}

/// Information about the running sandbox instance
#[derive(Debug, Clone, Serialize)]
pub struct SandboxInfo {
    /// Runtime type identifier
    pub backend_type: String,
    /// Instance identifier (workspace dir, container ID, etc.)
    pub instance_id: Option<String>,
    /// Whether the sandbox is currently running
    pub running: bool,
    /// Additional runtime-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Trait for sandbox runtimes.
///
/// A runtime owns an isolated project filesystem, spawns processes against
/// it and reports when one of them starts serving on a port.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Returns the runtime name (e.g., "host", "docker")
    fn name(&self) -> &str;

    /// Write every file of the project, overwriting existing content.
    async fn mount(&self, project: &ProjectDescriptor) -> Result<()> {
        for (path, content) in project.iter() {
            self.write_file(path, content)
                .await
                .map_err(|e| PlaypenError::MountFailure(e.to_string()))?;
        }
        Ok(())
    }

    /// Overwrite a single file
    async fn write_file(&self, path: &str, content: &str) -> Result<()>;

    /// Read a file back
    async fn read_file(&self, path: &str) -> Result<String>;

    /// Start a process in the project root
    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<ManagedProcess>;

    /// Subscribe to server-ready notifications.
    ///
    /// Only events sent after subscribing are delivered.
    fn server_ready(&self) -> broadcast::Receiver<ServerReady>;

    /// Get information about the sandbox instance
    fn info(&self) -> SandboxInfo;

    /// Kill every process and release the sandbox.
    /// Default implementation is a no-op for stateless runtimes.
    async fn teardown(&self) -> Result<()> {
        Ok(())
    }
}
