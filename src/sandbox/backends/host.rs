use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use portable_pty::CommandBuilder;
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{PlaypenError, Result};
use crate::sandbox::process::{spawn_piped, spawn_pty, ProcessTable};
use crate::sandbox::ready::ReadyDetector;
use crate::sandbox::traits::{SandboxInfo, SandboxRuntime, ServerReady, SpawnOptions};
use crate::sandbox::workspace::Workspace;
use crate::sandbox::ManagedProcess;

/// Host sandbox runtime.
///
/// The project lives in a private workspace directory and processes run
/// natively with that directory as their working directory. `node_modules/.bin`
/// of the workspace is put first on `PATH`, the way npm scripts see it.
pub struct HostRuntime {
    workspace: Workspace,
    env_vars: Vec<(String, String)>,
    detector: ReadyDetector,
    processes: ProcessTable,
    torn_down: AtomicBool,
}

impl HostRuntime {
    pub async fn new(root: PathBuf, env_vars: Vec<(String, String)>) -> Result<Self> {
        let workspace = Workspace::create(root).await?;
        let (detector, _) = ReadyDetector::new("localhost");

        info!(root = %workspace.root().display(), "Host runtime booted");

        Ok(Self {
            workspace,
            env_vars,
            detector,
            processes: ProcessTable::default(),
            torn_down: AtomicBool::new(false),
        })
    }

    /// The host runtime needs nothing beyond a writable data directory.
    pub fn is_available() -> bool {
        true
    }

    pub fn root(&self) -> &Path {
        self.workspace.root()
    }

    fn search_path(&self) -> OsString {
        let mut dirs = vec![self.root().join("node_modules").join(".bin")];
        if let Some(path) = std::env::var_os("PATH") {
            dirs.extend(std::env::split_paths(&path));
        }
        std::env::join_paths(dirs).unwrap_or_default()
    }

    fn locate(&self, command: &str, search_path: &OsString) -> Result<PathBuf> {
        which::which_in(command, Some(search_path), self.root())
            .map_err(|e| PlaypenError::spawn(command, format!("command not found ({})", e)))
    }

    fn ensure_running(&self, command: &str) -> Result<()> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(PlaypenError::spawn(command, "sandbox has been torn down"));
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxRuntime for HostRuntime {
    fn name(&self) -> &str {
        "host"
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.workspace.write_file(path, content).await
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        self.workspace.read_file(path).await
    }

    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<ManagedProcess> {
        self.ensure_running(command)?;

        let search_path = self.search_path();
        let program = self.locate(command, &search_path)?;
        let label = std::iter::once(command)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        let env = self.env_vars.iter().chain(options.env.iter());

        debug!(command = %label, program = %program.display(), pty = options.terminal.is_some(), "Spawning on host");

        match options.terminal {
            Some(size) => {
                let mut cmd = CommandBuilder::new(&program);
                cmd.args(args);
                cmd.cwd(self.root());
                cmd.env("PATH", &search_path);
                cmd.env("TERM", "xterm-256color");
                for (key, value) in env {
                    cmd.env(key, value);
                }
                spawn_pty(&label, cmd, size, &self.processes)
            }
            None => {
                let mut cmd = Command::new(&program);
                cmd.args(args);
                cmd.current_dir(self.root());
                cmd.env("PATH", &search_path);
                for (key, value) in env {
                    cmd.env(key, value);
                }
                spawn_piped(&label, cmd, self.detector.clone(), &self.processes)
            }
        }
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.detector.subscribe()
    }

    fn info(&self) -> SandboxInfo {
        SandboxInfo {
            backend_type: "host".to_string(),
            instance_id: Some(self.root().display().to_string()),
            running: !self.torn_down.load(Ordering::SeqCst),
            metadata: HashMap::from([(
                "processes".to_string(),
                self.processes.len().to_string(),
            )]),
        }
    }

    async fn teardown(&self) -> Result<()> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.processes.kill_all();
        self.workspace.remove().await?;
        info!("Host runtime torn down");
        Ok(())
    }
}
