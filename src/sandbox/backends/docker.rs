use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use portable_pty::CommandBuilder;
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::types::DockerConfig;
use crate::error::{PlaypenError, Result};
use crate::sandbox::process::{spawn_piped, spawn_pty, ProcessTable};
use crate::sandbox::ready::ReadyDetector;
use crate::sandbox::traits::{SandboxInfo, SandboxRuntime, ServerReady, SpawnOptions};
use crate::sandbox::workspace::Workspace;
use crate::sandbox::ManagedProcess;

/// Docker sandbox runtime.
///
/// A single container stays running for the whole session with the host
/// workspace bind-mounted at the configured workdir. Files are written on the
/// host side of the mount; processes run via `docker exec`. Configured ports
/// are published 1:1 so a server-ready URL on `localhost` resolves from the host.
pub struct DockerRuntime {
    image: String,
    workspace: Workspace,
    workdir: String,
    env_vars: Vec<(String, String)>,
    publish_ports: Vec<u16>,
    memory_limit_mb: u64,
    container_id: String,
    detector: ReadyDetector,
    processes: ProcessTable,
    torn_down: AtomicBool,
}

impl DockerRuntime {
    /// Boot a session container. The caller has checked [`Self::is_available`].
    pub async fn new(
        config: DockerConfig,
        root: PathBuf,
        workdir: String,
        env_vars: Vec<(String, String)>,
    ) -> Result<Self> {
        if !Self::image_exists(&config.image).await {
            Self::pull_image(&config.image).await?;
        }

        let workspace = Workspace::create(root).await?;
        let (detector, _) = ReadyDetector::new("localhost");

        let mut runtime = Self {
            image: config.image,
            workspace,
            workdir,
            env_vars,
            publish_ports: config.publish_ports,
            memory_limit_mb: config.memory_limit_mb,
            container_id: String::new(),
            detector,
            processes: ProcessTable::default(),
            torn_down: AtomicBool::new(false),
        };
        runtime.launch().await?;

        info!(
            image = %runtime.image,
            container_id = %runtime.container_id,
            "Docker runtime booted"
        );

        Ok(runtime)
    }

    /// Check if the Docker backend is available on this system.
    ///
    /// Returns true if Docker daemon is accessible.
    pub async fn is_available() -> bool {
        match Command::new("docker")
            .args(["info"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }

    /// Check if a Docker image exists locally.
    async fn image_exists(image: &str) -> bool {
        match Command::new("docker")
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }

    async fn pull_image(image: &str) -> Result<()> {
        info!(image = %image, "Pulling Docker image...");

        let output = Command::new("docker")
            .args(["pull", image])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| PlaypenError::BootFailure(format!("Failed to run docker pull: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PlaypenError::BootFailure(format!(
                "Failed to pull Docker image '{}': {}",
                image,
                stderr.trim()
            )));
        }

        Ok(())
    }

    /// Start the long-lived session container and return its ID.
    /// Start the container, removing the workspace again if that fails.
    async fn launch(&mut self) -> Result<()> {
        match self.start_container().await {
            Ok(id) => {
                self.container_id = id;
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = self.workspace.remove().await {
                    warn!(error = %cleanup, "Failed to clean up workspace after boot failure");
                }
                Err(e)
            }
        }
    }

    async fn start_container(&self) -> Result<String> {
        let mut cmd = Command::new("docker");
        cmd.args(["run", "-d", "--rm"]);

        cmd.arg(format!("--memory={}m", self.memory_limit_mb));

        for port in &self.publish_ports {
            cmd.arg("-p");
            cmd.arg(format!("{}:{}", port, port));
        }

        cmd.arg("-v");
        cmd.arg(format!(
            "{}:{}:rw",
            self.workspace.root().display(),
            self.workdir
        ));

        for (key, value) in &self.env_vars {
            cmd.arg("-e");
            cmd.arg(format!("{}={}", key, value));
        }

        cmd.args(["-w", &self.workdir]);

        // Image and command to keep container running
        cmd.arg(&self.image);
        cmd.args(["tail", "-f", "/dev/null"]);

        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = cmd.output().await.map_err(|e| {
            PlaypenError::BootFailure(format!("Failed to start Docker container: {}", e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PlaypenError::BootFailure(format!(
                "Failed to start Docker container: {}",
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Check that `command` resolves inside the container.
    async fn locate(&self, command: &str) -> Result<()> {
        let status = Command::new("docker")
            .args(["exec", &self.container_id, "sh", "-c", "command -v \"$0\"", command])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| PlaypenError::spawn(command, e))?;

        if !status.success() {
            return Err(PlaypenError::spawn(command, "command not found in container"));
        }
        Ok(())
    }

    /// Arguments for `docker exec` up to and including the container ID.
    fn exec_args(&self, tty: bool, extra_env: &[(String, String)]) -> Vec<String> {
        let mut args = vec!["exec".to_string(), "-i".to_string()];
        if tty {
            args.push("-t".to_string());
            args.push("-e".to_string());
            args.push("TERM=xterm-256color".to_string());
        }
        args.push("-w".to_string());
        args.push(self.workdir.clone());
        for (key, value) in self.env_vars.iter().chain(extra_env.iter()) {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(self.container_id.clone());
        args
    }

    /// Stop the session container (it was started with --rm).
    async fn stop_container(&self) -> Result<()> {
        info!(container_id = %self.container_id, "Stopping Docker container...");

        let output = Command::new("docker")
            .args(["stop", "-t", "1", &self.container_id])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| PlaypenError::Other(anyhow::anyhow!("Failed to stop container: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(container_id = %self.container_id, error = %stderr.trim(), "Failed to stop container");
        }

        Ok(())
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
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
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(PlaypenError::spawn(command, "sandbox has been torn down"));
        }
        self.locate(command).await?;

        let label = std::iter::once(command)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        let mut exec = self.exec_args(options.terminal.is_some(), &options.env);
        exec.push(command.to_string());
        exec.extend(args.iter().cloned());

        debug!(command = %label, container_id = %self.container_id, "Spawning via docker exec");

        match options.terminal {
            Some(size) => {
                let mut cmd = CommandBuilder::new("docker");
                cmd.args(&exec);
                spawn_pty(&label, cmd, size, &self.processes)
            }
            None => {
                let mut cmd = Command::new("docker");
                cmd.args(&exec);
                spawn_piped(&label, cmd, self.detector.clone(), &self.processes)
            }
        }
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.detector.subscribe()
    }

    fn info(&self) -> SandboxInfo {
        SandboxInfo {
            backend_type: "docker".to_string(),
            instance_id: Some(self.container_id.clone()),
            running: !self.torn_down.load(Ordering::SeqCst),
            metadata: HashMap::from([
                ("image".to_string(), self.image.clone()),
                ("workdir".to_string(), self.workdir.clone()),
                (
                    "workspace".to_string(),
                    self.workspace.root().display().to_string(),
                ),
                (
                    "ports".to_string(),
                    self.publish_ports
                        .iter()
                        .map(u16::to_string)
                        .collect::<Vec<_>>()
                        .join(","),
                ),
            ]),
        }
    }

    async fn teardown(&self) -> Result<()> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.processes.kill_all();
        self.stop_container().await?;
        self.workspace.remove().await?;
        info!(container_id = %self.container_id, "Docker runtime torn down");
        Ok(())
    }
}
