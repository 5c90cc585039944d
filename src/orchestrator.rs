use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::types::PlaypenConfig;
use crate::editor::EditorSync;
use crate::error::{PlaypenError, Result};
use crate::preview::{PreviewBridge, PreviewFrame};
use crate::project::ProjectDescriptor;
use crate::relay::{spawn_relay, LogSink};
use crate::resize::ResizeCoordinator;
use crate::sandbox::{SandboxRuntime, SpawnOptions};
use crate::session::SandboxSession;
use crate::shell::{ShellBridge, ShellHandle};
use crate::terminal::{self, SharedTerminal};

/// Startup step, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Boot,
    Mount,
    Install,
    Preview,
    DevServer,
    Terminal,
    Shell,
    Wiring,
    Running,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Boot => "boot",
            Stage::Mount => "mount",
            Stage::Install => "install",
            Stage::Preview => "preview",
            Stage::DevServer => "dev-server",
            Stage::Terminal => "terminal",
            Stage::Shell => "shell",
            Stage::Wiring => "wiring",
            Stage::Running => "running",
        };
        f.write_str(name)
    }
}

/// A startup step failed; nothing after it was attempted.
#[derive(Debug, thiserror::Error)]
#[error("startup failed at stage {stage}: {source}")]
pub struct StartupError {
    pub stage: Stage,
    #[source]
    pub source: PlaypenError,
}

/// What the host provides: the terminal, viewport resize events and the
/// editor's content stream.
pub struct HostSurface {
    pub terminal: SharedTerminal,
    pub resizes: mpsc::Receiver<()>,
    pub edits: mpsc::Receiver<String>,
}

pub struct Orchestrator {
    config: PlaypenConfig,
    project: ProjectDescriptor,
    session: Arc<SandboxSession>,
    runtime: Option<Arc<dyn SandboxRuntime>>,
    preview: Arc<PreviewFrame>,
    stage: Stage,
}

impl Orchestrator {
    pub fn new(config: PlaypenConfig, project: ProjectDescriptor) -> Self {
        let preview = Arc::new(PreviewFrame::new(&config.preview.placeholder));
        Self {
            config,
            project,
            session: Arc::new(SandboxSession::new()),
            runtime: None,
            preview,
            stage: Stage::Boot,
        }
    }

    /// Boot into `runtime` instead of the one the config selects.
    pub fn with_runtime(mut self, runtime: Arc<dyn SandboxRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn session(&self) -> &Arc<SandboxSession> {
        &self.session
    }

    pub fn preview(&self) -> &Arc<PreviewFrame> {
        &self.preview
    }

    pub fn project(&self) -> &ProjectDescriptor {
        &self.project
    }

    /// The stage reached so far; the failing stage after an error.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn enter(&mut self, stage: Stage) {
        self.stage = stage;
        info!(stage = %stage, "Startup stage");
    }

    fn fail(&self, source: PlaypenError) -> StartupError {
        error!(stage = %self.stage, error = %source, "Startup failed");
        StartupError {
            stage: self.stage,
            source,
        }
    }

    /// Run the startup sequence.
    ///
    /// The install command's exit is awaited before the dev server is
    /// spawned; the dev server itself is not awaited. Returns the shell once
    /// every bridge is armed.
    pub async fn start(
        &mut self,
        surface: HostSurface,
    ) -> std::result::Result<ShellHandle, StartupError> {
        let HostSurface {
            terminal,
            resizes,
            edits,
        } = surface;

        self.enter(Stage::Boot);
        let booted = match self.runtime.take() {
            Some(runtime) => self.session.boot_with(runtime).await,
            None => self.session.boot(&self.config.sandbox).await,
        };
        booted.map_err(|e| self.fail(e))?;

        self.enter(Stage::Mount);
        self.session
            .mount(&self.project)
            .await
            .map_err(|e| self.fail(e))?;

        self.enter(Stage::Install);
        self.install().await.map_err(|e| self.fail(e))?;

        // Armed before the dev server so its first ready event is not missed
        self.enter(Stage::Preview);
        PreviewBridge::arm(&self.session, self.preview.clone()).map_err(|e| self.fail(e))?;

        self.enter(Stage::DevServer);
        self.start_dev_server().await.map_err(|e| self.fail(e))?;

        self.enter(Stage::Terminal);
        open_terminal(&terminal).map_err(|e| self.fail(e))?;

        self.enter(Stage::Shell);
        let shell = ShellBridge::start(&self.session, &terminal, &self.config.sandbox.shell)
            .await
            .map_err(|e| self.fail(e))?;

        self.enter(Stage::Wiring);
        ResizeCoordinator::arm(&self.session, terminal, shell.resizer(), resizes);
        EditorSync::new(self.session.clone(), &self.config.editor.path).arm(edits);

        self.enter(Stage::Running);
        Ok(shell)
    }

    async fn install(&self) -> Result<()> {
        let install = &self.config.sandbox.install;
        let mut process = self
            .session
            .spawn(&install.program, &install.args, SpawnOptions::default())
            .await?;
        if let Some(output) = process.take_output() {
            spawn_relay(&self.session, output, LogSink::new(&install.to_string()));
        }

        let code = process.wait().await?;
        if code != 0 {
            return Err(PlaypenError::InstallFailed { code });
        }
        info!(command = %install, "Dependencies installed");
        Ok(())
    }

    async fn start_dev_server(&self) -> Result<()> {
        let start = &self.config.sandbox.start;
        let mut process = self
            .session
            .spawn(&start.program, &start.args, SpawnOptions::default())
            .await?;
        if let Some(output) = process.take_output() {
            spawn_relay(&self.session, output, LogSink::new(&start.to_string()));
        }

        if let Some(exit) = process.take_exit() {
            let command = start.to_string();
            self.session.track(tokio::spawn(async move {
                if let Ok(code) = exit.wait().await {
                    warn!(command = %command, code = code, "Dev server exited");
                }
            }));
        }
        Ok(())
    }

    pub async fn teardown(&self) -> Result<()> {
        self.session.teardown().await
    }
}

fn open_terminal(terminal: &SharedTerminal) -> Result<()> {
    let mut widget = terminal::lock(terminal)?;
    widget.open()?;
    widget.fit()?;
    Ok(())
}
