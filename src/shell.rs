use std::sync::Arc;

use tracing::{debug, info};

use crate::config::types::CommandLine;
use crate::error::{PlaypenError, Result};
use crate::relay::{spawn_relay, TerminalSink};
use crate::sandbox::{ExitSignal, PtyResize, SpawnOptions, TerminalSize};
use crate::session::SandboxSession;
use crate::terminal::{self, SharedTerminal};

/// Cheap, cloneable access to the shell's pseudo-terminal geometry.
#[derive(Clone)]
pub struct ShellResizer {
    inner: Arc<dyn PtyResize>,
}

impl ShellResizer {
    pub fn new(inner: Arc<dyn PtyResize>) -> Self {
        Self { inner }
    }

    pub fn resize(&self, columns: u16, rows: u16) -> Result<()> {
        self.inner.resize(TerminalSize::new(columns, rows))
    }
}

/// A running shell connected to the terminal.
pub struct ShellHandle {
    resizer: ShellResizer,
    exit: Option<ExitSignal>,
}

impl ShellHandle {
    /// Tell the shell about new terminal dimensions.
    pub fn resize(&self, columns: u16, rows: u16) -> Result<()> {
        self.resizer.resize(columns, rows)
    }

    pub fn resizer(&self) -> ShellResizer {
        self.resizer.clone()
    }

    /// Wait for the shell to exit.
    pub async fn wait(&mut self) -> Result<i32> {
        match self.exit.take() {
            Some(exit) => exit.wait().await,
            None => Err(PlaypenError::Other(anyhow::anyhow!(
                "shell exit already awaited"
            ))),
        }
    }
}

/// Spawns the shell sized to the terminal and wires both data paths:
/// shell output into the terminal, terminal keystrokes into the shell.
pub struct ShellBridge;

impl ShellBridge {
    pub async fn start(
        session: &SandboxSession,
        terminal: &SharedTerminal,
        shell: &CommandLine,
    ) -> Result<ShellHandle> {
        let (size, keystrokes) = {
            let mut widget = terminal::lock(terminal)?;
            (widget.size(), widget.take_input())
        };

        let mut process = session
            .spawn(&shell.program, &shell.args, SpawnOptions::terminal(size))
            .await?;
        info!(shell = %shell, columns = size.columns, rows = size.rows, "Shell started");

        let resizer = process
            .resizer()
            .ok_or_else(|| PlaypenError::spawn(&shell.program, "shell has no pseudo-terminal"))?;

        if let Some(output) = process.take_output() {
            spawn_relay(session, output, TerminalSink::new(terminal.clone()));
        }

        match (keystrokes, process.take_input()) {
            (Some(mut keystrokes), Some(input)) => {
                session.track(tokio::spawn(async move {
                    while let Some(data) = keystrokes.recv().await {
                        if input.send(data).await.is_err() {
                            break;
                        }
                    }
                    debug!("Keystroke bridge closed");
                }));
            }
            (None, _) => debug!("Terminal input already taken; shell is output-only"),
            (_, None) => debug!("Shell accepts no input"),
        }

        Ok(ShellHandle {
            resizer: ShellResizer::new(resizer),
            exit: process.take_exit(),
        })
    }
}
