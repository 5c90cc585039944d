use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::sandbox::TerminalSize;
use crate::session::SandboxSession;
use crate::shell::ShellResizer;
use crate::terminal::{self, SharedTerminal};

pub struct ResizeCoordinator;

impl ResizeCoordinator {
    /// Refit the terminal, then pass the fitted size to the shell.
    ///
    /// A failed shell resize is logged; the shell keeps its old geometry.
    pub fn on_resize(terminal: &SharedTerminal, shell: &ShellResizer) -> Result<TerminalSize> {
        let size = terminal::lock(terminal)?.fit()?;
        if let Err(e) = shell.resize(size.columns, size.rows) {
            warn!(columns = size.columns, rows = size.rows, error = %e, "Shell resize failed");
        } else {
            debug!(columns = size.columns, rows = size.rows, "Shell resized");
        }
        Ok(size)
    }

    /// Handle every viewport resize event until teardown.
    pub fn arm(
        session: &SandboxSession,
        terminal: SharedTerminal,
        shell: ShellResizer,
        mut events: mpsc::Receiver<()>,
    ) {
        session.track(tokio::spawn(async move {
            while events.recv().await.is_some() {
                if let Err(e) = Self::on_resize(&terminal, &shell) {
                    warn!(error = %e, "Terminal fit failed");
                }
            }
        }));
    }
}

/// Viewport resize events for the controlling terminal (SIGWINCH).
#[cfg(unix)]
pub fn viewport_resizes(session: &SandboxSession) -> Result<mpsc::Receiver<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut winch = signal(SignalKind::window_change())?;
    let (tx, rx) = mpsc::channel(8);
    session.track(tokio::spawn(async move {
        while winch.recv().await.is_some() {
            // Resizes coalesce: one pending event is enough
            if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(()) {
                break;
            }
        }
    }));
    Ok(rx)
}

/// Viewport resize events; none are delivered on this platform.
#[cfg(not(unix))]
pub fn viewport_resizes(session: &SandboxSession) -> Result<mpsc::Receiver<()>> {
    let (tx, rx) = mpsc::channel(1);
    session.track(tokio::spawn(async move {
        tx.closed().await;
    }));
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::types::CommandLine;
    use crate::shell::ShellBridge;
    use crate::testing::{ScriptedRuntime, ScriptedTerminal};

    #[tokio::test]
    async fn test_resize_event_uses_fitted_size() {
        let runtime = ScriptedRuntime::new();
        let session = SandboxSession::new();
        session.boot_with(runtime.clone()).await.unwrap();

        let (term, remote) = ScriptedTerminal::new(TerminalSize::new(120, 40));
        let terminal = terminal::shared(term);
        let handle = ShellBridge::start(&session, &terminal, &CommandLine::new("jsh", &[]))
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(8);
        ResizeCoordinator::arm(&session, terminal.clone(), handle.resizer(), rx);

        remote.fit_to(TerminalSize::new(80, 24));
        tx.send(()).await.unwrap();
        runtime.wait_for_resizes(1, Duration::from_secs(2)).await;

        assert_eq!(runtime.resizes(), vec![TerminalSize::new(80, 24)]);
        assert_eq!(terminal::lock(&terminal).unwrap().size(), TerminalSize::new(80, 24));
    }

    #[tokio::test]
    async fn test_failed_shell_resize_is_not_fatal() {
        let runtime = ScriptedRuntime::new();
        let session = SandboxSession::new();
        session.boot_with(runtime.clone()).await.unwrap();

        let (term, remote) = ScriptedTerminal::new(TerminalSize::new(80, 24));
        let terminal = terminal::shared(term);
        let handle = ShellBridge::start(&session, &terminal, &CommandLine::new("jsh", &[]))
            .await
            .unwrap();

        runtime.reject_resizes();
        remote.fit_to(TerminalSize::new(100, 50));
        let size = ResizeCoordinator::on_resize(&terminal, &handle.resizer()).unwrap();
        assert_eq!(size, TerminalSize::new(100, 50));
        assert!(runtime.resizes().is_empty());

        runtime.accept_resizes();
        remote.fit_to(TerminalSize::new(90, 30));
        ResizeCoordinator::on_resize(&terminal, &handle.resizer()).unwrap();
        assert_eq!(runtime.resizes(), vec![TerminalSize::new(90, 30)]);
    }

    #[tokio::test]
    async fn test_coordinator_stops_on_teardown() {
        let runtime = ScriptedRuntime::new();
        let session = SandboxSession::new();
        session.boot_with(runtime.clone()).await.unwrap();

        let (term, _remote) = ScriptedTerminal::new(TerminalSize::new(80, 24));
        let terminal = terminal::shared(term);
        let handle = ShellBridge::start(&session, &terminal, &CommandLine::new("jsh", &[]))
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(8);
        ResizeCoordinator::arm(&session, terminal, handle.resizer(), rx);
        session.teardown().await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), tx.closed())
            .await
            .unwrap();
    }
}
