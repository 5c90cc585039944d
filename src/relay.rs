use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{PlaypenError, Result};
use crate::session::SandboxSession;
use crate::terminal::{self, SharedTerminal};

/// Receives relayed chunks. An error ends the relay.
pub trait RelaySink: Send {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    fn send(&mut self, chunk: String) -> Result<()>;
}

/// Sink backed by a closure.
pub struct FnSink<F> {
    name: String,
    f: F,
}

impl<F> FnSink<F>
where
    F: FnMut(String) -> Result<()> + Send,
{
    pub fn new(name: &str, f: F) -> Self {
        Self {
            name: name.to_string(),
            f,
        }
    }
}

impl<F> RelaySink for FnSink<F>
where
    F: FnMut(String) -> Result<()> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&mut self, chunk: String) -> Result<()> {
        (self.f)(chunk)
    }
}

/// Logs every line of output at info level, tagged with the process.
pub struct LogSink {
    process: String,
}

impl LogSink {
    pub fn new(process: &str) -> Self {
        Self {
            process: process.to_string(),
        }
    }
}

impl RelaySink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn send(&mut self, chunk: String) -> Result<()> {
        for line in chunk.lines() {
            info!(process = %self.process, "{}", line);
        }
        Ok(())
    }
}

/// Writes chunks into a terminal widget.
pub struct TerminalSink {
    terminal: SharedTerminal,
}

impl TerminalSink {
    pub fn new(terminal: SharedTerminal) -> Self {
        Self { terminal }
    }
}

impl RelaySink for TerminalSink {
    fn name(&self) -> &str {
        "terminal"
    }

    fn send(&mut self, chunk: String) -> Result<()> {
        terminal::lock(&self.terminal)?.write(&chunk)
    }
}

/// Forward every chunk from `source` to `sink`, in order, until the source ends.
///
/// Returns the number of chunks delivered. A sink error stops this relay
/// only and is returned as [`PlaypenError::RelayFailure`].
pub async fn relay<S: RelaySink>(mut source: mpsc::Receiver<String>, mut sink: S) -> Result<usize> {
    let mut delivered = 0;
    while let Some(chunk) = source.recv().await {
        sink.send(chunk).map_err(|e| PlaypenError::RelayFailure {
            sink: sink.name().to_string(),
            reason: e.to_string(),
        })?;
        delivered += 1;
    }
    debug!(sink = sink.name(), chunks = delivered, "Relay source ended");
    Ok(delivered)
}

/// Run [`relay`] as a task tied to the session's lifetime.
///
/// Relay failures are logged and end that relay; the session keeps running.
pub fn spawn_relay<S>(session: &SandboxSession, source: mpsc::Receiver<String>, sink: S)
where
    S: RelaySink + 'static,
{
    session.track(tokio::spawn(async move {
        if let Err(e) = relay(source, sink).await {
            warn!(error = %e, "Output relay stopped");
        }
    }));
}
