use std::io::{Read, Write};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{PlaypenError, Result};
use crate::sandbox::ready::ReadyDetector;
use crate::sandbox::TerminalSize;

/// Capacity of the per-process output and input channels
const CHANNEL_CAPACITY: usize = 256;

/// Exit code reported when the exit status is unknown (killed by a signal)
const UNKNOWN_EXIT: i32 = -1;

/// Something that can change the geometry of a live pseudo-terminal.
pub trait PtyResize: Send + Sync {
    fn resize(&self, size: TerminalSize) -> Result<()>;
}

/// Resolves to the exit code once the process is gone.
pub struct ExitSignal {
    command: String,
    rx: oneshot::Receiver<i32>,
}

impl ExitSignal {
    pub async fn wait(self) -> Result<i32> {
        self.rx.await.map_err(|_| {
            PlaypenError::Other(anyhow::anyhow!(
                "exit status of '{}' was lost (sandbox torn down?)",
                self.command
            ))
        })
    }
}

/// A process spawned inside the sandbox.
///
/// Output, input and exit are handed out once each so they can be moved
/// into independent tasks.
pub struct ManagedProcess {
    command: String,
    output: Option<mpsc::Receiver<String>>,
    input: Option<mpsc::Sender<String>>,
    exit: Option<ExitSignal>,
    resizer: Option<Arc<dyn PtyResize>>,
}

impl ManagedProcess {
    pub fn new(
        command: &str,
        output: mpsc::Receiver<String>,
        exit: oneshot::Receiver<i32>,
    ) -> Self {
        Self {
            command: command.to_string(),
            output: Some(output),
            input: None,
            exit: Some(ExitSignal {
                command: command.to_string(),
                rx: exit,
            }),
            resizer: None,
        }
    }

    pub fn with_input(mut self, input: mpsc::Sender<String>) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_resizer(mut self, resizer: Arc<dyn PtyResize>) -> Self {
        self.resizer = Some(resizer);
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn take_output(&mut self) -> Option<mpsc::Receiver<String>> {
        self.output.take()
    }

    pub fn take_input(&mut self) -> Option<mpsc::Sender<String>> {
        self.input.take()
    }

    pub fn take_exit(&mut self) -> Option<ExitSignal> {
        self.exit.take()
    }

    /// Shared handle to the pty geometry; `None` for non-interactive processes.
    pub fn resizer(&self) -> Option<Arc<dyn PtyResize>> {
        self.resizer.clone()
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> Result<i32> {
        match self.exit.take() {
            Some(exit) => exit.wait().await,
            None => Err(PlaypenError::Other(anyhow::anyhow!(
                "exit signal of '{}' already taken",
                self.command
            ))),
        }
    }

    pub fn resize(&self, size: TerminalSize) -> Result<()> {
        match &self.resizer {
            Some(resizer) => resizer.resize(size),
            None => Err(PlaypenError::Other(anyhow::anyhow!(
                "'{}' has no pseudo-terminal",
                self.command
            ))),
        }
    }
}

/// Processes started by a runtime, killed together on teardown.
#[derive(Default)]
pub struct ProcessTable {
    entries: Mutex<Vec<ProcessGuard>>,
}

enum ProcessGuard {
    Piped {
        waiter: JoinHandle<()>,
        group: Option<u32>,
    },
    Pty {
        killer: Box<dyn ChildKiller + Send + Sync>,
        group: Option<u32>,
    },
}

impl ProcessTable {
    fn push(&self, guard: ProcessGuard) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(guard);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kill every tracked process together with everything it started.
    /// Safe to call more than once.
    pub fn kill_all(&self) {
        let entries = match self.entries.lock() {
            Ok(mut entries) => std::mem::take(&mut *entries),
            Err(_) => return,
        };
        debug!(count = entries.len(), "Killing sandbox processes");
        for entry in entries {
            match entry {
                ProcessGuard::Piped { waiter, group } => {
                    if let Some(group) = group {
                        kill_group(group);
                    }
                    // Dropping the child also kills the leader (kill_on_drop)
                    waiter.abort();
                }
                ProcessGuard::Pty { mut killer, group } => {
                    if let Some(group) = group {
                        kill_group(group);
                    }
                    if let Err(e) = killer.kill() {
                        debug!(error = %e, "Pty child already gone");
                    }
                }
            }
        }
    }
}

/// SIGKILL a whole process group. The group id is the leader's pid.
#[cfg(unix)]
fn kill_group(group: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(group as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(group = group, error = %e, "Failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_group: u32) {}

/// Spawn `cmd` with piped stdio.
///
/// stdout and stderr are forwarded line by line (newlines kept) into the
/// output channel and scanned for server-ready messages.
pub fn spawn_piped(
    label: &str,
    mut cmd: Command,
    detector: ReadyDetector,
    table: &ProcessTable,
) -> Result<ManagedProcess> {
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    // Own process group, so teardown reaches grandchildren (npm -> sh -> node)
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| PlaypenError::spawn(label, e))?;
    let group = child.id();
    debug!(command = %label, pid = ?group, "Spawned piped process");

    let (output_tx, output_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (input_tx, mut input_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    let (exit_tx, exit_rx) = oneshot::channel();

    let readers = [
        child
            .stdout
            .take()
            .map(|s| spawn_line_reader(s, output_tx.clone(), detector.clone())),
        child
            .stderr
            .take()
            .map(|s| spawn_line_reader(s, output_tx.clone(), detector.clone())),
    ];
    drop(output_tx);

    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            while let Some(data) = input_rx.recv().await {
                if stdin.write_all(data.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });
    }

    let command = label.to_string();
    let waiter = tokio::spawn(async move {
        let code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(UNKNOWN_EXIT),
            Err(e) => {
                warn!(command = %command, error = %e, "Failed to wait for process");
                UNKNOWN_EXIT
            }
        };
        // Drain output before reporting exit so exit-then-read sees everything
        for reader in readers.into_iter().flatten() {
            let _ = reader.await;
        }
        debug!(command = %command, exit_code = code, "Process exited");
        let _ = exit_tx.send(code);
    });
    table.push(ProcessGuard::Piped { waiter, group });

    Ok(ManagedProcess::new(label, output_rx, exit_rx).with_input(input_tx))
}

fn spawn_line_reader<R>(
    stream: R,
    tx: mpsc::Sender<String>,
    detector: ReadyDetector,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).to_string();
                    detector.scan(&line).await;
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

struct MasterResizer {
    master: Mutex<Box<dyn MasterPty + Send>>,
}

impl PtyResize for MasterResizer {
    fn resize(&self, size: TerminalSize) -> Result<()> {
        let master = self
            .master
            .lock()
            .map_err(|e| PlaypenError::Other(anyhow::anyhow!("pty lock poisoned: {}", e)))?;
        master.resize(pty_size(size)).map_err(PlaypenError::Other)
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.columns,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Spawn `cmd` under a fresh pseudo-terminal of the given size.
///
/// Output is decoded as UTF-8 without splitting multi-byte sequences and
/// forwarded as it arrives. Interactive output is never scanned for
/// server-ready messages: anything typed at the prompt would count.
pub fn spawn_pty(
    label: &str,
    cmd: CommandBuilder,
    size: TerminalSize,
    table: &ProcessTable,
) -> Result<ManagedProcess> {
    let pair = native_pty_system()
        .openpty(pty_size(size))
        .map_err(|e| PlaypenError::spawn(label, format!("failed to open pty: {}", e)))?;

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| PlaypenError::spawn(label, e))?;
    drop(pair.slave);
    debug!(command = %label, pid = ?child.process_id(), columns = size.columns, rows = size.rows, "Spawned pty process");

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| PlaypenError::spawn(label, format!("failed to get pty reader: {}", e)))?;
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|e| PlaypenError::spawn(label, format!("failed to get pty writer: {}", e)))?;

    let (output_tx, output_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (input_tx, mut input_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    let (exit_tx, exit_rx) = oneshot::channel();

    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        let mut decoder = Utf8Decoder::default();
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let text = decoder.push(&buf[..n]);
                    if text.is_empty() {
                        continue;
                    }
                    if output_tx.blocking_send(text).is_err() {
                        break;
                    }
                }
            }
        }
    });

    std::thread::spawn(move || {
        while let Some(data) = input_rx.blocking_recv() {
            if writer.write_all(data.as_bytes()).is_err() || writer.flush().is_err() {
                break;
            }
        }
    });

    table.push(ProcessGuard::Pty {
        killer: child.clone_killer(),
        // The pty child is a session leader, so its pid is also its group
        group: child.process_id(),
    });

    let command = label.to_string();
    std::thread::spawn(move || {
        let code = match child.wait() {
            Ok(status) => status.exit_code() as i32,
            Err(e) => {
                warn!(command = %command, error = %e, "Failed to wait for pty process");
                UNKNOWN_EXIT
            }
        };
        debug!(command = %command, exit_code = code, "Pty process exited");
        let _ = exit_tx.send(code);
    });

    let resizer = Arc::new(MasterResizer {
        master: Mutex::new(pair.master),
    });

    Ok(ManagedProcess::new(label, output_rx, exit_rx)
        .with_input(input_tx)
        .with_resizer(resizer))
}

/// Decodes a byte stream into UTF-8 text without splitting code points.
#[derive(Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(e) => match e.error_len() {
                // Incomplete sequence at the end: keep it for the next chunk
                None => e.valid_up_to(),
                // Invalid bytes: let the lossy conversion replace them
                Some(_) => self.pending.len(),
            },
        };
        let rest = self.pending.split_off(valid);
        let text = String::from_utf8_lossy(&self.pending).to_string();
        self.pending = rest;
        text
    }
}
