//! Scripted stand-ins for the sandbox runtime and the terminal widget.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::{PlaypenError, Result};
use crate::project::relative_path;
use crate::sandbox::{
    ManagedProcess, PtyResize, SandboxInfo, SandboxRuntime, ServerReady, SpawnOptions,
    TerminalSize,
};
use crate::terminal::TerminalWidget;

/// Poll `cond` until it holds, panicking after `timeout`.
pub async fn wait_until(what: &str, timeout: Duration, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// What a non-interactive process does once spawned.
#[derive(Clone, Default)]
pub struct Script {
    pub output: Vec<String>,
    pub exit_code: i32,
    pub delay: Duration,
    /// Announce a listening server after the output
    pub ready: Option<(u16, String)>,
    /// Never exit (until teardown)
    pub keep_running: bool,
}

impl Script {
    pub fn exits(code: i32, delay: Duration) -> Self {
        Self {
            exit_code: code,
            delay,
            ..Default::default()
        }
    }

    pub fn output(mut self, chunks: &[&str]) -> Self {
        self.output = chunks.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn serves(mut self, port: u16, url: &str) -> Self {
        self.ready = Some((port, url.to_string()));
        self.keep_running = true;
        self
    }
}

struct ScriptedResizer {
    resizes: Arc<Mutex<Vec<TerminalSize>>>,
    reject: Arc<AtomicBool>,
}

impl PtyResize for ScriptedResizer {
    fn resize(&self, size: TerminalSize) -> Result<()> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(PlaypenError::Other(anyhow::anyhow!("resize rejected")));
        }
        self.resizes.lock().unwrap().push(size);
        Ok(())
    }
}

/// In-memory runtime whose processes follow [`Script`]s and record
/// everything that happens to them.
pub struct ScriptedRuntime {
    files: Mutex<HashMap<String, String>>,
    writes: Mutex<Vec<(String, String)>>,
    rejected_writes: AtomicUsize,
    reject_writes: AtomicBool,
    scripts: Mutex<HashMap<String, Script>>,
    missing: Mutex<HashSet<String>>,
    events: Arc<Mutex<Vec<String>>>,
    spawn_sizes: Mutex<Vec<(String, Option<TerminalSize>)>>,
    ready_tx: broadcast::Sender<ServerReady>,
    stdin: Arc<Mutex<Vec<String>>>,
    shell_outputs: Mutex<Vec<mpsc::Sender<String>>>,
    resizes: Arc<Mutex<Vec<TerminalSize>>>,
    reject_resizes: Arc<AtomicBool>,
    live: Arc<Mutex<Vec<oneshot::Sender<i32>>>>,
    teardowns: AtomicUsize,
}

impl ScriptedRuntime {
    pub fn new() -> Arc<Self> {
        let (ready_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            files: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            rejected_writes: AtomicUsize::new(0),
            reject_writes: AtomicBool::new(false),
            scripts: Mutex::new(HashMap::new()),
            missing: Mutex::new(HashSet::new()),
            events: Arc::new(Mutex::new(Vec::new())),
            spawn_sizes: Mutex::new(Vec::new()),
            ready_tx,
            stdin: Arc::new(Mutex::new(Vec::new())),
            shell_outputs: Mutex::new(Vec::new()),
            resizes: Arc::new(Mutex::new(Vec::new())),
            reject_resizes: Arc::new(AtomicBool::new(false)),
            live: Arc::new(Mutex::new(Vec::new())),
            teardowns: AtomicUsize::new(0),
        })
    }

    /// Script the process spawned as `label` ("npm install", "npm run start", ...).
    pub fn script(&self, label: &str, script: Script) {
        self.scripts.lock().unwrap().insert(label.to_string(), script);
    }

    pub fn missing_command(&self, command: &str) {
        self.missing.lock().unwrap().insert(command.to_string());
    }

    pub fn reject_writes(&self) {
        self.reject_writes.store(true, Ordering::SeqCst);
    }

    pub fn accept_writes(&self) {
        self.reject_writes.store(false, Ordering::SeqCst);
    }

    pub fn reject_resizes(&self) {
        self.reject_resizes.store(true, Ordering::SeqCst);
    }

    pub fn accept_resizes(&self) {
        self.reject_resizes.store(false, Ordering::SeqCst);
    }

    pub fn emit_ready(&self, port: u16, url: &str) {
        let _ = self.ready_tx.send(ServerReady {
            port,
            url: url.to_string(),
        });
    }

    /// Push a chunk out of every interactive process.
    pub async fn emit_shell_output(&self, chunk: &str) {
        let senders = self.shell_outputs.lock().unwrap().clone();
        for tx in senders {
            let _ = tx.send(chunk.to_string()).await;
        }
    }

    /// "spawn:<label>" and "exit:<label>" in the order they happened
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn spawn_sizes(&self) -> Vec<(String, Option<TerminalSize>)> {
        self.spawn_sizes.lock().unwrap().clone()
    }

    pub fn stdin(&self) -> Vec<String> {
        self.stdin.lock().unwrap().clone()
    }

    pub fn resizes(&self) -> Vec<TerminalSize> {
        self.resizes.lock().unwrap().clone()
    }

    pub fn writes_to(&self, path: &str) -> Vec<String> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == relative_path(path))
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    pub async fn wait_for_stdin(&self, count: usize, timeout: Duration) {
        wait_until("shell input", timeout, || self.stdin.lock().unwrap().len() >= count).await
    }

    pub async fn wait_for_resizes(&self, count: usize, timeout: Duration) {
        wait_until("resizes", timeout, || self.resizes.lock().unwrap().len() >= count).await
    }

    pub async fn wait_for_writes(&self, path: &str, count: usize, timeout: Duration) {
        wait_until("file writes", timeout, || self.writes_to(path).len() >= count).await
    }

    pub async fn wait_for_rejections(&self, count: usize, timeout: Duration) {
        wait_until("rejected writes", timeout, || {
            self.rejected_writes.load(Ordering::SeqCst) >= count
        })
        .await
    }

    fn spawn_interactive(&self, label: &str) -> ManagedProcess {
        let (output_tx, output_rx) = mpsc::channel(64);
        let (input_tx, mut input_rx) = mpsc::channel::<String>(64);
        let (exit_tx, exit_rx) = oneshot::channel();

        self.shell_outputs.lock().unwrap().push(output_tx);
        self.live.lock().unwrap().push(exit_tx);

        let stdin = self.stdin.clone();
        tokio::spawn(async move {
            while let Some(data) = input_rx.recv().await {
                stdin.lock().unwrap().push(data);
            }
        });

        let resizer = Arc::new(ScriptedResizer {
            resizes: self.resizes.clone(),
            reject: self.reject_resizes.clone(),
        });
        ManagedProcess::new(label, output_rx, exit_rx)
            .with_input(input_tx)
            .with_resizer(resizer)
    }

    fn spawn_scripted(&self, label: &str) -> ManagedProcess {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(label)
            .cloned()
            .unwrap_or_default();
        let (output_tx, output_rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = oneshot::channel();

        let events = self.events.clone();
        let live = self.live.clone();
        let ready_tx = self.ready_tx.clone();
        let label = label.to_string();
        let process = ManagedProcess::new(&label, output_rx, exit_rx);

        tokio::spawn(async move {
            for chunk in script.output {
                let _ = output_tx.send(chunk).await;
            }
            if let Some((port, url)) = script.ready {
                let _ = ready_tx.send(ServerReady { port, url });
            }
            if script.keep_running {
                live.lock().unwrap().push(exit_tx);
                return;
            }
            tokio::time::sleep(script.delay).await;
            events.lock().unwrap().push(format!("exit:{label}"));
            let _ = exit_tx.send(script.exit_code);
        });

        process
    }
}

#[async_trait]
impl SandboxRuntime for ScriptedRuntime {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        if self.reject_writes.load(Ordering::SeqCst) {
            self.rejected_writes.fetch_add(1, Ordering::SeqCst);
            return Err(PlaypenError::write(path, "rejected by script"));
        }
        let path = relative_path(path).to_string();
        self.writes
            .lock()
            .unwrap()
            .push((path.clone(), content.to_string()));
        self.files.lock().unwrap().insert(path, content.to_string());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        self.files
            .lock()
            .unwrap()
            .get(relative_path(path))
            .cloned()
            .ok_or_else(|| PlaypenError::Other(anyhow::anyhow!("no such file: {path}")))
    }

    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<ManagedProcess> {
        if self.missing.lock().unwrap().contains(command) {
            return Err(PlaypenError::spawn(command, "command not found"));
        }

        let label = std::iter::once(command)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        self.events.lock().unwrap().push(format!("spawn:{label}"));
        self.spawn_sizes
            .lock()
            .unwrap()
            .push((label.clone(), options.terminal));

        Ok(match options.terminal {
            Some(_) => self.spawn_interactive(&label),
            None => self.spawn_scripted(&label),
        })
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }

    fn info(&self) -> SandboxInfo {
        SandboxInfo {
            backend_type: "scripted".to_string(),
            instance_id: None,
            running: self.teardowns() == 0,
            metadata: HashMap::new(),
        }
    }

    async fn teardown(&self) -> Result<()> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        self.live.lock().unwrap().clear();
        self.shell_outputs.lock().unwrap().clear();
        Ok(())
    }
}

/// Terminal widget driven from a [`TerminalRemote`].
pub struct ScriptedTerminal {
    size: TerminalSize,
    fit_size: Arc<Mutex<TerminalSize>>,
    written: Arc<Mutex<Vec<String>>>,
    input: Option<mpsc::Receiver<String>>,
    opened: Arc<AtomicBool>,
}

/// Test-side handle to a [`ScriptedTerminal`].
pub struct TerminalRemote {
    fit_size: Arc<Mutex<TerminalSize>>,
    written: Arc<Mutex<Vec<String>>>,
    input: mpsc::Sender<String>,
    opened: Arc<AtomicBool>,
}

impl ScriptedTerminal {
    pub fn new(size: TerminalSize) -> (Self, TerminalRemote) {
        let fit_size = Arc::new(Mutex::new(size));
        let written = Arc::new(Mutex::new(Vec::new()));
        let opened = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(64);

        let terminal = Self {
            size,
            fit_size: fit_size.clone(),
            written: written.clone(),
            input: Some(rx),
            opened: opened.clone(),
        };
        let remote = TerminalRemote {
            fit_size,
            written,
            input: tx,
            opened,
        };
        (terminal, remote)
    }
}

impl TerminalWidget for ScriptedTerminal {
    fn open(&mut self) -> Result<()> {
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn fit(&mut self) -> Result<TerminalSize> {
        self.size = *self.fit_size.lock().unwrap();
        Ok(self.size)
    }

    fn size(&self) -> TerminalSize {
        self.size
    }

    fn write(&mut self, data: &str) -> Result<()> {
        self.written.lock().unwrap().push(data.to_string());
        Ok(())
    }

    fn take_input(&mut self) -> Option<mpsc::Receiver<String>> {
        self.input.take()
    }
}

impl TerminalRemote {
    pub async fn type_keys(&self, data: &str) {
        self.input.send(data.to_string()).await.unwrap();
    }

    /// Size the next `fit()` will report
    pub fn fit_to(&self, size: TerminalSize) {
        *self.fit_size.lock().unwrap() = size;
    }

    pub fn written(&self) -> Vec<String> {
        self.written.lock().unwrap().clone()
    }

    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    pub async fn wait_for_writes(&self, count: usize, timeout: Duration) {
        wait_until("terminal writes", timeout, || {
            self.written.lock().unwrap().len() >= count
        })
        .await
    }
}
