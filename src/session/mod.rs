use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::config::loader::get_data_dir;
use crate::config::types::SandboxConfig;
use crate::error::{PlaypenError, Result};
use crate::project::ProjectDescriptor;
use crate::sandbox::{
    create_runtime, ManagedProcess, SandboxInfo, SandboxRuntime, ServerReady, SpawnOptions,
};

enum State {
    Idle,
    Booting,
    Ready(Arc<dyn SandboxRuntime>),
    TornDown,
}

/// Background tasks owned by a session. Once closed, nothing new is kept.
#[derive(Default)]
struct TaskSet {
    closed: bool,
    handles: Vec<AbortHandle>,
}

/// Owns one sandbox runtime for its whole life.
///
/// Every component gets the session explicitly and registers its background
/// tasks with [`SandboxSession::track`]; `teardown` aborts all of them before
/// releasing the runtime.
pub struct SandboxSession {
    id: String,
    state: Mutex<State>,
    tasks: Mutex<TaskSet>,
}

impl SandboxSession {
    pub fn new() -> Self {
        Self {
            id: generate_session_id(),
            state: Mutex::new(State::Idle),
            tasks: Mutex::new(TaskSet::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Host directory for this session's project files
    pub fn workspace_dir(&self) -> PathBuf {
        get_data_dir().join("workspaces").join(&self.id)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means another task panicked mid-update; the
        // state value itself is always a whole variant.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, TaskSet> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin_boot(&self) -> Result<()> {
        let mut state = self.lock_state();
        match *state {
            State::Idle => {
                *state = State::Booting;
                Ok(())
            }
            State::Booting | State::Ready(_) => Err(PlaypenError::BootFailure(
                "session has already been booted".to_string(),
            )),
            State::TornDown => Err(PlaypenError::BootFailure(
                "session has been torn down".to_string(),
            )),
        }
    }

    /// Install a booted runtime, unless teardown won the race.
    async fn finish_boot(&self, runtime: Arc<dyn SandboxRuntime>) -> Result<()> {
        let raced = {
            let mut state = self.lock_state();
            if matches!(*state, State::TornDown) {
                true
            } else {
                *state = State::Ready(runtime.clone());
                false
            }
        };

        if raced {
            runtime.teardown().await?;
            return Err(PlaypenError::BootFailure(
                "session was torn down while booting".to_string(),
            ));
        }

        info!(session = %self.id, backend = runtime.name(), "Sandbox session ready");
        Ok(())
    }

    fn abort_boot(&self) {
        let mut state = self.lock_state();
        if matches!(*state, State::Booting) {
            *state = State::Idle;
        }
    }

    /// Boot the runtime selected by `config`. At most once per session.
    pub async fn boot(&self, config: &SandboxConfig) -> Result<()> {
        self.begin_boot()?;
        match create_runtime(config, self.workspace_dir()).await {
            Ok(runtime) => self.finish_boot(runtime).await,
            Err(e) => {
                self.abort_boot();
                Err(match e {
                    PlaypenError::BootFailure(_) => e,
                    other => PlaypenError::BootFailure(other.to_string()),
                })
            }
        }
    }

    /// Adopt an already booted runtime. At most once per session.
    pub async fn boot_with(&self, runtime: Arc<dyn SandboxRuntime>) -> Result<()> {
        self.begin_boot()?;
        self.finish_boot(runtime).await
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.lock_state(), State::Ready(_))
    }

    fn runtime(&self) -> Option<Arc<dyn SandboxRuntime>> {
        match &*self.lock_state() {
            State::Ready(runtime) => Some(runtime.clone()),
            _ => None,
        }
    }

    /// Write every project file into the sandbox.
    pub async fn mount(&self, project: &ProjectDescriptor) -> Result<()> {
        let runtime = self
            .runtime()
            .ok_or_else(|| PlaypenError::MountFailure("sandbox is not booted".to_string()))?;
        runtime.mount(project).await.map_err(|e| match e {
            PlaypenError::MountFailure(_) => e,
            other => PlaypenError::MountFailure(other.to_string()),
        })?;
        info!(files = project.len(), "Mounted project");
        Ok(())
    }

    pub async fn spawn(
        &self,
        command: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<ManagedProcess> {
        let runtime = self
            .runtime()
            .ok_or_else(|| PlaypenError::spawn(command, "sandbox is not booted"))?;
        debug!(command = %command, args = ?args, "Spawning process");
        runtime.spawn(command, args, options).await
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let runtime = self
            .runtime()
            .ok_or_else(|| PlaypenError::write(path, "sandbox is not booted"))?;
        runtime.write_file(path, content).await.map_err(|e| match e {
            PlaypenError::WriteFailure { .. } => e,
            other => PlaypenError::write(path, other),
        })
    }

    pub async fn read_file(&self, path: &str) -> Result<String> {
        let runtime = self.runtime().ok_or_else(|| {
            PlaypenError::Other(anyhow::anyhow!("cannot read '{}': sandbox is not booted", path))
        })?;
        runtime.read_file(path).await
    }

    /// Subscribe to server-ready notifications from the runtime.
    pub fn on_server_ready(&self) -> Result<broadcast::Receiver<ServerReady>> {
        self.runtime()
            .map(|runtime| runtime.server_ready())
            .ok_or_else(|| {
                PlaypenError::Other(anyhow::anyhow!(
                    "cannot watch for servers: sandbox is not booted"
                ))
            })
    }

    pub fn info(&self) -> Option<SandboxInfo> {
        self.runtime().map(|runtime| runtime.info())
    }

    /// Tie a background task to this session; it is aborted on teardown.
    ///
    /// Tasks tracked after teardown are aborted immediately.
    pub fn track<T>(&self, handle: JoinHandle<T>) {
        let abort = handle.abort_handle();
        let mut tasks = self.lock_tasks();
        if tasks.closed {
            abort.abort();
            return;
        }
        tasks.handles.retain(|t| !t.is_finished());
        tasks.handles.push(abort);
    }

    pub fn tracked_tasks(&self) -> usize {
        let tasks = self.lock_tasks();
        tasks.handles.iter().filter(|t| !t.is_finished()).count()
    }

    /// Abort every tracked task and release the runtime.
    ///
    /// Idempotent, and a no-op for the runtime if boot never completed.
    pub async fn teardown(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.lock_state(), State::TornDown);
        let tasks = {
            let mut tasks = self.lock_tasks();
            tasks.closed = true;
            std::mem::take(&mut tasks.handles)
        };

        if !tasks.is_empty() {
            debug!(count = tasks.len(), "Aborting session tasks");
        }
        for task in tasks {
            task.abort();
        }

        match previous {
            State::Ready(runtime) => {
                if let Err(e) = runtime.teardown().await {
                    warn!(session = %self.id, error = %e, "Runtime teardown failed");
                    return Err(e);
                }
                info!(session = %self.id, "Sandbox session torn down");
            }
            State::TornDown => {}
            State::Idle | State::Booting => {
                debug!(session = %self.id, "Teardown before boot completed");
            }
        }
        Ok(())
    }
}

impl Default for SandboxSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a short, unique session ID
fn generate_session_id() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
    let pid = std::process::id() as u64;

    // Timestamp, pid and counter packed together, base36 for compactness
    let combined = ((timestamp & 0xFFFFFF) << 24) | ((pid & 0xFFFF) << 8) | (counter as u64 & 0xFF);
    format_base36(combined)
}

/// Format a number as base36 string
fn format_base36(mut n: u64) -> String {
    const CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if n == 0 {
        return "0".to_string();
    }

    let mut result = Vec::new();
    while n > 0 {
        result.push(CHARS[(n % 36) as usize]);
        n /= 36;
    }
    result.reverse();
    String::from_utf8(result).unwrap_or_else(|_| "error".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRuntime;

    #[test]
    fn test_format_base36() {
        assert_eq!(format_base36(0), "0");
        assert_eq!(format_base36(10), "a");
        assert_eq!(format_base36(35), "z");
        assert_eq!(format_base36(36), "10");
    }

    #[test]
    fn test_session_ids_differ() {
        assert_ne!(SandboxSession::new().id(), SandboxSession::new().id());
    }

    #[tokio::test]
    async fn test_operations_before_boot_fail() {
        let session = SandboxSession::new();
        let project = ProjectDescriptor::builtin();

        assert!(matches!(
            session.mount(&project).await,
            Err(PlaypenError::MountFailure(_))
        ));
        assert!(matches!(
            session.spawn("npm", &[], SpawnOptions::default()).await,
            Err(PlaypenError::SpawnFailure { .. })
        ));
        assert!(matches!(
            session.write_file("index.js", "x").await,
            Err(PlaypenError::WriteFailure { .. })
        ));
        assert!(session.on_server_ready().is_err());
    }

    #[tokio::test]
    async fn test_boot_at_most_once() {
        let session = SandboxSession::new();
        session.boot_with(ScriptedRuntime::new()).await.unwrap();
        assert!(session.is_ready());

        let err = session.boot_with(ScriptedRuntime::new()).await.unwrap_err();
        assert!(matches!(err, PlaypenError::BootFailure(_)));
    }

    #[tokio::test]
    async fn test_mount_round_trip() {
        let session = SandboxSession::new();
        session.boot_with(ScriptedRuntime::new()).await.unwrap();

        let project = ProjectDescriptor::from_files([
            ("index.js", "console.log('hi')"),
            ("package.json", "{}"),
            ("lib/util.js", ""),
        ])
        .unwrap();
        session.mount(&project).await.unwrap();

        for (path, content) in project.iter() {
            assert_eq!(session.read_file(path).await.unwrap(), content);
        }
    }

    #[tokio::test]
    async fn test_mount_failure_is_reported() {
        let runtime = ScriptedRuntime::new();
        runtime.reject_writes();
        let session = SandboxSession::new();
        session.boot_with(runtime).await.unwrap();

        let err = session.mount(&ProjectDescriptor::builtin()).await.unwrap_err();
        assert!(matches!(err, PlaypenError::MountFailure(_)));
    }

    #[tokio::test]
    async fn test_teardown_before_boot_is_noop() {
        let session = SandboxSession::new();
        session.teardown().await.unwrap();
        session.teardown().await.unwrap();
        assert!(session.boot_with(ScriptedRuntime::new()).await.is_err());
    }

    fn pending_task() -> (JoinHandle<()>, tokio::sync::oneshot::Receiver<()>) {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _alive = tx;
            std::future::pending::<()>().await
        });
        (handle, rx)
    }

    #[tokio::test]
    async fn test_teardown_releases_runtime_once_and_aborts_tasks() {
        let runtime = ScriptedRuntime::new();
        let session = SandboxSession::new();
        session.boot_with(runtime.clone()).await.unwrap();

        let (first, first_alive) = pending_task();
        let (second, second_alive) = pending_task();
        session.track(first);
        session.track(second);
        assert_eq!(session.tracked_tasks(), 2);

        session.teardown().await.unwrap();
        session.teardown().await.unwrap();

        assert_eq!(runtime.teardowns(), 1);
        assert!(!session.is_ready());
        assert!(first_alive.await.is_err());
        assert!(second_alive.await.is_err());
        assert_eq!(session.tracked_tasks(), 0);
    }

    #[tokio::test]
    async fn test_track_after_teardown_aborts() {
        let session = SandboxSession::new();
        session.teardown().await.unwrap();

        let (task, alive) = pending_task();
        session.track(task);
        assert!(alive.await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_track_racing_teardown_never_leaks_a_task() {
        for _ in 0..50 {
            let session = Arc::new(SandboxSession::new());
            session.boot_with(ScriptedRuntime::new()).await.unwrap();

            let mut trackers = Vec::new();
            let mut alive = Vec::new();
            for _ in 0..8 {
                let (task, rx) = pending_task();
                alive.push(rx);
                let session = session.clone();
                trackers.push(tokio::spawn(async move { session.track(task) }));
            }
            session.teardown().await.unwrap();
            for tracker in trackers {
                tracker.await.unwrap();
            }

            for rx in alive {
                let ended = tokio::time::timeout(std::time::Duration::from_secs(2), rx).await;
                assert!(matches!(ended, Ok(Err(_))), "tracked task outlived teardown");
            }
        }
    }
}
