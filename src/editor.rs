use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::session::SandboxSession;

/// Writes the full editor content to a fixed sandbox path on every edit.
///
/// There is no read-back; the sandbox copy is never the editor's source of truth.
pub struct EditorSync {
    session: Arc<SandboxSession>,
    path: String,
}

impl EditorSync {
    pub fn new(session: Arc<SandboxSession>, path: &str) -> Self {
        Self {
            session,
            path: path.to_string(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Handle one input event.
    pub async fn on_input(&self, content: &str) -> Result<()> {
        self.session.write_file(&self.path, content).await?;
        debug!(path = %self.path, bytes = content.len(), "Synced editor content");
        Ok(())
    }

    /// Apply every edit from `edits`, in order, until the stream ends or the
    /// session is torn down. A rejected write is logged and the next edit
    /// still goes through.
    pub fn arm(self, mut edits: mpsc::Receiver<String>) {
        let session = self.session.clone();
        session.track(tokio::spawn(async move {
            while let Some(content) = edits.recv().await {
                if let Err(e) = self.on_input(&content).await {
                    warn!(path = %self.path, error = %e, "Editor sync write failed");
                }
            }
            debug!(path = %self.path, "Editor sync stopped");
        }));
    }
}

/// The host-side editor: a plain file the user edits with any tool.
pub struct EditorFile {
    path: PathBuf,
    seeded: String,
}

impl EditorFile {
    /// Seed `path` with the initial content, once.
    pub async fn seed(path: &Path, content: &str) -> Result<Self> {
        tokio::fs::write(path, content).await?;
        info!(path = %path.display(), "Editor file ready; edits are synced into the sandbox");
        Ok(Self {
            path: path.to_path_buf(),
            seeded: content.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Poll the file and emit its full content each time it changes.
    pub fn watch(&self, session: &SandboxSession, interval: Duration) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(64);
        let path = self.path.clone();
        let seeded = self.seeded.clone();
        session.track(tokio::spawn(async move {
            let mut last = seeded;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let current = match tokio::fs::read_to_string(&path).await {
                    Ok(current) => current,
                    // Editors often replace the file; try again next tick
                    Err(_) => continue,
                };
                if last == current {
                    continue;
                }
                last = current.clone();
                if tx.send(current).await.is_err() {
                    break;
                }
            }
        }));
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRuntime;

    async fn booted() -> (Arc<ScriptedRuntime>, Arc<SandboxSession>) {
        let runtime = ScriptedRuntime::new();
        let session = Arc::new(SandboxSession::new());
        session.boot_with(runtime.clone()).await.unwrap();
        (runtime, session)
    }

    #[tokio::test]
    async fn test_edits_written_in_order() {
        let (runtime, session) = booted().await;
        let (tx, rx) = mpsc::channel(8);
        EditorSync::new(session.clone(), "index.js").arm(rx);

        for content in ["a", "ab", "abc"] {
            tx.send(content.to_string()).await.unwrap();
        }
        runtime
            .wait_for_writes("index.js", 3, Duration::from_secs(2))
            .await;

        assert_eq!(runtime.writes_to("index.js"), vec!["a", "ab", "abc"]);
        assert_eq!(session.read_file("index.js").await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_failed_write_does_not_stop_sync() {
        let (runtime, session) = booted().await;
        let (tx, rx) = mpsc::channel(8);
        EditorSync::new(session.clone(), "index.js").arm(rx);

        runtime.reject_writes();
        tx.send("lost".to_string()).await.unwrap();
        runtime
            .wait_for_rejections(1, Duration::from_secs(2))
            .await;
        runtime.accept_writes();
        tx.send("kept".to_string()).await.unwrap();
        runtime
            .wait_for_writes("index.js", 1, Duration::from_secs(2))
            .await;

        assert_eq!(session.read_file("index.js").await.unwrap(), "kept");
    }

    #[tokio::test]
    async fn test_on_input_reports_write_failure() {
        let (runtime, session) = booted().await;
        runtime.reject_writes();
        let sync = EditorSync::new(session, "index.js");
        assert!(matches!(
            sync.on_input("x").await,
            Err(crate::error::PlaypenError::WriteFailure { .. })
        ));
    }

    #[tokio::test]
    async fn test_editor_file_watch_emits_changes() {
        let dir = tempfile::tempdir().unwrap();
        let (_runtime, session) = booted().await;
        let file = EditorFile::seed(&dir.path().join("index.js"), "seed")
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), "seed");

        let mut edits = file.watch(&session, Duration::from_millis(10));
        std::fs::write(file.path(), "changed").unwrap();

        let edit = tokio::time::timeout(Duration::from_secs(2), edits.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(edit, "changed");
    }
}
