use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::session::SandboxSession;

/// The preview surface's navigation target. Only the latest URL is kept.
pub struct PreviewFrame {
    target: watch::Sender<String>,
}

impl PreviewFrame {
    pub fn new(placeholder: &str) -> Self {
        let (target, _) = watch::channel(placeholder.to_string());
        Self { target }
    }

    pub fn target(&self) -> String {
        self.target.borrow().clone()
    }

    pub fn navigate(&self, url: &str) {
        self.target.send_replace(url.to_string());
    }

    /// Follow target changes
    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.target.subscribe()
    }
}

pub struct PreviewBridge;

impl PreviewBridge {
    /// Subscribe to server-ready events and navigate `frame` on each one.
    ///
    /// Must be armed before the dev server starts; earlier events are not replayed.
    pub fn arm(session: &SandboxSession, frame: Arc<PreviewFrame>) -> Result<()> {
        let mut events = session.on_server_ready()?;
        session.track(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ready) => {
                        info!(port = ready.port, url = %ready.url, "Preview ready");
                        frame.navigate(&ready.url);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Missed server-ready events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Preview bridge stopped");
        }));
        Ok(())
    }
}
