use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::sandbox::ServerReady;

/// Dev server log lines that announce a listening port
const PORT_PATTERNS: &[&str] = &[
    r"Local:\s+https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0):(\d+)", // Vite: "Local:   http://localhost:5174/"
    r"Server ready at https?://[\w.\-]+:(\d+)",                       // Next.js dev
    r"(?i)listening on (?:port )?(\d+)",                              // "Listening on port 3000"
    r"(?i)server running on port (\d+)",                              // Express: "server running on port 8476"
    r"https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0):(\d+)",          // Generic URL
];

const EVENT_CAPACITY: usize = 16;

/// Connection attempts before an announced port is written off
const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_RETRY: Duration = Duration::from_millis(100);

fn port_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        PORT_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

fn ansi_escape() -> Option<&'static Regex> {
    static ANSI: OnceLock<Option<Regex>> = OnceLock::new();
    ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").ok())
        .as_ref()
}

/// Extract a listening port from one line of process output.
pub fn extract_port(line: &str) -> Option<u16> {
    let line = match ansi_escape() {
        Some(ansi) => ansi.replace_all(line, ""),
        None => line.into(),
    };
    port_patterns().iter().find_map(|regex| {
        regex
            .captures(&line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u16>().ok())
            .filter(|port| *port != 0)
    })
}

/// Watches process output and broadcasts a [`ServerReady`] whenever a
/// newly announced port is actually accepting connections.
#[derive(Clone)]
pub struct ReadyDetector {
    host: Arc<str>,
    tx: broadcast::Sender<ServerReady>,
    last_port: Arc<Mutex<Option<u16>>>,
}

impl ReadyDetector {
    /// `host` is the name the preview URL is built with and the one connected to.
    pub fn new(host: &str) -> (Self, broadcast::Receiver<ServerReady>) {
        let (tx, rx) = broadcast::channel(EVENT_CAPACITY);
        let detector = Self {
            host: Arc::from(host),
            tx,
            last_port: Arc::new(Mutex::new(None)),
        };
        (detector, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerReady> {
        self.tx.subscribe()
    }

    fn is_current(&self, port: u16) -> bool {
        self.last_port
            .lock()
            .map(|last| *last == Some(port))
            .unwrap_or(true)
    }

    /// Look for a port announcement in `line` and, if something listens on
    /// it, broadcast it.
    pub async fn scan(&self, line: &str) {
        let Some(port) = extract_port(line) else {
            return;
        };
        if self.is_current(port) {
            return;
        }
        if !self.is_listening(port).await {
            debug!(port = port, "Announced port is not accepting connections");
            return;
        }

        {
            let Ok(mut last) = self.last_port.lock() else {
                return;
            };
            // stdout and stderr may have confirmed the same port concurrently
            if *last == Some(port) {
                return;
            }
            *last = Some(port);
        }

        let ready = ServerReady {
            port,
            url: format!("http://{}:{}", self.host, port),
        };
        info!(port = port, url = %ready.url, "Server ready");
        // No subscribers is fine: nobody is waiting for a preview
        let _ = self.tx.send(ready);
    }

    async fn is_listening(&self, port: u16) -> bool {
        for attempt in 0..CONNECT_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(CONNECT_RETRY).await;
            }
            if TcpStream::connect((&*self.host, port)).await.is_ok() {
                return true;
            }
        }
        false
    }
}
