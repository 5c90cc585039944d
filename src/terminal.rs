use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use crossterm::style::{Color, ResetColor, SetBackgroundColor, SetForegroundColor};
use crossterm::terminal;
use crossterm::QueueableCommand;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::types::{TerminalConfig, ThemeConfig};
use crate::error::{PlaypenError, Result};
use crate::sandbox::TerminalSize;

/// A terminal widget shared between the shell bridge and the resize coordinator.
pub type SharedTerminal = Arc<Mutex<Box<dyn TerminalWidget>>>;

pub fn shared(widget: impl TerminalWidget + 'static) -> SharedTerminal {
    Arc::new(Mutex::new(Box::new(widget)))
}

/// Lock a shared terminal, mapping poisoning to an error.
pub fn lock(
    terminal: &SharedTerminal,
) -> Result<std::sync::MutexGuard<'_, Box<dyn TerminalWidget>>> {
    terminal
        .lock()
        .map_err(|e| PlaypenError::Other(anyhow::anyhow!("terminal lock poisoned: {}", e)))
}

pub trait TerminalWidget: Send {
    /// Attach to the underlying display.
    fn open(&mut self) -> Result<()>;

    /// Recompute the geometry that fits the container and adopt it.
    fn fit(&mut self) -> Result<TerminalSize>;

    /// Current geometry
    fn size(&self) -> TerminalSize;

    fn write(&mut self, data: &str) -> Result<()>;

    /// Keystroke data, in the order typed. Handed out once.
    fn take_input(&mut self) -> Option<mpsc::Receiver<String>>;

    /// Restore the display. Default implementation does nothing.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Translate bare `\n` into `\r\n`, leaving existing `\r\n` alone.
pub fn convert_eol(data: &str, prev_was_cr: bool) -> String {
    let mut out = String::with_capacity(data.len() + data.len() / 8);
    let mut last_cr = prev_was_cr;
    for ch in data.chars() {
        if ch == '\n' && !last_cr {
            out.push('\r');
        }
        out.push(ch);
        last_cr = ch == '\r';
    }
    out
}

/// Parse `#rrggbb` into a terminal color.
pub fn parse_hex_color(value: &str) -> Option<Color> {
    let hex = value.strip_prefix('#')?;
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some(Color::Rgb {
        r: channel(0)?,
        g: channel(2)?,
        b: channel(4)?,
    })
}

/// Terminal widget over the process's own controlling terminal.
///
/// Opening switches the terminal to raw mode and applies the theme colors;
/// keystrokes are read from stdin on a dedicated thread.
pub struct StdioTerminal {
    convert_eol: bool,
    theme: ThemeConfig,
    size: TerminalSize,
    input: Option<mpsc::Receiver<String>>,
    raw: bool,
    last_was_cr: bool,
}

impl StdioTerminal {
    pub fn new(config: &TerminalConfig) -> Self {
        Self {
            convert_eol: config.convert_eol,
            theme: config.theme.clone(),
            size: TerminalSize::default(),
            input: None,
            raw: false,
            last_was_cr: false,
        }
    }

    fn apply_theme(&self, out: &mut impl Write) -> std::io::Result<()> {
        match parse_hex_color(&self.theme.background) {
            Some(bg) => {
                out.queue(SetBackgroundColor(bg))?;
            }
            None => warn!(color = %self.theme.background, "Ignoring invalid background color"),
        }
        match parse_hex_color(&self.theme.foreground) {
            Some(fg) => {
                out.queue(SetForegroundColor(fg))?;
            }
            None => warn!(color = %self.theme.foreground, "Ignoring invalid foreground color"),
        }
        out.flush()
    }
}

impl TerminalWidget for StdioTerminal {
    fn open(&mut self) -> Result<()> {
        terminal::enable_raw_mode()?;
        self.raw = true;
        self.apply_theme(&mut std::io::stdout())?;

        let (tx, rx) = mpsc::channel(256);
        std::thread::spawn(move || {
            let mut stdin = std::io::stdin();
            let mut buf = [0u8; 1024];
            let mut decoder = crate::sandbox::Utf8Decoder::default();
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let text = decoder.push(&buf[..n]);
                        if !text.is_empty() && tx.blocking_send(text).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Terminal input closed");
        });
        self.input = Some(rx);
        Ok(())
    }

    fn fit(&mut self) -> Result<TerminalSize> {
        let (columns, rows) = terminal::size()?;
        self.size = TerminalSize::new(columns, rows);
        Ok(self.size)
    }

    fn size(&self) -> TerminalSize {
        self.size
    }

    fn write(&mut self, data: &str) -> Result<()> {
        let mut out = std::io::stdout().lock();
        if self.convert_eol {
            let converted = convert_eol(data, self.last_was_cr);
            out.write_all(converted.as_bytes())?;
        } else {
            out.write_all(data.as_bytes())?;
        }
        self.last_was_cr = data.ends_with('\r');
        out.flush()?;
        Ok(())
    }

    fn take_input(&mut self) -> Option<mpsc::Receiver<String>> {
        self.input.take()
    }

    fn close(&mut self) -> Result<()> {
        if !self.raw {
            return Ok(());
        }
        self.raw = false;
        let mut out = std::io::stdout();
        out.queue(ResetColor)?;
        out.flush()?;
        terminal::disable_raw_mode()?;
        Ok(())
    }
}

impl Drop for StdioTerminal {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to restore terminal");
        }
    }
}
