use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaypenConfig {
    pub sandbox: SandboxConfig,
    pub terminal: TerminalConfig,
    pub preview: PreviewConfig,
    pub editor: EditorConfig,
}

/// The type of sandbox runtime to boot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Private workspace directory on the host, processes run natively
    Host,
    /// Docker container with the workspace bind-mounted
    Docker,
    /// Docker when the daemon is reachable, host otherwise
    #[default]
    Auto,
}

/// A command line split into program and arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLine {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Which runtime to boot
    pub backend: BackendType,
    /// Working directory inside the sandbox (docker only; host uses its own workspace dir)
    pub workdir: String,
    /// Dependency install command, awaited before the dev server starts
    pub install: CommandLine,
    /// Dev server command, started without waiting for it
    pub start: CommandLine,
    /// Interactive shell bridged to the terminal
    pub shell: CommandLine,
    /// Extra environment variables for every spawned process
    pub env_vars: Vec<(String, String)>,
    /// Docker-specific configuration
    pub docker: DockerConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::default(),
            workdir: "/workspace".to_string(),
            install: CommandLine::new("npm", &["install"]),
            start: CommandLine::new("npm", &["run", "start"]),
            shell: CommandLine::new(&default_shell(), &[]),
            env_vars: Vec::new(),
            docker: DockerConfig::default(),
        }
    }
}

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

/// Docker-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Image to run (default: node:20-slim)
    pub image: String,
    /// Ports published 1:1 so the preview URL resolves on the host
    pub publish_ports: Vec<u16>,
    /// Memory limit in MB
    pub memory_limit_mb: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "node:20-slim".to_string(),
            publish_ports: vec![3111],
            memory_limit_mb: 1024,
        }
    }
}

/// Terminal widget options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Translate bare `\n` into `\r\n` when writing
    pub convert_eol: bool,
    pub theme: ThemeConfig,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            convert_eol: true,
            theme: ThemeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThemeConfig {
    /// Background color as `#rrggbb`
    pub background: String,
    /// Foreground color as `#rrggbb`
    pub foreground: String,
}

impl Default for ThemeConfig {
    fn default() -> Self {
        Self {
            background: "#1e1e1e".to_string(),
            foreground: "#ffffff".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// Target shown until the dev server reports ready
    pub placeholder: String,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            placeholder: "loading.html".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    /// Sandbox path that editor content is written to
    pub path: String,
    /// How often the host editor file is checked for changes
    pub poll_interval_ms: u64,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            path: "index.js".to_string(),
            poll_interval_ms: 250,
        }
    }
}
