use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::types::BackendType;

#[derive(Parser, Debug)]
#[clap(name = "playpen")]
#[clap(
    version,
    about = "Boot a sandboxed Node project with a live shell, preview URL and synced editor file"
)]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "PLAYPEN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Boot the sandbox, install, start the dev server and attach a shell
    Up(UpArgs),

    /// Boot the sandbox, mount the project, list the files and exit
    Mount(MountArgs),

    /// List sandbox backends and whether they are usable here
    Backends,

    /// Initialize a new playpen configuration
    Init(InitArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

// ============================================================================
// Session Commands
// ============================================================================

#[derive(Args, Debug, Default)]
pub struct ProjectArgs {
    /// Load project files from a host directory instead of the built-in app
    #[clap(long, short = 'p')]
    pub project: Option<PathBuf>,

    /// Sandbox backend (overrides the config file)
    #[clap(long, short = 'b', value_enum)]
    pub backend: Option<BackendType>,

    /// Environment variables for processes in the sandbox (KEY=VALUE)
    #[clap(long = "env", short = 'e', value_parser = parse_env_var)]
    pub env_vars: Vec<(String, String)>,
}

#[derive(Args, Debug)]
pub struct UpArgs {
    #[clap(flatten)]
    pub project: ProjectArgs,

    /// Host file mirrored into the sandbox on every change
    #[clap(long, default_value = "./playpen-index.js")]
    pub edit_file: PathBuf,

    /// Shell to attach to the terminal (overrides the config file)
    #[clap(long)]
    pub shell: Option<String>,
}

#[derive(Args, Debug)]
pub struct MountArgs {
    #[clap(flatten)]
    pub project: ProjectArgs,

    /// Read every file back and compare it with what was written
    #[clap(long)]
    pub verify: bool,
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Force overwrite existing configuration
    #[clap(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
}

// ============================================================================
// Common Types
// ============================================================================

fn parse_env_var(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| "Environment variable format: KEY=VALUE".to_string())
}

#[derive(Debug, Clone, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
