use std::time::Duration;

use tracing::info;

use crate::cli::args::{
    ConfigAction, ConfigArgs, InitArgs, MountArgs, OutputFormat, ProjectArgs, UpArgs,
};
use crate::config::loader::get_config_path;
use crate::config::types::{CommandLine, PlaypenConfig};
use crate::editor::EditorFile;
use crate::error::{PlaypenError, Result};
use crate::orchestrator::{HostSurface, Orchestrator};
use crate::project::ProjectDescriptor;
use crate::resize::viewport_resizes;
use crate::sandbox::available_backends;
use crate::session::SandboxSession;
use crate::terminal::{self, StdioTerminal};

// ============================================================================
// Session Commands
// ============================================================================

/// Run a full interactive session until the shell exits or ctrl-c.
pub async fn up(args: UpArgs, mut config: PlaypenConfig, format: OutputFormat) -> Result<()> {
    let project = load_project(&args.project)?;
    apply_overrides(&mut config, &args.project);
    if let Some(shell) = &args.shell {
        config.sandbox.shell = CommandLine::new(shell, &[]);
    }
    info!(backend = ?config.sandbox.backend, files = project.len(), "Starting session");

    let initial = project.get(&config.editor.path).unwrap_or_default().to_string();
    let poll = Duration::from_millis(config.editor.poll_interval_ms);
    let terminal = terminal::shared(StdioTerminal::new(&config.terminal));
    let mut orchestrator = Orchestrator::new(config, project);
    let session = orchestrator.session().clone();

    let editor = EditorFile::seed(&args.edit_file, &initial).await?;
    let surface = HostSurface {
        terminal: terminal.clone(),
        resizes: viewport_resizes(&session)?,
        edits: editor.watch(&session, poll),
    };

    let mut target = orchestrator.preview().subscribe();
    session.track(tokio::spawn(async move {
        while target.changed().await.is_ok() {
            let url = target.borrow_and_update().clone();
            announce_preview(&url, &format);
        }
    }));

    let outcome = match orchestrator.start(surface).await {
        Ok(mut shell) => {
            tokio::select! {
                code = shell.wait() => code.map(|code| info!(code = code, "Shell exited")),
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    Ok(())
                }
            }
        }
        Err(e) => Err(PlaypenError::Other(e.into())),
    };

    let closed = terminal::lock(&terminal).and_then(|mut widget| widget.close());
    orchestrator.teardown().await?;
    closed?;
    outcome
}

/// Boot, mount, report the mounted files and tear down again.
pub async fn mount(args: MountArgs, mut config: PlaypenConfig, format: OutputFormat) -> Result<()> {
    let project = load_project(&args.project)?;
    apply_overrides(&mut config, &args.project);

    let session = SandboxSession::new();
    session.boot(&config.sandbox).await?;
    let backend = session
        .info()
        .map(|info| info.backend_type)
        .unwrap_or_default();

    let outcome = mount_project(&session, &project, args.verify).await;
    session.teardown().await?;
    outcome?;

    match format {
        OutputFormat::Text => {
            println!("Mounted {} files ({} backend):", project.len(), backend);
            for (path, content) in project.iter() {
                println!("  {:<20} {:>6} bytes", path, content.len());
            }
            if args.verify {
                println!("All files read back intact");
            }
        }
        OutputFormat::Json => {
            let files: Vec<_> = project
                .iter()
                .map(|(path, content)| {
                    serde_json::json!({
                        "path": path,
                        "bytes": content.len(),
                    })
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "backend": backend,
                    "verified": args.verify,
                    "files": files,
                }))?
            );
        }
    }
    Ok(())
}

pub async fn backends(format: OutputFormat) -> Result<()> {
    let backends = available_backends().await;
    match format {
        OutputFormat::Text => {
            for backend in &backends {
                let status = if backend.available {
                    "available".to_string()
                } else {
                    format!(
                        "unavailable ({})",
                        backend.unavailable_reason.unwrap_or("unknown")
                    )
                };
                println!("{:<8} {:<28} {}", backend.name, status, backend.description);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&backends)?);
        }
    }
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn init(args: InitArgs) -> Result<()> {
    let config_path = get_config_path();

    if config_path.exists() && !args.force {
        println!("Configuration already exists at: {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let toml_str = toml::to_string_pretty(&PlaypenConfig::default())
        .map_err(|e| PlaypenError::Config(e.to_string()))?;
    std::fs::write(&config_path, toml_str)?;

    println!("Created configuration at: {}", config_path.display());
    println!("\nQuick start:");
    println!("  # Check which sandbox backends work here");
    println!("  playpen backends");
    println!();
    println!("  # Start the built-in app and attach a shell");
    println!("  playpen up");
    println!();
    println!("  # Or bring your own project directory");
    println!("  playpen up --project ./my-app --edit-file ./my-app/index.js");

    Ok(())
}

pub async fn config(args: ConfigArgs, config: PlaypenConfig) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(&config)
                .map_err(|e| PlaypenError::Config(e.to_string()))?;
            println!("{}", toml_str);
        }
        ConfigAction::Path => {
            println!("{}", get_config_path().display());
        }
    }
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn load_project(args: &ProjectArgs) -> Result<ProjectDescriptor> {
    match &args.project {
        Some(dir) => ProjectDescriptor::from_dir(dir),
        None => Ok(ProjectDescriptor::builtin()),
    }
}

fn apply_overrides(config: &mut PlaypenConfig, args: &ProjectArgs) {
    if let Some(backend) = &args.backend {
        config.sandbox.backend = backend.clone();
    }
    config.sandbox.env_vars.extend(args.env_vars.iter().cloned());
}

async fn mount_project(
    session: &SandboxSession,
    project: &ProjectDescriptor,
    verify: bool,
) -> Result<()> {
    session.mount(project).await?;
    if !verify {
        return Ok(());
    }
    for (path, content) in project.iter() {
        let read_back = session.read_file(path).await?;
        if read_back != content {
            return Err(PlaypenError::MountFailure(format!(
                "'{}' reads back differently from what was written",
                path
            )));
        }
    }
    Ok(())
}

/// The terminal is in raw mode, so lines end in `\r\n`.
fn announce_preview(url: &str, format: &OutputFormat) {
    match format {
        OutputFormat::Text => eprint!("\r\nPreview: {}\r\n", url),
        OutputFormat::Json => eprint!(
            "{}\r\n",
            serde_json::json!({ "event": "preview", "url": url })
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::types::BackendType;
    use crate::testing::ScriptedRuntime;

    #[test]
    fn test_apply_overrides() {
        let mut config = PlaypenConfig::default();
        config.sandbox.env_vars = vec![("A".to_string(), "1".to_string())];
        let args = ProjectArgs {
            project: None,
            backend: Some(BackendType::Host),
            env_vars: vec![("B".to_string(), "2".to_string())],
        };

        apply_overrides(&mut config, &args);
        assert_eq!(config.sandbox.backend, BackendType::Host);
        assert_eq!(config.sandbox.env_vars.len(), 2);
    }

    #[test]
    fn test_load_project_defaults_to_builtin() {
        let project = load_project(&ProjectArgs::default()).unwrap();
        assert!(project.get("index.js").is_some());
        assert!(project.get("package.json").is_some());
    }

    #[test]
    fn test_load_project_from_missing_dir_fails() {
        let args = ProjectArgs {
            project: Some(PathBuf::from("/nonexistent/playpen/project")),
            ..Default::default()
        };
        assert!(load_project(&args).is_err());
    }

    #[tokio::test]
    async fn test_mount_project_verifies_read_back() {
        let session = SandboxSession::new();
        session.boot_with(ScriptedRuntime::new()).await.unwrap();
        mount_project(&session, &ProjectDescriptor::builtin(), true)
            .await
            .unwrap();
    }
}
