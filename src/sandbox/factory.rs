use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::config::types::{BackendType, SandboxConfig};
use crate::error::{PlaypenError, Result};
use crate::sandbox::backends::{DockerRuntime, HostRuntime};
use crate::sandbox::traits::SandboxRuntime;

/// Boot a sandbox runtime based on the configuration.
///
/// `root` is the host directory that will hold the project files.
pub async fn create_runtime(
    config: &SandboxConfig,
    root: PathBuf,
) -> Result<Arc<dyn SandboxRuntime>> {
    let backend_type = resolve_backend_type(&config.backend).await?;
    info!(backend = ?backend_type, root = %root.display(), "Booting sandbox runtime");

    match backend_type {
        BackendType::Host => {
            let runtime = HostRuntime::new(root, config.env_vars.clone()).await?;
            Ok(Arc::new(runtime))
        }
        BackendType::Docker => {
            let runtime = DockerRuntime::new(
                config.docker.clone(),
                root,
                config.workdir.clone(),
                config.env_vars.clone(),
            )
            .await?;
            Ok(Arc::new(runtime))
        }
        BackendType::Auto => Err(PlaypenError::BootFailure(
            "backend selection did not resolve".to_string(),
        )),
    }
}

/// Resolve the backend type, handling Auto selection.
///
/// The Docker daemon is checked at most once.
async fn resolve_backend_type(requested: &BackendType) -> Result<BackendType> {
    match requested {
        BackendType::Auto => {
            // Priority: Docker > Host
            if DockerRuntime::is_available().await {
                Ok(BackendType::Docker)
            } else {
                Ok(BackendType::Host)
            }
        }
        BackendType::Docker => {
            if !DockerRuntime::is_available().await {
                return Err(PlaypenError::BootFailure(
                    "Docker daemon is not accessible. Ensure Docker is installed and running."
                        .to_string(),
                ));
            }
            Ok(BackendType::Docker)
        }
        BackendType::Host => Ok(BackendType::Host),
    }
}

/// Get information about available runtimes on this system.
pub async fn available_backends() -> Vec<BackendInfo> {
    let docker = DockerRuntime::is_available().await;
    vec![
        BackendInfo {
            name: "host",
            available: HostRuntime::is_available(),
            description: "Private workspace directory, processes run natively",
            unavailable_reason: None,
        },
        BackendInfo {
            name: "docker",
            available: docker,
            description: "Docker container with the workspace bind-mounted",
            unavailable_reason: if docker {
                None
            } else {
                Some("Docker daemon not accessible")
            },
        },
    ]
}

/// Information about a sandbox runtime.
#[derive(Debug, Serialize)]
pub struct BackendInfo {
    pub name: &'static str,
    pub available: bool,
    pub description: &'static str,
    pub unavailable_reason: Option<&'static str>,
}
