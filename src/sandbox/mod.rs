mod backends;
mod factory;
mod process;
mod ready;
mod traits;
mod workspace;

pub use backends::{DockerRuntime, HostRuntime};
pub use factory::{available_backends, create_runtime, BackendInfo};
pub use process::{ExitSignal, ManagedProcess, PtyResize};
pub(crate) use process::Utf8Decoder;
pub use ready::{extract_port, ReadyDetector};
pub use traits::{SandboxInfo, SandboxRuntime, ServerReady, SpawnOptions, TerminalSize};
pub use workspace::Workspace;
