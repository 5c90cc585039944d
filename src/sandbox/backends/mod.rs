mod docker;
mod host;

pub use docker::DockerRuntime;
pub use host::HostRuntime;
