// Daemon modules: configuration, tenant lifecycle, isolated runtimes and the control API
pub mod config;
pub mod manager;
pub mod provisioner;
pub mod runtime;
pub mod server;

#[cfg(test)]
pub mod testing;

// Re-export commonly used types
pub use config::{BridgerConfig, ListenAddr};
pub use manager::{BridgeRequest, HydraManager, InstanceInfo, InstanceStatus};
pub use provisioner::{DaemonLauncher, DockerdLauncher};
pub use runtime::{ContainerRuntime, DockerApi};
