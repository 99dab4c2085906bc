//! Container orchestration: runtime seam, registry, and lifecycle manager.

pub mod manager;
pub mod registry;
pub mod runtime;

pub use manager::{ContainerManager, StartRequest, container_name};
pub use registry::{ContainerRecord, ContainerRegistry, ContainerState};
pub use runtime::{ContainerRuntime, DockerRuntime, LaunchSpec, connect_docker};
