//! Container runtime collaborator trait.

use std::path::Path;

use super::error::SandboxResult;

/// Minimal container runtime surface the sandbox lifecycle needs.
///
/// Methods are synchronous on purpose: stopping a container must also be
/// possible from a drop guard so a cancelled sandbox future cannot leak a
/// running container. Implementations may block (the docker CLI does).
pub trait ContainerRuntime: Send + Sync {
    /// Check the runtime is installed and answering.
    fn available(&self) -> SandboxResult<()>;

    fn image_exists(&self, tag: &str) -> SandboxResult<bool>;

    /// Build an image from a build-context directory and tag it.
    fn build_image(&self, dir: &Path, tag: &str) -> SandboxResult<()>;

    /// Whether a container of this name exists, running or not.
    fn container_exists(&self, name: &str) -> SandboxResult<bool>;

    fn create_container(&self, name: &str, tag: &str) -> SandboxResult<()>;

    fn start_container(&self, name: &str) -> SandboxResult<()>;

    fn stop_container(&self, name: &str) -> SandboxResult<()>;

    fn remove_container(&self, name: &str) -> SandboxResult<()>;

    /// Network address of a running container.
    fn container_address(&self, name: &str) -> SandboxResult<String>;
}
