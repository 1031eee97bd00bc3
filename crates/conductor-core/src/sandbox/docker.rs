//! [`ContainerRuntime`] implementation shelling out to the `docker` CLI.

use std::path::Path;
use std::process::Command;

use tracing::debug;

use super::error::{SandboxError, SandboxResult};
use super::runtime::ContainerRuntime;

/// Drives containers through the local `docker` binary.
#[derive(Debug, Default)]
pub struct DockerCli;

impl DockerCli {
    pub fn new() -> Self {
        Self
    }

    fn docker(args: &[&str]) -> SandboxResult<String> {
        debug!(?args, "docker");
        let output = Command::new("docker")
            .args(args)
            .output()
            .map_err(|e| SandboxError::RuntimeUnavailable(e.to_string()))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(SandboxError::Container(format!(
                "docker {} failed: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

impl ContainerRuntime for DockerCli {
    fn available(&self) -> SandboxResult<()> {
        Self::docker(&["version", "--format", "{{.Server.Version}}"]).map(|_| ())
    }

    fn image_exists(&self, tag: &str) -> SandboxResult<bool> {
        Self::docker(&["image", "ls", "--format", "{{.Repository}}", tag])
            .map(|out| !out.is_empty())
            .map_err(|e| SandboxError::Image(e.to_string()))
    }

    fn build_image(&self, dir: &Path, tag: &str) -> SandboxResult<()> {
        Self::docker(&["build", "--tag", tag, &dir.to_string_lossy()])
            .map(|_| ())
            .map_err(|e| SandboxError::Image(e.to_string()))
    }

    fn container_exists(&self, name: &str) -> SandboxResult<bool> {
        let filter = format!("name=^{name}$");
        Self::docker(&["ps", "--all", "--filter", &filter, "--format", "{{.Names}}"])
            .map(|out| out.lines().any(|line| line == name))
    }

    fn create_container(&self, name: &str, tag: &str) -> SandboxResult<()> {
        Self::docker(&["create", "--name", name, tag]).map(|_| ())
    }

    fn start_container(&self, name: &str) -> SandboxResult<()> {
        Self::docker(&["start", name]).map(|_| ())
    }

    fn stop_container(&self, name: &str) -> SandboxResult<()> {
        Self::docker(&["stop", name]).map(|_| ())
    }

    fn remove_container(&self, name: &str) -> SandboxResult<()> {
        Self::docker(&["rm", name]).map(|_| ())
    }

    fn container_address(&self, name: &str) -> SandboxResult<String> {
        let address = Self::docker(&[
            "inspect",
            "--format",
            "{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}",
            name,
        ])?;
        if address.is_empty() {
            Err(SandboxError::Container(format!(
                "container {name} has no network address"
            )))
        } else {
            Ok(address)
        }
    }
}
