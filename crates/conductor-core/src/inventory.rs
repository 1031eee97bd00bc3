//! Host/platform registry collaborator interfaces.
//!
//! The pipeline and the scheduler only know hosts as opaque names and
//! platforms as [`PlatformHandler`] trait objects resolved through an
//! [`Inventory`]. Concrete registries (static config, DSL loaders) live
//! outside the core; [`crate::config`] provides a file-backed one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;
use crate::scheduler::plugin::TestPlugin;
use crate::transport::HostAction;

/// Version-control state of a platform repository.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoInfo {
    pub repo_name: String,
    pub branch: String,
    pub commit_id: String,
    /// First line of the head commit message.
    pub commit_message: String,
    pub changed_files: Vec<String>,
    pub added_files: Vec<String>,
    pub deleted_files: Vec<String>,
    pub untracked_files: Vec<String>,
}

impl RepoInfo {
    /// All files differing from the head commit, in a stable order.
    pub fn diff_files(&self) -> Vec<String> {
        let mut files = Vec::new();
        files.extend(self.changed_files.iter().cloned());
        files.extend(self.added_files.iter().cloned());
        files.extend(self.deleted_files.iter().cloned());
        files.extend(self.untracked_files.iter().cloned());
        files
    }

    /// Whether the working tree matches the head commit exactly.
    pub fn is_clean(&self) -> bool {
        self.changed_files.is_empty()
            && self.added_files.is_empty()
            && self.deleted_files.is_empty()
            && self.untracked_files.is_empty()
    }
}

/// Hooks a platform exposes to the deployment pipeline.
///
/// A platform owns a repository of deployable configuration; the pipeline
/// drives it through package → deliver → deploy without knowing what the
/// configuration actually is. `pre_deploy` and `prepare_for_local_testing`
/// are optional; their defaults are no-ops.
pub trait PlatformHandler: Send + Sync {
    /// Repository name, unique across the fleet.
    fn name(&self) -> &str;

    /// Platform type this handler belongs to (e.g. `chef`, `ansible`).
    fn platform_type(&self) -> &str;

    /// Local checkout of the platform repository.
    fn repository_path(&self) -> &Path;

    /// Branch that must be checked out for real deployments.
    fn primary_branch(&self) -> &str {
        "master"
    }

    /// Current version-control state of the repository.
    fn repo_info(&self) -> Result<RepoInfo>;

    /// Package the repository, ready to be delivered.
    fn package(&self) -> Result<()>;

    /// Deliver the packaged repository for one host (artefact upload).
    fn deliver_for(&self, host: &str) -> Result<()>;

    /// Remote actions deploying the packaged configuration on `host`.
    /// `check_mode` asks for a why-run evaluation instead of a real apply.
    fn deploy_actions_for(&self, host: &str, check_mode: bool) -> Result<Vec<HostAction>>;

    /// Hand a parsed secrets document to the platform.
    fn register_secrets(&self, secrets: &serde_json::Value) -> Result<()>;

    /// Hook run once before deploy actions are built.
    fn pre_deploy(&self, check_mode: bool) -> Result<()> {
        let _ = check_mode;
        Ok(())
    }

    /// Adapt the platform so it can deploy against a local sandbox.
    fn prepare_for_local_testing(&self) -> Result<()> {
        Ok(())
    }
}

/// Resolves host descriptors and owns the host → platform mapping.
///
/// Invariant: a host maps to exactly one platform.
pub trait Inventory: Send + Sync {
    /// Expand abstract host descriptors into concrete host names.
    fn resolve_hosts(&self, descriptors: &[String]) -> Result<Vec<String>>;

    /// The platform a host belongs to.
    fn platform_for(&self, host: &str) -> Result<Arc<dyn PlatformHandler>>;

    /// Every known platform.
    fn platforms(&self) -> Vec<Arc<dyn PlatformHandler>>;

    /// Every known platform type.
    fn platform_types(&self) -> Vec<String>;

    /// Test plugins contributed by a platform type.
    fn contributed_tests(&self, platform_type: &str) -> Vec<Arc<dyn TestPlugin>> {
        let _ = platform_type;
        Vec::new()
    }

    /// Sandbox image name declared in a host's metadata, if any.
    fn sandbox_image_for(&self, host: &str) -> Option<String>;

    /// Build-context directory of a registered sandbox image.
    fn sandbox_image_dir(&self, image: &str) -> Option<PathBuf>;
}
