//! File-backed fleet configuration.
//!
//! A JSON document declares the platforms (their repositories, hosts and
//! command hooks) plus the sandbox images hosts can be tested in. Loading
//! it yields a [`StaticInventory`] of [`ShellPlatform`] handlers, the
//! concrete [`Inventory`] used by the CLI.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ConductorError, Result};
use crate::inventory::{Inventory, PlatformHandler, RepoInfo};
use crate::transport::HostAction;

fn default_clones_dir() -> PathBuf {
    PathBuf::from("./clones")
}

/// Root of the fleet configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub platforms: Vec<PlatformConfig>,
    /// Sandbox image name → directory holding its build context.
    #[serde(default)]
    pub sandbox_images: BTreeMap<String, PathBuf>,
    /// Where git-sourced platforms are cloned on first load.
    #[serde(default = "default_clones_dir")]
    pub clones_dir: PathBuf,
}

/// One platform declaration. Exactly one of `path` and `git` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub name: String,
    pub platform_type: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub git: Option<String>,
    #[serde(default)]
    pub primary_branch: Option<String>,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
    #[serde(default)]
    pub commands: CommandHooks,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub name: String,
    #[serde(default)]
    pub sandbox_image: Option<String>,
}

/// Shell commands driving the platform's deployment tooling.
///
/// Local hooks (`package`, `deliver`) run in the repository directory;
/// remote hooks (`deploy`, `check`) run on the target host. `{host}` in
/// any command is substituted with the target host name. An empty `check`
/// list falls back to `deploy`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandHooks {
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub deliver: Option<String>,
    #[serde(default)]
    pub deploy: Vec<String>,
    #[serde(default)]
    pub check: Vec<String>,
}

impl FleetConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConductorError::Configuration(format!(
                "cannot read fleet config {}: {e}",
                path.display()
            ))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Validate the declarations and build the inventory, cloning
    /// git-sourced platforms that are not present locally yet.
    pub fn into_inventory(self) -> Result<StaticInventory> {
        let mut platforms: BTreeMap<String, Arc<dyn PlatformHandler>> = BTreeMap::new();
        let mut by_host = BTreeMap::new();
        let mut image_by_host = BTreeMap::new();

        for platform in self.platforms {
            let repository_path = match (&platform.path, &platform.git) {
                (Some(path), None) => path.clone(),
                (None, Some(url)) => clone_if_missing(&self.clones_dir, &platform.name, url)?,
                _ => {
                    return Err(ConductorError::Configuration(format!(
                        "platform {} needs either a path or a git url",
                        platform.name
                    )))
                }
            };
            if platforms.contains_key(&platform.name) {
                return Err(ConductorError::Configuration(format!(
                    "platform {} is declared twice",
                    platform.name
                )));
            }
            for host in &platform.hosts {
                if by_host.contains_key(&host.name) {
                    return Err(ConductorError::Configuration(format!(
                        "host {} is registered to several platforms",
                        host.name
                    )));
                }
                by_host.insert(host.name.clone(), platform.name.clone());
                if let Some(image) = &host.sandbox_image {
                    image_by_host.insert(host.name.clone(), image.clone());
                }
            }
            platforms.insert(
                platform.name.clone(),
                Arc::new(ShellPlatform {
                    name: platform.name,
                    platform_type: platform.platform_type,
                    repository_path,
                    primary_branch: platform.primary_branch,
                    commands: platform.commands,
                    secrets: Mutex::new(None),
                }),
            );
        }

        Ok(StaticInventory {
            platforms,
            by_host,
            image_by_host,
            image_dirs: self.sandbox_images,
        })
    }
}

fn clone_if_missing(clones_dir: &Path, name: &str, url: &str) -> Result<PathBuf> {
    let target = clones_dir.join(name);
    if target.is_dir() {
        debug!(platform = %name, "reusing existing clone");
        return Ok(target);
    }
    std::fs::create_dir_all(clones_dir)?;
    info!(platform = %name, url = %url, "cloning platform repository");
    let status = Command::new("git")
        .arg("clone")
        .arg(url)
        .arg(&target)
        .status()?;
    if !status.success() {
        return Err(ConductorError::Platform(format!(
            "git clone of {url} failed with status {status}"
        )));
    }
    Ok(target)
}

/// Platform handler backed by git metadata and configured shell hooks.
pub struct ShellPlatform {
    name: String,
    platform_type: String,
    repository_path: PathBuf,
    primary_branch: Option<String>,
    commands: CommandHooks,
    secrets: Mutex<Option<serde_json::Value>>,
}

impl ShellPlatform {
    fn run_local(&self, command: &str) -> Result<()> {
        debug!(platform = %self.name, command = %command, "running local hook");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.repository_path)
            .output()?;
        if !output.status.success() {
            return Err(ConductorError::Platform(format!(
                "command '{command}' failed on platform {}: {}",
                self.name,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn git_output(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repository_path)
            .output()?;
        if !output.status.success() {
            return Err(ConductorError::Platform(format!(
                "git {} failed on platform {}: {}",
                args.join(" "),
                self.name,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Last stored secrets document, if any.
    pub fn secrets(&self) -> Option<serde_json::Value> {
        self.secrets.lock().ok().and_then(|s| s.clone())
    }
}

impl PlatformHandler for ShellPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    fn platform_type(&self) -> &str {
        &self.platform_type
    }

    fn repository_path(&self) -> &Path {
        &self.repository_path
    }

    fn primary_branch(&self) -> &str {
        self.primary_branch.as_deref().unwrap_or("master")
    }

    fn repo_info(&self) -> Result<RepoInfo> {
        let mut info = RepoInfo {
            repo_name: self.name.clone(),
            branch: self.git_output(&["rev-parse", "--abbrev-ref", "HEAD"])?,
            commit_id: self.git_output(&["rev-parse", "HEAD"])?,
            commit_message: self.git_output(&["log", "-1", "--pretty=%s"])?,
            ..Default::default()
        };
        for line in self
            .git_output(&["status", "--porcelain"])?
            .lines()
            .filter(|l| l.len() > 3)
        {
            let (status, file) = line.split_at(3);
            let file = file.to_string();
            match status.trim() {
                "??" => info.untracked_files.push(file),
                "A" => info.added_files.push(file),
                "D" => info.deleted_files.push(file),
                _ => info.changed_files.push(file),
            }
        }
        Ok(info)
    }

    fn package(&self) -> Result<()> {
        match &self.commands.package {
            Some(command) => self.run_local(command),
            None => Ok(()),
        }
    }

    fn deliver_for(&self, host: &str) -> Result<()> {
        match &self.commands.deliver {
            Some(command) => self.run_local(&command.replace("{host}", host)),
            None => Ok(()),
        }
    }

    fn deploy_actions_for(&self, host: &str, check_mode: bool) -> Result<Vec<HostAction>> {
        let commands = if check_mode && !self.commands.check.is_empty() {
            &self.commands.check
        } else {
            &self.commands.deploy
        };
        if commands.is_empty() {
            return Err(ConductorError::Platform(format!(
                "platform {} has no deploy commands configured",
                self.name
            )));
        }
        let bash: Vec<String> = commands
            .iter()
            .map(|c| c.replace("{host}", host))
            .collect();
        Ok(vec![HostAction::bash(bash)])
    }

    fn register_secrets(&self, secrets: &serde_json::Value) -> Result<()> {
        if let Ok(mut slot) = self.secrets.lock() {
            *slot = Some(secrets.clone());
        }
        Ok(())
    }
}

/// Inventory resolved from a [`FleetConfig`].
pub struct StaticInventory {
    platforms: BTreeMap<String, Arc<dyn PlatformHandler>>,
    by_host: BTreeMap<String, String>,
    image_by_host: BTreeMap<String, String>,
    image_dirs: BTreeMap<String, PathBuf>,
}

impl std::fmt::Debug for StaticInventory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticInventory")
            .field("platforms", &self.platforms.keys())
            .field("by_host", &self.by_host)
            .field("image_by_host", &self.image_by_host)
            .field("image_dirs", &self.image_dirs)
            .finish()
    }
}

impl Inventory for StaticInventory {
    /// A descriptor is a host name, a platform name (expanding to its
    /// hosts), or `all`.
    fn resolve_hosts(&self, descriptors: &[String]) -> Result<Vec<String>> {
        let mut hosts = Vec::new();
        for descriptor in descriptors {
            if descriptor == "all" {
                hosts.extend(self.by_host.keys().cloned());
            } else if self.by_host.contains_key(descriptor) {
                hosts.push(descriptor.clone());
            } else if self.platforms.contains_key(descriptor) {
                hosts.extend(
                    self.by_host
                        .iter()
                        .filter(|(_, platform)| *platform == descriptor)
                        .map(|(host, _)| host.clone()),
                );
            } else {
                return Err(ConductorError::Configuration(format!(
                    "unknown host descriptor: {descriptor}"
                )));
            }
        }
        hosts.sort();
        hosts.dedup();
        Ok(hosts)
    }

    fn platform_for(&self, host: &str) -> Result<Arc<dyn PlatformHandler>> {
        let name = self.by_host.get(host).ok_or_else(|| {
            ConductorError::Configuration(format!("unknown host: {host}"))
        })?;
        self.platforms
            .get(name)
            .cloned()
            .ok_or_else(|| ConductorError::Configuration(format!("unknown platform: {name}")))
    }

    fn platforms(&self) -> Vec<Arc<dyn PlatformHandler>> {
        self.platforms.values().cloned().collect()
    }

    fn platform_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .platforms
            .values()
            .map(|p| p.platform_type().to_string())
            .collect();
        types.sort();
        types.dedup();
        types
    }

    fn sandbox_image_for(&self, host: &str) -> Option<String> {
        self.image_by_host.get(host).cloned()
    }

    fn sandbox_image_dir(&self, image: &str) -> Option<PathBuf> {
        self.image_dirs.get(image).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform(name: &str, hosts: &[&str]) -> PlatformConfig {
        PlatformConfig {
            name: name.to_string(),
            platform_type: "shell".to_string(),
            path: Some(PathBuf::from("/tmp/repo")),
            git: None,
            primary_branch: None,
            hosts: hosts
                .iter()
                .map(|h| HostConfig {
                    name: h.to_string(),
                    sandbox_image: Some("debian_10".to_string()),
                })
                .collect(),
            commands: CommandHooks {
                deploy: vec!["apply {host}".to_string()],
                check: vec!["apply --dry-run {host}".to_string()],
                ..Default::default()
            },
        }
    }

    fn config(platforms: Vec<PlatformConfig>) -> FleetConfig {
        FleetConfig {
            platforms,
            sandbox_images: [("debian_10".to_string(), PathBuf::from("/tmp/images/deb10"))]
                .into(),
            clones_dir: default_clones_dir(),
        }
    }

    #[test]
    fn test_platform_needs_path_or_git() {
        let mut bad = platform("p1", &[]);
        bad.path = None;
        let err = config(vec![bad]).into_inventory().unwrap_err();
        assert!(err.to_string().contains("needs either a path or a git url"));

        let mut bad = platform("p1", &[]);
        bad.git = Some("https://example.com/repo.git".to_string());
        let err = config(vec![bad]).into_inventory().unwrap_err();
        assert!(err.to_string().contains("needs either a path or a git url"));
    }

    #[test]
    fn test_duplicate_platform_rejected() {
        let err = config(vec![platform("p1", &["n1"]), platform("p1", &["n2"])])
            .into_inventory()
            .unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }

    #[test]
    fn test_host_in_two_platforms_rejected() {
        let err = config(vec![platform("p1", &["n1"]), platform("p2", &["n1"])])
            .into_inventory()
            .unwrap_err();
        assert!(err.to_string().contains("registered to several platforms"));
    }

    #[test]
    fn test_resolve_hosts_descriptors() {
        let inventory = config(vec![
            platform("p1", &["n1", "n2"]),
            platform("p2", &["n3"]),
        ])
        .into_inventory()
        .unwrap();

        assert_eq!(
            inventory.resolve_hosts(&["all".to_string()]).unwrap(),
            vec!["n1", "n2", "n3"]
        );
        assert_eq!(
            inventory.resolve_hosts(&["p1".to_string()]).unwrap(),
            vec!["n1", "n2"]
        );
        assert_eq!(
            inventory
                .resolve_hosts(&["n3".to_string(), "n3".to_string()])
                .unwrap(),
            vec!["n3"]
        );
        assert!(inventory.resolve_hosts(&["nope".to_string()]).is_err());
    }

    #[test]
    fn test_deploy_actions_substitute_host_and_pick_check_variant() {
        let inventory = config(vec![platform("p1", &["n1"])]).into_inventory().unwrap();
        let p = inventory.platform_for("n1").unwrap();

        let actions = p.deploy_actions_for("n1", false).unwrap();
        assert_eq!(actions[0].bash, vec!["apply n1".to_string()]);

        let actions = p.deploy_actions_for("n1", true).unwrap();
        assert_eq!(actions[0].bash, vec!["apply --dry-run n1".to_string()]);
    }

    #[test]
    fn test_sandbox_image_lookup() {
        let inventory = config(vec![platform("p1", &["n1"])]).into_inventory().unwrap();
        assert_eq!(inventory.sandbox_image_for("n1").as_deref(), Some("debian_10"));
        assert_eq!(
            inventory.sandbox_image_dir("debian_10"),
            Some(PathBuf::from("/tmp/images/deb10"))
        );
        assert_eq!(inventory.sandbox_image_for("other"), None);
    }
}
