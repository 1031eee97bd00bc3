//! Deployment pipeline: package → deliver → deploy across a resolved fleet,
//! plus the sandboxed variant used for safe pre-merge testing.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::{ConductorError, Result};
use crate::inventory::{Inventory, PlatformHandler};
use crate::sandbox::{ContainerRuntime, SandboxError, SandboxRegistry};
use crate::transport::{
    HostAction, HostCallSpec, HostOutput, RemoteOptions, RemoteTransport,
};

/// Cooperative lock helper uploaded to every host before deploying.
/// Serialises concurrent deployment attempts targeting the same machine.
const REMOTE_LOCK_SCRIPT: &str = r#"#!/bin/sh
# deploy_mutex.sh <lock|unlock> <lock_dir> [owner]
# Directory-based cooperative lock. `lock` exits 0 when acquired, 1 when
# another owner holds it. A lock whose recorded owner pid is gone is stale
# and gets reclaimed.
set -u
cmd="$1"
lock_dir="$2"
case "$cmd" in
  lock)
    owner="$3"
    if mkdir "$lock_dir" 2>/dev/null; then
      echo "$owner" > "$lock_dir/owner"
      exit 0
    fi
    holder="$(cat "$lock_dir/owner" 2>/dev/null || true)"
    if [ -n "$holder" ] && ! kill -0 "$holder" 2>/dev/null; then
      rm -rf "$lock_dir"
      if mkdir "$lock_dir" 2>/dev/null; then
        echo "$owner" > "$lock_dir/owner"
        exit 0
      fi
    fi
    exit 1
    ;;
  unlock)
    rm -rf "$lock_dir"
    ;;
esac
"#;

/// Remote path of the deployment lock directory.
const REMOTE_LOCK_DIR: &str = "/tmp/conductor_deploy_lock";

/// System directory receiving one log record per deployment.
const REMOTE_LOG_DIR: &str = "/var/log/deployments";

/// Timeout for the log-upload batch.
const SAVE_LOGS_TIMEOUT: Duration = Duration::from_secs(10);

/// Drives the package → deliver → deploy pipeline for a resolved set of
/// hosts, and manages sandbox containers for pre-merge testing.
///
/// Cheap to clone: all collaborators sit behind `Arc`s, the knobs are plain
/// values. Sandbox image/container locks are shared process-wide through
/// the [`SandboxRegistry`]; everything else is per-instance.
#[derive(Clone)]
pub struct Deployer {
    inventory: Arc<dyn Inventory>,
    transport: Arc<dyn RemoteTransport>,
    registry: Arc<SandboxRegistry>,
    runtime: Arc<dyn ContainerRuntime>,

    /// Why-run mode: evaluate what a deploy would do without applying it.
    pub use_why_run: bool,
    /// Timeout for each deployment batch; only meaningful in why-run mode.
    pub timeout: Option<Duration>,
    /// Fan out across hosts in parallel with captured output.
    pub concurrent_execution: bool,
    /// Skip the artefact delivery step and deploy straight from the package.
    pub force_direct_deploy: bool,
    /// JSON files whose parsed content is registered into every platform.
    pub secrets: Vec<PathBuf>,
    /// Allow deploying from a branch other than the platform's primary one.
    /// Only meant for testing.
    pub allow_non_primary_branch: bool,
}

impl Deployer {
    pub fn new(
        inventory: Arc<dyn Inventory>,
        transport: Arc<dyn RemoteTransport>,
        registry: Arc<SandboxRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            inventory,
            transport,
            registry,
            runtime,
            use_why_run: false,
            timeout: None,
            concurrent_execution: false,
            force_direct_deploy: false,
            secrets: Vec::new(),
            allow_non_primary_branch: false,
        }
    }

    pub fn inventory(&self) -> &Arc<dyn Inventory> {
        &self.inventory
    }

    pub fn transport(&self) -> &Arc<dyn RemoteTransport> {
        &self.transport
    }

    pub fn sandbox_registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }

    /// Reject option combinations that make no sense.
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_some() && !self.use_why_run {
            return Err(ConductorError::Configuration(
                "a deployment timeout is only supported in why-run mode".to_string(),
            ));
        }
        Ok(())
    }

    /// Deploy (or why-run check) the platforms impacted by `descriptors`.
    ///
    /// Returns exactly one [`HostOutput`] per resolved host: captured
    /// output on success, an error marker when the transport could not
    /// drive the host. A marker never aborts the other hosts.
    pub async fn deploy_for(
        &self,
        descriptors: &[String],
    ) -> Result<BTreeMap<String, HostOutput>> {
        let hosts = self.inventory.resolve_hosts(descriptors)?;
        let platforms = self.impacted_platforms(&hosts)?;

        // Fatal before any side effect: real deployments only leave the
        // primary branch.
        if !self.use_why_run && !self.allow_non_primary_branch {
            for platform in &platforms {
                let info = platform.repo_info()?;
                if info.branch != platform.primary_branch() {
                    return Err(ConductorError::NotOnPrimaryBranch {
                        platform: platform.name().to_string(),
                        expected: platform.primary_branch().to_string(),
                        actual: info.branch,
                    });
                }
            }
        }

        info!(platforms = platforms.len(), "packaging repositories");
        for platform in &platforms {
            platform.package()?;
        }

        if !self.force_direct_deploy {
            info!(hosts = hosts.len(), "delivering on artefact repositories");
            for host in &hosts {
                self.inventory.platform_for(host)?.deliver_for(host)?;
            }
        }

        self.deploy(&hosts, &platforms).await
    }

    /// Unique platforms impacted by `hosts`, in first-seen order.
    fn impacted_platforms(&self, hosts: &[String]) -> Result<Vec<Arc<dyn PlatformHandler>>> {
        let mut seen = Vec::<Arc<dyn PlatformHandler>>::new();
        for host in hosts {
            let platform = self.inventory.platform_for(host)?;
            if !seen.iter().any(|p| p.name() == platform.name()) {
                seen.push(platform);
            }
        }
        Ok(seen)
    }

    async fn deploy(
        &self,
        hosts: &[String],
        platforms: &[Arc<dyn PlatformHandler>],
    ) -> Result<BTreeMap<String, HostOutput>> {
        info!(
            hosts = hosts.len(),
            why_run = self.use_why_run,
            "{} on {} hosts",
            if self.use_why_run { "checking" } else { "deploying" },
            hosts.len()
        );

        for json_file in &self.secrets {
            let secret: serde_json::Value =
                serde_json::from_str(&std::fs::read_to_string(json_file)?)?;
            for platform in platforms {
                platform.register_secrets(&secret)?;
            }
        }

        for platform in platforms {
            platform.pre_deploy(self.use_why_run)?;
        }

        // Stage the lock helper; the directory must outlive the transport
        // call since scp sources point into it.
        let staging = tempfile::tempdir()?;
        let lock_script = staging.path().join("deploy_mutex.sh");
        std::fs::write(&lock_script, REMOTE_LOCK_SCRIPT)?;

        let mut calls = BTreeMap::new();
        for host in hosts {
            let platform = self.inventory.platform_for(host)?;
            let mut actions = vec![self.lock_acquisition_action(&lock_script)];
            actions.extend(platform.deploy_actions_for(host, self.use_why_run)?);
            calls.insert(
                host.clone(),
                HostCallSpec {
                    env: BTreeMap::from([("conductor_node".to_string(), host.clone())]),
                    actions,
                },
            );
        }

        let outputs = self
            .transport
            .run_on_hosts(
                calls,
                &RemoteOptions {
                    timeout: self.timeout,
                    concurrent: self.concurrent_execution,
                    log_to_stdout: !self.concurrent_execution,
                    log_to_dir: None,
                },
            )
            .await;

        if !self.use_why_run && !self.transport.dry_run() {
            self.save_logs(&outputs).await?;
        }

        Ok(outputs)
    }

    /// First remote action of every deployment: upload the lock helper and
    /// poll every 5 seconds until the host-wide deploy lock is acquired.
    fn lock_acquisition_action(&self, lock_script: &std::path::Path) -> HostAction {
        let sudo = if self.transport.remote_user() == "root" {
            ""
        } else {
            "sudo "
        };
        HostAction {
            scp: BTreeMap::from([(
                lock_script.to_string_lossy().into_owned(),
                "./deploy_mutex.sh".to_string(),
            )]),
            bash: vec![
                "chmod +x ./deploy_mutex.sh".to_string(),
                format!(
                    "while ! {sudo}./deploy_mutex.sh lock {REMOTE_LOCK_DIR} \"$(ps -o ppid= -p $$)\"; do echo 'Another deployment is running. Waiting for it to finish to continue...' ; sleep 5 ; done"
                ),
            ],
        }
    }

    /// Persist one structured log record per deployed host, uploaded to the
    /// host's system log directory.
    async fn save_logs(&self, outputs: &BTreeMap<String, HostOutput>) -> Result<()> {
        info!(hosts = outputs.len(), "saving deployment logs");
        let staging = tempfile::tempdir()?;
        let now = Utc::now();
        let user = self.transport.remote_user();
        let sudo = if user == "root" { "" } else { "sudo " };

        let mut calls = BTreeMap::new();
        for (host, output) in outputs {
            let platform = self.inventory.platform_for(host)?;
            let info = platform.repo_info()?;

            let (stdout, stderr) = match output {
                HostOutput::Success { stdout, stderr, .. } => {
                    (stdout.clone(), stderr.clone())
                }
                HostOutput::Failed(marker) => (format!("Error: {marker}"), String::new()),
            };

            let record = format!(
                "date: {}\nuser: {}\ndebug: {}\nrepo_name: {}\ncommit_id: {}\ncommit_message: {}\ndiff_files: {}\n===== STDOUT =====\n{}\n===== STDERR =====\n{}",
                now.format("%F %T"),
                user,
                if self.transport.debug() { "Yes" } else { "No" },
                info.repo_name,
                info.commit_id,
                info.commit_message,
                info.diff_files().join(", "),
                stdout,
                stderr,
            );

            let log_file = staging.path().join(host);
            std::fs::write(&log_file, record)?;

            // Transfers run before bash lines and as the remote user, so
            // the record lands in the user's home first and is moved into
            // the system log directory with elevated privileges.
            let basename = format!("{}_{}", now.format("%F_%H%M%S"), user);
            calls.insert(
                host.clone(),
                HostCallSpec {
                    env: BTreeMap::new(),
                    actions: vec![HostAction {
                        scp: BTreeMap::from([(
                            log_file.to_string_lossy().into_owned(),
                            format!("./{basename}"),
                        )]),
                        bash: vec![
                            format!("{sudo}mkdir -p {REMOTE_LOG_DIR}"),
                            format!("{sudo}mv ./{basename} {REMOTE_LOG_DIR}/{basename}"),
                        ],
                    }],
                },
            );
        }

        let results = self
            .transport
            .run_on_hosts(
                calls,
                &RemoteOptions {
                    timeout: Some(SAVE_LOGS_TIMEOUT),
                    concurrent: true,
                    log_to_stdout: false,
                    log_to_dir: None,
                },
            )
            .await;

        for (host, result) in results {
            if let HostOutput::Failed(marker) = result {
                warn!(host = %host, %marker, "could not save deployment log");
            }
        }
        Ok(())
    }

    /// Run `callback` against a disposable sandbox container for `host`.
    ///
    /// The host's declared image is built at most once per tag (concurrent
    /// same-tag callers wait for the first build); the container lifecycle
    /// is serialised per container name. The callback receives a `Deployer`
    /// whose remote actions are routed to the container with root
    /// credentials, plus the container address. The container is stopped
    /// when this returns, whether the callback succeeded, failed, or the
    /// future was cancelled.
    pub async fn with_sandbox_for<T, F, Fut>(
        &self,
        host: &str,
        instance_id: &str,
        reuse: bool,
        callback: F,
    ) -> Result<T>
    where
        F: FnOnce(Deployer, String) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.runtime
            .available()
            .map_err(|e| SandboxError::RuntimeUnavailable(e.to_string()))?;

        let image = self
            .inventory
            .sandbox_image_for(host)
            .ok_or_else(|| SandboxError::UnknownImage {
                host: host.to_string(),
                image: "<undeclared>".to_string(),
            })?;
        let image_dir =
            self.inventory
                .sandbox_image_dir(&image)
                .ok_or_else(|| SandboxError::UnknownImage {
                    host: host.to_string(),
                    image: image.clone(),
                })?;

        let image_tag = format!("conductor_image_{image}");
        let runtime = self.runtime.clone();
        self.registry
            .with_image_lock(&image_tag, || async {
                if !runtime.image_exists(&image_tag)? {
                    info!(tag = %image_tag, "building sandbox image");
                    runtime.build_image(&image_dir, &image_tag)?;
                }
                Ok::<_, SandboxError>(())
            })
            .await?;

        let container_name = format!("conductor_{host}_{instance_id}");
        self.registry
            .with_container_lock(&container_name, || async {
                let existing = runtime.container_exists(&container_name)?;
                if existing && reuse {
                    info!(container = %container_name, "reusing existing sandbox container");
                } else {
                    if existing {
                        runtime.stop_container(&container_name)?;
                        runtime.remove_container(&container_name)?;
                    }
                    info!(container = %container_name, "creating sandbox container");
                    runtime.create_container(&container_name, &image_tag)?;
                }

                runtime.start_container(&container_name)?;
                // Stops the container on every exit path, cancellation
                // included.
                let _guard = ContainerGuard {
                    runtime: runtime.clone(),
                    name: container_name.clone(),
                };

                let address = runtime.container_address(&container_name)?;
                let transport = self.transport.rebind(host, &address, "root");
                let mut sandboxed = Deployer::new(
                    self.inventory.clone(),
                    transport,
                    self.registry.clone(),
                    self.runtime.clone(),
                );
                sandboxed.force_direct_deploy = true;
                sandboxed.allow_non_primary_branch = true;
                sandboxed.secrets = self.secrets.clone();

                self.inventory.platform_for(host)?.prepare_for_local_testing()?;

                callback(sandboxed, address)
                    .await
                    .map_err(|e| ConductorError::Callback(format!("{e:#}")))
            })
            .await
    }
}

struct ContainerGuard {
    runtime: Arc<dyn ContainerRuntime>,
    name: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        match self.runtime.stop_container(&self.name) {
            Ok(()) => info!(container = %self.name, "sandbox container stopped"),
            Err(e) => warn!(container = %self.name, error = %e, "failed to stop sandbox container"),
        }
    }
}
