//! In-memory fakes for exercising the pipeline without a real fleet.
//!
//! Shipped as part of the crate so integration tests and downstream
//! consumers can script deployments and assert on recorded interactions.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::deployer::Deployer;
use crate::error::Result;
use crate::inventory::{Inventory, PlatformHandler, RepoInfo};
use crate::sandbox::{ContainerRuntime, SandboxError, SandboxRegistry, SandboxResult};
use crate::scheduler::plugin::{TestContext, TestPlugin};
use crate::transport::{
    HostAction, HostCallSpec, HostOutput, RemoteOptions, RemoteTransport, TransportFailure,
};

// ── platform ─────────────────────────────────────────────────────────────

/// Platform handler recording every hook call.
pub struct FakePlatform {
    name: String,
    platform_type: String,
    repository_path: PathBuf,
    /// Branch reported by `repo_info`.
    pub branch: Mutex<String>,
    /// Files reported as locally changed by `repo_info`.
    pub dirty_files: Mutex<Vec<String>>,
    /// Hook invocations, in order (e.g. `package`, `deliver:n1`).
    pub calls: Mutex<Vec<String>>,
    /// Secrets documents handed over through `register_secrets`.
    pub secrets_seen: Mutex<Vec<serde_json::Value>>,
}

impl FakePlatform {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            repository_path: PathBuf::from(format!("/tmp/{name}")),
            name,
            platform_type: "fake".to_string(),
            branch: Mutex::new("master".to_string()),
            dirty_files: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            secrets_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_type(mut self, platform_type: impl Into<String>) -> Self {
        self.platform_type = platform_type.into();
        self
    }

    pub fn set_branch(&self, branch: impl Into<String>) {
        *self.branch.lock().expect("fake poisoned") = branch.into();
    }

    pub fn recorded_calls(&self) -> Vec<String> {
        self.calls.lock().expect("fake poisoned").clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("fake poisoned").push(call);
    }
}

impl PlatformHandler for FakePlatform {
    fn name(&self) -> &str {
        &self.name
    }

    fn platform_type(&self) -> &str {
        &self.platform_type
    }

    fn repository_path(&self) -> &Path {
        &self.repository_path
    }

    fn repo_info(&self) -> Result<RepoInfo> {
        Ok(RepoInfo {
            repo_name: self.name.clone(),
            branch: self.branch.lock().expect("fake poisoned").clone(),
            commit_id: "deadbeef".to_string(),
            commit_message: "fake commit".to_string(),
            changed_files: self.dirty_files.lock().expect("fake poisoned").clone(),
            ..Default::default()
        })
    }

    fn package(&self) -> Result<()> {
        self.record("package".to_string());
        Ok(())
    }

    fn deliver_for(&self, host: &str) -> Result<()> {
        self.record(format!("deliver:{host}"));
        Ok(())
    }

    fn deploy_actions_for(&self, host: &str, check_mode: bool) -> Result<Vec<HostAction>> {
        self.record(format!("deploy_actions:{host}:{check_mode}"));
        let verb = if check_mode { "check" } else { "deploy" };
        Ok(vec![HostAction::bash([format!("{verb} {host}")])])
    }

    fn register_secrets(&self, secrets: &serde_json::Value) -> Result<()> {
        self.record("register_secrets".to_string());
        self.secrets_seen
            .lock()
            .expect("fake poisoned")
            .push(secrets.clone());
        Ok(())
    }

    fn pre_deploy(&self, check_mode: bool) -> Result<()> {
        self.record(format!("pre_deploy:{check_mode}"));
        Ok(())
    }

    fn prepare_for_local_testing(&self) -> Result<()> {
        self.record("prepare_for_local_testing".to_string());
        Ok(())
    }
}

// ── inventory ────────────────────────────────────────────────────────────

/// Static inventory over [`FakePlatform`]s.
#[derive(Default)]
pub struct FakeInventory {
    platforms: Vec<Arc<FakePlatform>>,
    by_host: BTreeMap<String, usize>,
    image_by_host: BTreeMap<String, String>,
    image_dirs: BTreeMap<String, PathBuf>,
    contributed: BTreeMap<String, Vec<Arc<dyn TestPlugin>>>,
}

impl FakeInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_platform(mut self, platform: Arc<FakePlatform>, hosts: &[&str]) -> Self {
        let idx = self.platforms.len();
        self.platforms.push(platform);
        for host in hosts {
            self.by_host.insert((*host).to_string(), idx);
        }
        self
    }

    pub fn with_sandbox_image(mut self, host: &str, image: &str, dir: impl Into<PathBuf>) -> Self {
        self.image_by_host
            .insert(host.to_string(), image.to_string());
        self.image_dirs.insert(image.to_string(), dir.into());
        self
    }

    pub fn with_contributed_test(
        mut self,
        platform_type: &str,
        plugin: Arc<dyn TestPlugin>,
    ) -> Self {
        self.contributed
            .entry(platform_type.to_string())
            .or_default()
            .push(plugin);
        self
    }

    pub fn platform(&self, name: &str) -> Option<Arc<FakePlatform>> {
        self.platforms.iter().find(|p| p.name() == name).cloned()
    }
}

impl Inventory for FakeInventory {
    fn resolve_hosts(&self, descriptors: &[String]) -> Result<Vec<String>> {
        let mut hosts = Vec::new();
        for descriptor in descriptors {
            if descriptor == "all" {
                hosts.extend(self.by_host.keys().cloned());
            } else if self.by_host.contains_key(descriptor) {
                hosts.push(descriptor.clone());
            } else if let Some(idx) = self
                .platforms
                .iter()
                .position(|p| p.name() == descriptor.as_str())
            {
                hosts.extend(
                    self.by_host
                        .iter()
                        .filter(|(_, i)| **i == idx)
                        .map(|(host, _)| host.clone()),
                );
            } else {
                return Err(crate::error::ConductorError::Configuration(format!(
                    "unknown host descriptor: {descriptor}"
                )));
            }
        }
        hosts.sort();
        hosts.dedup();
        Ok(hosts)
    }

    fn platform_for(&self, host: &str) -> Result<Arc<dyn PlatformHandler>> {
        self.by_host
            .get(host)
            .and_then(|idx| self.platforms.get(*idx))
            .map(|p| p.clone() as Arc<dyn PlatformHandler>)
            .ok_or_else(|| {
                crate::error::ConductorError::Configuration(format!("unknown host: {host}"))
            })
    }

    fn platforms(&self) -> Vec<Arc<dyn PlatformHandler>> {
        self.platforms
            .iter()
            .map(|p| p.clone() as Arc<dyn PlatformHandler>)
            .collect()
    }

    fn platform_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .platforms
            .iter()
            .map(|p| p.platform_type().to_string())
            .collect();
        types.sort();
        types.dedup();
        types
    }

    fn contributed_tests(&self, platform_type: &str) -> Vec<Arc<dyn TestPlugin>> {
        self.contributed
            .get(platform_type)
            .cloned()
            .unwrap_or_default()
    }

    fn sandbox_image_for(&self, host: &str) -> Option<String> {
        self.image_by_host.get(host).cloned()
    }

    fn sandbox_image_dir(&self, image: &str) -> Option<PathBuf> {
        self.image_dirs.get(image).cloned()
    }
}

// ── transport ────────────────────────────────────────────────────────────

/// One recorded `run_on_hosts` invocation.
#[derive(Clone)]
pub struct RecordedCall {
    pub calls: BTreeMap<String, HostCallSpec>,
    pub options: RemoteOptions,
    /// Content of scp'd local files at call time, keyed by remote
    /// destination. Captured eagerly because staging directories are
    /// usually gone by assertion time.
    pub scp_contents: BTreeMap<String, String>,
    /// User the transport authenticated as for this call.
    pub user: String,
}

#[derive(Default)]
struct FakeTransportState {
    scripted: BTreeMap<String, VecDeque<HostOutput>>,
    calls: Vec<RecordedCall>,
    rebinds: Vec<(String, String, String)>,
}

/// Transport returning scripted outputs and recording every call.
///
/// Unscripted hosts succeed with empty output. Rebound instances share
/// the recording state of their parent, so sandbox traffic stays visible.
pub struct FakeTransport {
    state: Arc<Mutex<FakeTransportState>>,
    user: String,
    dry_run: bool,
    debug: bool,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            user: "admin".to_string(),
            dry_run: false,
            debug: false,
        }
    }
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Queue the output returned by the next call touching `host`.
    pub fn script(&self, host: &str, output: HostOutput) {
        self.state
            .lock()
            .expect("fake poisoned")
            .scripted
            .entry(host.to_string())
            .or_default()
            .push_back(output);
    }

    pub fn script_success(&self, host: &str, exit_code: i32, stdout: &str) {
        self.script(
            host,
            HostOutput::Success {
                exit_code,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        );
    }

    pub fn script_failure(&self, host: &str, marker: TransportFailure) {
        self.script(host, HostOutput::Failed(marker));
    }

    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.state.lock().expect("fake poisoned").calls.clone()
    }

    pub fn rebinds(&self) -> Vec<(String, String, String)> {
        self.state.lock().expect("fake poisoned").rebinds.clone()
    }
}

#[async_trait]
impl RemoteTransport for FakeTransport {
    async fn run_on_hosts(
        &self,
        calls: BTreeMap<String, HostCallSpec>,
        options: &RemoteOptions,
    ) -> BTreeMap<String, HostOutput> {
        let mut state = self.state.lock().expect("fake poisoned");

        let mut scp_contents = BTreeMap::new();
        for spec in calls.values() {
            for action in &spec.actions {
                for (source, destination) in &action.scp {
                    if let Ok(content) = std::fs::read_to_string(source) {
                        scp_contents.insert(destination.clone(), content);
                    }
                }
            }
        }
        state.calls.push(RecordedCall {
            calls: calls.clone(),
            options: options.clone(),
            scp_contents,
            user: self.user.clone(),
        });

        calls
            .keys()
            .map(|host| {
                let output = if self.dry_run {
                    HostOutput::Failed(TransportFailure::DryRunSkipped)
                } else {
                    state
                        .scripted
                        .get_mut(host)
                        .and_then(VecDeque::pop_front)
                        .unwrap_or(HostOutput::Success {
                            exit_code: 0,
                            stdout: String::new(),
                            stderr: String::new(),
                        })
                };
                (host.clone(), output)
            })
            .collect()
    }

    fn remote_user(&self) -> String {
        self.user.clone()
    }

    fn dry_run(&self) -> bool {
        self.dry_run
    }

    fn debug(&self) -> bool {
        self.debug
    }

    fn rebind(&self, host: &str, address: &str, user: &str) -> Arc<dyn RemoteTransport> {
        let mut state = self.state.lock().expect("fake poisoned");
        state
            .rebinds
            .push((host.to_string(), address.to_string(), user.to_string()));
        Arc::new(FakeTransport {
            state: self.state.clone(),
            user: user.to_string(),
            dry_run: self.dry_run,
            debug: self.debug,
        })
    }
}

// ── container runtime ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeContainerState {
    Created,
    Running,
    Stopped,
}

#[derive(Default)]
struct FakeRuntimeState {
    images: BTreeMap<String, usize>,
    containers: BTreeMap<String, FakeContainerState>,
    events: Vec<String>,
    available: Option<String>,
    build_failure: Option<String>,
}

/// Container runtime tracking lifecycle transitions in memory.
#[derive(Default)]
pub struct FakeRuntime {
    state: Arc<Mutex<FakeRuntimeState>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `available` fail with `message`.
    pub fn set_unavailable(&self, message: &str) {
        self.state.lock().expect("fake poisoned").available = Some(message.to_string());
    }

    /// Make the next `build_image` calls fail with `message`.
    pub fn fail_builds(&self, message: &str) {
        self.state.lock().expect("fake poisoned").build_failure = Some(message.to_string());
    }

    /// Pre-register a container, as if left over from a previous run.
    pub fn seed_container(&self, name: &str, container_state: FakeContainerState) {
        self.state
            .lock()
            .expect("fake poisoned")
            .containers
            .insert(name.to_string(), container_state);
    }

    pub fn build_count(&self, tag: &str) -> usize {
        self.state
            .lock()
            .expect("fake poisoned")
            .images
            .get(tag)
            .copied()
            .unwrap_or(0)
    }

    pub fn container_state(&self, name: &str) -> Option<FakeContainerState> {
        self.state
            .lock()
            .expect("fake poisoned")
            .containers
            .get(name)
            .copied()
    }

    /// Lifecycle events, in order (e.g. `build:tag`, `start:name`).
    pub fn events(&self) -> Vec<String> {
        self.state.lock().expect("fake poisoned").events.clone()
    }

    fn record(&self, event: String) {
        self.state.lock().expect("fake poisoned").events.push(event);
    }
}

impl ContainerRuntime for FakeRuntime {
    fn available(&self) -> SandboxResult<()> {
        match &self.state.lock().expect("fake poisoned").available {
            Some(message) => Err(SandboxError::RuntimeUnavailable(message.clone())),
            None => Ok(()),
        }
    }

    fn image_exists(&self, tag: &str) -> SandboxResult<bool> {
        Ok(self
            .state
            .lock()
            .expect("fake poisoned")
            .images
            .contains_key(tag))
    }

    fn build_image(&self, dir: &Path, tag: &str) -> SandboxResult<()> {
        let mut state = self.state.lock().expect("fake poisoned");
        if let Some(message) = &state.build_failure {
            return Err(SandboxError::Image(message.clone()));
        }
        *state.images.entry(tag.to_string()).or_insert(0) += 1;
        state.events.push(format!("build:{tag}:{}", dir.display()));
        Ok(())
    }

    fn container_exists(&self, name: &str) -> SandboxResult<bool> {
        Ok(self
            .state
            .lock()
            .expect("fake poisoned")
            .containers
            .contains_key(name))
    }

    fn create_container(&self, name: &str, tag: &str) -> SandboxResult<()> {
        self.state
            .lock()
            .expect("fake poisoned")
            .containers
            .insert(name.to_string(), FakeContainerState::Created);
        self.record(format!("create:{name}:{tag}"));
        Ok(())
    }

    fn start_container(&self, name: &str) -> SandboxResult<()> {
        self.state
            .lock()
            .expect("fake poisoned")
            .containers
            .insert(name.to_string(), FakeContainerState::Running);
        self.record(format!("start:{name}"));
        Ok(())
    }

    fn stop_container(&self, name: &str) -> SandboxResult<()> {
        self.state
            .lock()
            .expect("fake poisoned")
            .containers
            .insert(name.to_string(), FakeContainerState::Stopped);
        self.record(format!("stop:{name}"));
        Ok(())
    }

    fn remove_container(&self, name: &str) -> SandboxResult<()> {
        self.state
            .lock()
            .expect("fake poisoned")
            .containers
            .remove(name);
        self.record(format!("remove:{name}"));
        Ok(())
    }

    fn container_address(&self, name: &str) -> SandboxResult<String> {
        let _ = name;
        Ok("172.17.0.2".to_string())
    }
}

// ── assembled fleet ──────────────────────────────────────────────────────

/// Everything wired together: one fake platform (`plat`) covering the
/// given hosts, each declared with sandbox image `debian`.
pub struct FakeFleet {
    pub inventory: Arc<FakeInventory>,
    pub transport: Arc<FakeTransport>,
    pub runtime: Arc<FakeRuntime>,
    pub registry: Arc<SandboxRegistry>,
    pub deployer: Deployer,
}

impl FakeFleet {
    pub fn new(hosts: &[&str]) -> Self {
        let mut inventory =
            FakeInventory::new().with_platform(Arc::new(FakePlatform::new("plat")), hosts);
        for host in hosts {
            inventory = inventory.with_sandbox_image(host, "debian", "/tmp/images/debian");
        }
        Self::with_inventory(Arc::new(inventory))
    }

    pub fn with_inventory(inventory: Arc<FakeInventory>) -> Self {
        let transport = Arc::new(FakeTransport::new());
        let runtime = Arc::new(FakeRuntime::new());
        let registry = Arc::new(SandboxRegistry::new());
        let deployer = Deployer::new(
            inventory.clone(),
            transport.clone(),
            registry.clone(),
            runtime.clone(),
        );
        Self {
            inventory,
            transport,
            runtime,
            registry,
            deployer,
        }
    }

    pub fn platform(&self, name: &str) -> Arc<FakePlatform> {
        self.inventory
            .platform(name)
            .expect("platform not registered in fake fleet")
    }

    pub fn test_context(&self) -> TestContext {
        TestContext {
            inventory: self.inventory.clone(),
            deployer: self.deployer.clone(),
        }
    }
}

/// Ready-made [`TestContext`] over a single-platform fake fleet.
pub fn test_context(hosts: &[&str]) -> TestContext {
    FakeFleet::new(hosts).test_context()
}
