//! Test scheduler: runs validation plugins over the fleet in five strictly
//! ordered phases and aggregates everything into one pass/fail verdict.
//!
//! Phase order: global → platform → host-direct → host-remote-batched →
//! check-node. Each phase fully completes before the next starts. Any fault
//! raised by a plugin hook or validator is caught at its call site and
//! recorded on the specific [`Test`] involved; no single plugin or host
//! failure aborts the run.

pub mod plugin;
pub mod plugins;
pub mod report;
pub mod test;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::deployer::Deployer;
use crate::error::{ConductorError, Result};
use crate::inventory::{Inventory, PlatformHandler};
use crate::scheduler::plugin::{CheckNodeOutcome, RemoteValidator, TestContext, TestPlugin};
use crate::scheduler::report::{ReportPlugin, RunContext};
use crate::scheduler::test::Test;
use crate::transport::{HostAction, HostCallSpec, HostOutput, RemoteOptions, RemoteTransport};

/// Fixed connection overhead added to every remote test batch timeout.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(20);

/// Timeout of the shared check-node why-run pass.
const CHECK_NODE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Marker line separating command outputs in a remote test batch.
pub const CMD_SEPARATOR: &str =
    "===== TEST COMMAND EXECUTION ===== separator generated by the conductor test scheduler =====";

/// Sentinel expanding to every registered test/report name.
const ALL: &str = "all";

/// Discovers plugins, resolves requested work and drives the five phases.
pub struct TestScheduler {
    inventory: Arc<dyn Inventory>,
    transport: Arc<dyn RemoteTransport>,
    deployer: Deployer,
    plugins: BTreeMap<String, Arc<dyn TestPlugin>>,
    reports: BTreeMap<String, Arc<dyn ReportPlugin>>,

    /// Requested test names; empty or "all" selects every registered test.
    pub requested_tests: Vec<String>,
    /// Requested report names; empty defaults to the stdout report.
    pub requested_reports: Vec<String>,
    /// Skip the check-node why-run and analyse previously captured logs.
    pub skip_run: bool,
    /// Directory read in skip-run mode (`<dir>/<host>.stdout`).
    pub run_logs_dir: PathBuf,
}

impl std::fmt::Debug for TestScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestScheduler")
            .field("plugins", &self.plugins.keys())
            .field("reports", &self.reports.keys())
            .field("requested_tests", &self.requested_tests)
            .field("requested_reports", &self.requested_reports)
            .field("skip_run", &self.skip_run)
            .field("run_logs_dir", &self.run_logs_dir)
            .finish_non_exhaustive()
    }
}

impl TestScheduler {
    /// Scheduler with the built-in plugins plus every plugin contributed by
    /// a platform type known to the inventory.
    pub fn new(deployer: Deployer) -> Result<Self> {
        let mut scheduler = Self::with_reports(deployer)?;
        for plugin in plugins::builtin_plugins() {
            scheduler.register_plugin(plugin)?;
        }
        scheduler.merge_contributed()?;
        Ok(scheduler)
    }

    /// Scheduler without built-in test plugins (platform-contributed ones
    /// are still merged in). The built-in reports are always registered.
    pub fn bare(deployer: Deployer) -> Result<Self> {
        let mut scheduler = Self::with_reports(deployer)?;
        scheduler.merge_contributed()?;
        Ok(scheduler)
    }

    fn with_reports(deployer: Deployer) -> Result<Self> {
        let inventory = deployer.inventory().clone();
        let transport = deployer.transport().clone();
        let mut scheduler = Self {
            inventory,
            transport,
            deployer,
            plugins: BTreeMap::new(),
            reports: BTreeMap::new(),
            requested_tests: Vec::new(),
            requested_reports: Vec::new(),
            skip_run: false,
            run_logs_dir: PathBuf::from("./run_logs"),
        };
        scheduler.register_report(Arc::new(report::StdoutReport))?;
        scheduler.register_report(Arc::new(report::JsonReport::default()))?;
        Ok(scheduler)
    }

    /// Merge plugins contributed by platform types. Contributed plugins are
    /// merged after any already-registered plugin, so a collision names the
    /// offending platform type.
    fn merge_contributed(&mut self) -> Result<()> {
        for platform_type in self.inventory.platform_types() {
            for plugin in self.inventory.contributed_tests(&platform_type) {
                let name = plugin.name().to_string();
                if self.plugins.contains_key(&name) {
                    return Err(ConductorError::DuplicatePlugin {
                        name,
                        platform_type,
                    });
                }
                self.plugins.insert(name, plugin);
            }
        }
        Ok(())
    }

    pub fn register_plugin(&mut self, plugin: Arc<dyn TestPlugin>) -> Result<()> {
        let name = plugin.name().to_string();
        if self.plugins.contains_key(&name) {
            return Err(ConductorError::Configuration(format!(
                "test plugin {name} is already registered"
            )));
        }
        self.plugins.insert(name, plugin);
        Ok(())
    }

    pub fn register_report(&mut self, plugin: Arc<dyn ReportPlugin>) -> Result<()> {
        let name = plugin.name().to_string();
        if self.reports.contains_key(&name) {
            return Err(ConductorError::Configuration(format!(
                "report plugin {name} is already registered"
            )));
        }
        self.reports.insert(name, plugin);
        Ok(())
    }

    pub fn test_names(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }

    pub fn report_names(&self) -> Vec<String> {
        self.reports.keys().cloned().collect()
    }

    /// Run the requested tests against the hosts resolved from
    /// `descriptors` and emit the requested reports.
    ///
    /// Returns the process exit status: 0 when no executed test produced
    /// errors, 1 otherwise.
    pub async fn run_tests(&self, descriptors: &[String]) -> Result<i32> {
        let test_names = self.resolve_test_names()?;
        let report_names = self.resolve_report_names()?;

        let hosts = if descriptors.is_empty() {
            Vec::new()
        } else {
            let mut hosts = self.inventory.resolve_hosts(descriptors)?;
            hosts.sort();
            hosts.dedup();
            hosts
        };

        let ctx = TestContext {
            inventory: self.inventory.clone(),
            deployer: self.deployer.clone(),
        };

        let mut tests_run = Vec::new();
        let mut tested_platforms = BTreeSet::new();

        self.run_global_phase(&test_names, &ctx, &mut tests_run).await;
        self.run_platform_phase(&test_names, &ctx, &mut tests_run, &mut tested_platforms)
            .await;
        self.run_host_direct_phase(&test_names, &hosts, &ctx, &mut tests_run)
            .await?;
        self.run_remote_phase(&test_names, &hosts, &ctx, &mut tests_run)
            .await?;
        self.run_check_node_phase(&test_names, &hosts, &ctx, &mut tests_run)
            .await?;

        let run_ctx = RunContext {
            hosts,
            platforms: tested_platforms.into_iter().collect(),
        };
        for name in &report_names {
            if let Some(report) = self.reports.get(name) {
                if let Err(e) = report.report(&run_ctx, &tests_run) {
                    error!(report = %name, error = format!("{e:#}"), "report plugin failed");
                }
            }
        }

        let failed = tests_run.iter().any(|t| t.executed() && !t.passed());
        Ok(i32::from(failed))
    }

    fn resolve_test_names(&self) -> Result<Vec<String>> {
        let mut names = self.requested_tests.clone();
        if names.is_empty() || names.iter().any(|n| n == ALL) {
            return Ok(self.test_names());
        }
        names.sort();
        names.dedup();
        let unknown: Vec<String> = names
            .iter()
            .filter(|n| !self.plugins.contains_key(*n))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(ConductorError::UnknownTests(unknown.join(", ")));
        }
        Ok(names)
    }

    fn resolve_report_names(&self) -> Result<Vec<String>> {
        let mut names = self.requested_reports.clone();
        if names.is_empty() {
            return Ok(vec!["stdout".to_string()]);
        }
        if names.iter().any(|n| n == ALL) {
            return Ok(self.report_names());
        }
        names.sort();
        names.dedup();
        let unknown: Vec<String> = names
            .iter()
            .filter(|n| !self.reports.contains_key(*n))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(ConductorError::UnknownReports(unknown.join(", ")));
        }
        Ok(names)
    }

    /// Shared eligibility predicate: platform-type allow-list, plus the
    /// host allow-list for host-scoped work.
    fn eligible(
        &self,
        plugin: &dyn TestPlugin,
        platform: &dyn PlatformHandler,
        host: Option<&str>,
    ) -> bool {
        if let Some(types) = plugin.allowed_platform_types() {
            if !types.iter().any(|t| t == platform.platform_type()) {
                return false;
            }
        }
        match host {
            None => true,
            Some(host) => match plugin.allowed_hosts() {
                None => true,
                Some(patterns) => patterns.iter().any(|p| p.matches(host)),
            },
        }
    }

    async fn run_global_phase(
        &self,
        test_names: &[String],
        ctx: &TestContext,
        tests_run: &mut Vec<Test>,
    ) {
        for name in test_names {
            let Some(plugin) = self.plugins.get(name) else {
                continue;
            };
            if !plugin.phases().global {
                continue;
            }
            info!(test = %name, "running global test");
            let mut test = Test::global(name.clone());
            if let Err(e) = plugin.check_global(ctx, &mut test).await {
                test.error(format!("uncaught fault during test: {e:#}"));
            }
            test.mark_executed();
            tests_run.push(test);
        }
    }

    async fn run_platform_phase(
        &self,
        test_names: &[String],
        ctx: &TestContext,
        tests_run: &mut Vec<Test>,
        tested_platforms: &mut BTreeSet<String>,
    ) {
        for name in test_names {
            let Some(plugin) = self.plugins.get(name) else {
                continue;
            };
            if !plugin.phases().platform {
                continue;
            }
            for platform in self.inventory.platforms() {
                tested_platforms.insert(platform.name().to_string());
                if !self.eligible(plugin.as_ref(), platform.as_ref(), None) {
                    continue;
                }
                info!(test = %name, platform = %platform.name(), "running platform test");
                let mut test = Test::for_platform(name.clone(), platform.name());
                if let Err(e) = plugin.check_platform(ctx, platform.as_ref(), &mut test).await {
                    test.error(format!("uncaught fault during test: {e:#}"));
                }
                test.mark_executed();
                tests_run.push(test);
            }
        }
    }

    async fn run_host_direct_phase(
        &self,
        test_names: &[String],
        hosts: &[String],
        ctx: &TestContext,
        tests_run: &mut Vec<Test>,
    ) -> Result<()> {
        for host in hosts {
            for name in test_names {
                let Some(plugin) = self.plugins.get(name) else {
                    continue;
                };
                if !plugin.phases().host {
                    continue;
                }
                let platform = self.inventory.platform_for(host)?;
                if !self.eligible(plugin.as_ref(), platform.as_ref(), Some(host)) {
                    continue;
                }
                info!(test = %name, host = %host, "running host test");
                let mut test = Test::for_host(name.clone(), platform.name(), host.clone());
                if let Err(e) = plugin.check_host(ctx, host, &mut test).await {
                    test.error(format!("uncaught fault during test: {e:#}"));
                }
                test.mark_executed();
                tests_run.push(test);
            }
        }
        Ok(())
    }

    async fn run_remote_phase(
        &self,
        test_names: &[String],
        hosts: &[String],
        ctx: &TestContext,
        tests_run: &mut Vec<Test>,
    ) -> Result<()> {
        struct PendingCheck {
            test_idx: usize,
            command: String,
            validator: RemoteValidator,
            timeout: Duration,
        }

        // Gather the commands to run per host, remembering which test each
        // one belongs to.
        let mut per_host: BTreeMap<String, Vec<PendingCheck>> = BTreeMap::new();
        for host in hosts {
            for name in test_names {
                let Some(plugin) = self.plugins.get(name) else {
                    continue;
                };
                if !plugin.phases().remote {
                    continue;
                }
                let platform = self.inventory.platform_for(host)?;
                if !self.eligible(plugin.as_ref(), platform.as_ref(), Some(host)) {
                    continue;
                }
                let mut test = Test::for_host(name.clone(), platform.name(), host.clone());
                match plugin.remote_checks(ctx, host) {
                    Ok(checks) => {
                        tests_run.push(test);
                        let test_idx = tests_run.len() - 1;
                        for check in checks {
                            per_host.entry(host.clone()).or_default().push(PendingCheck {
                                test_idx,
                                command: check.command,
                                validator: check.validator,
                                timeout: check.timeout,
                            });
                        }
                    }
                    Err(e) => {
                        test.error(format!("uncaught fault during test preparation: {e:#}"));
                        test.mark_executed();
                        tests_run.push(test);
                    }
                }
            }
        }
        if per_host.is_empty() {
            return Ok(());
        }

        // Batch timeout: fixed connection overhead plus the largest
        // per-host sum of command timeouts.
        let max_sum = per_host
            .values()
            .map(|checks| checks.iter().map(|c| c.timeout).sum::<Duration>())
            .max()
            .unwrap_or_default();
        let timeout = CONNECTION_TIMEOUT + max_sum;

        let calls: BTreeMap<String, HostCallSpec> = per_host
            .iter()
            .map(|(host, checks)| {
                let mut bash = Vec::new();
                for check in checks {
                    bash.push(format!("echo '{CMD_SEPARATOR}'"));
                    bash.push(check.command.clone());
                    bash.push("echo \"$?\"".to_string());
                }
                (
                    host.clone(),
                    HostCallSpec {
                        env: BTreeMap::new(),
                        actions: vec![HostAction {
                            scp: BTreeMap::new(),
                            bash,
                        }],
                    },
                )
            })
            .collect();

        info!(
            hosts = per_host.len(),
            timeout_secs = timeout.as_secs(),
            "running batched remote tests"
        );
        let outputs = self
            .transport
            .run_on_hosts(
                calls,
                &RemoteOptions {
                    timeout: Some(timeout),
                    concurrent: !self.transport.debug(),
                    log_to_stdout: self.transport.debug(),
                    log_to_dir: None,
                },
            )
            .await;

        let separator = format!("{CMD_SEPARATOR}\n");
        for (host, output) in outputs {
            let Some(checks) = per_host.get(&host) else {
                continue;
            };
            match output {
                HostOutput::Failed(marker) => {
                    self.record_run_error(
                        tests_run,
                        &host,
                        format!("error while executing remote test commands: {marker}"),
                    );
                }
                HostOutput::Success { stdout, .. } => {
                    // The segment before the first marker may contain
                    // connection banners; discard it.
                    let segments: Vec<&str> = stdout.split(&separator).skip(1).collect();
                    let mut touched = BTreeSet::new();
                    for (idx, check) in checks.iter().enumerate() {
                        touched.insert(check.test_idx);
                        let test = &mut tests_run[check.test_idx];
                        let Some(segment) = segments.get(idx) else {
                            test.error(format!(
                                "missing output segment for command: {}",
                                check.command
                            ));
                            continue;
                        };
                        let lines: Vec<String> =
                            segment.lines().map(str::to_string).collect();
                        let Some(code) =
                            lines.last().and_then(|l| l.trim().parse::<i32>().ok())
                        else {
                            test.error(format!(
                                "could not parse return code from output of command: {}",
                                check.command
                            ));
                            continue;
                        };
                        if code != 0 {
                            test.error(format!(
                                "command '{}' returned error code {code}",
                                check.command
                            ));
                        }
                        let body = &lines[..lines.len() - 1];
                        if let Err(e) = (check.validator)(body, code, test) {
                            test.error(format!("uncaught fault during validation: {e:#}"));
                        }
                    }
                    for idx in touched {
                        tests_run[idx].mark_executed();
                    }
                }
            }
        }
        Ok(())
    }

    async fn run_check_node_phase(
        &self,
        test_names: &[String],
        hosts: &[String],
        ctx: &TestContext,
        tests_run: &mut Vec<Test>,
    ) -> Result<()> {
        let involved: Vec<&String> = test_names
            .iter()
            .filter(|name| {
                self.plugins
                    .get(*name)
                    .is_some_and(|p| p.phases().check_node)
            })
            .collect();
        if involved.is_empty() || hosts.is_empty() {
            return Ok(());
        }

        info!(tests = involved.len(), skip_run = self.skip_run, "running check-node tests");
        let outcomes: BTreeMap<String, CheckNodeOutcome> = if self.skip_run {
            // Analyse previously captured logs; stderr and exit status are
            // unavailable in this mode.
            hosts
                .iter()
                .map(|host| {
                    let path = self.run_logs_dir.join(format!("{host}.stdout"));
                    let outcome = match std::fs::read_to_string(&path) {
                        Ok(stdout) => CheckNodeOutcome::Captured {
                            stdout,
                            stderr: String::new(),
                            exit_code: 0,
                        },
                        Err(_) => CheckNodeOutcome::Missing,
                    };
                    (host.clone(), outcome)
                })
                .collect()
        } else {
            // One shared why-run deployment pass covering all target hosts.
            let mut check = self.deployer.clone();
            check.use_why_run = true;
            check.concurrent_execution = true;
            check.timeout = Some(CHECK_NODE_TIMEOUT);
            check
                .deploy_for(hosts)
                .await?
                .into_iter()
                .map(|(host, output)| {
                    let outcome = match output {
                        HostOutput::Success {
                            exit_code,
                            stdout,
                            stderr,
                        } => CheckNodeOutcome::Captured {
                            stdout,
                            stderr,
                            exit_code,
                        },
                        HostOutput::Failed(marker) => CheckNodeOutcome::Failed(marker),
                    };
                    (host, outcome)
                })
                .collect()
        };

        for (host, outcome) in &outcomes {
            let platform = self.inventory.platform_for(host)?;
            for name in &involved {
                let Some(plugin) = self.plugins.get(*name) else {
                    continue;
                };
                if !self.eligible(plugin.as_ref(), platform.as_ref(), Some(host)) {
                    continue;
                }
                let mut test = Test::for_host((*name).clone(), platform.name(), host.clone());
                match outcome {
                    CheckNodeOutcome::Missing => {
                        test.error("no check-node log found despite the run of check-node");
                    }
                    CheckNodeOutcome::Failed(marker) => {
                        test.error(format!("check-node run failed: {marker}"));
                    }
                    CheckNodeOutcome::Captured {
                        stdout,
                        stderr,
                        exit_code,
                    } => {
                        if *exit_code != 0 {
                            test.error(format!("check-node returned error code {exit_code}"));
                        }
                        if let Err(e) = plugin
                            .check_node(ctx, host, stdout, stderr, *exit_code, &mut test)
                            .await
                        {
                            test.error(format!("uncaught fault during test: {e:#}"));
                        }
                    }
                }
                test.mark_executed();
                tests_run.push(test);
            }
        }
        Ok(())
    }

    /// Record a transport-level failure as an executed error test
    /// attributed to the host.
    fn record_run_error(&self, tests_run: &mut Vec<Test>, host: &str, message: String) {
        let platform = self
            .inventory
            .platform_for(host)
            .map(|p| p.name().to_string())
            .unwrap_or_default();
        let mut test = Test::for_host("global", platform, host);
        test.error(message);
        test.mark_executed();
        tests_run.push(test);
    }
}
