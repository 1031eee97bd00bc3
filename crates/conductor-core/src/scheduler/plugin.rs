//! Test plugin capability contract.
//!
//! A plugin is a stateless unit opting into zero or more of the five
//! execution phases through [`TestPlugin::phases`]; the scheduler checks
//! capabilities once at registration and never re-derives them. Eligibility
//! filtering is declared through platform-type and host allow-lists.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::deployer::Deployer;
use crate::inventory::{Inventory, PlatformHandler};
use crate::scheduler::test::Test;

/// Which of the five phase hooks a plugin implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseSet {
    pub global: bool,
    pub platform: bool,
    pub host: bool,
    pub remote: bool,
    pub check_node: bool,
}

impl PhaseSet {
    pub const GLOBAL: PhaseSet = PhaseSet {
        global: true,
        platform: false,
        host: false,
        remote: false,
        check_node: false,
    };
    pub const PLATFORM: PhaseSet = PhaseSet {
        global: false,
        platform: true,
        host: false,
        remote: false,
        check_node: false,
    };
    pub const HOST: PhaseSet = PhaseSet {
        global: false,
        platform: false,
        host: true,
        remote: false,
        check_node: false,
    };
    pub const REMOTE: PhaseSet = PhaseSet {
        global: false,
        platform: false,
        host: false,
        remote: true,
        check_node: false,
    };
    pub const CHECK_NODE: PhaseSet = PhaseSet {
        global: false,
        platform: false,
        host: false,
        remote: false,
        check_node: true,
    };
}

/// Host allow-list entry: an exact name or a pattern matched against it.
#[derive(Debug, Clone)]
pub enum HostPattern {
    Literal(String),
    Pattern(regex::Regex),
}

impl HostPattern {
    pub fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Literal(name) => name == host,
            HostPattern::Pattern(re) => re.is_match(host),
        }
    }
}

/// Validator invoked with a remote command's output lines (return-code line
/// stripped) and its parsed return code.
pub type RemoteValidator =
    Box<dyn Fn(&[String], i32, &mut Test) -> anyhow::Result<()> + Send + Sync>;

/// Default per-command timeout in the remote-batched phase.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// One remote command contributed to the host-remote-batched phase.
pub struct RemoteCheck {
    pub command: String,
    pub validator: RemoteValidator,
    pub timeout: Duration,
}

impl RemoteCheck {
    pub fn new(command: impl Into<String>, validator: RemoteValidator) -> Self {
        Self {
            command: command.into(),
            validator,
            timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Outcome of the shared check-node (why-run) pass for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckNodeOutcome {
    /// No log could be captured or read for the host.
    Missing,
    /// The check-node run itself failed with a transport marker.
    Failed(crate::transport::TransportFailure),
    /// Output was captured (exit status may still be nonzero).
    Captured {
        stdout: String,
        stderr: String,
        exit_code: i32,
    },
}

/// Run collaborators handed to every plugin hook.
#[derive(Clone)]
pub struct TestContext {
    pub inventory: Arc<dyn Inventory>,
    pub deployer: Deployer,
}

/// A validation plugin.
///
/// Hooks default to no-ops; a plugin must report the phases it implements
/// through [`phases`](TestPlugin::phases) for its hooks to be scheduled.
/// Hook faults are caught at the call site and recorded on the `Test`
/// instance, never propagated.
#[async_trait]
pub trait TestPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn phases(&self) -> PhaseSet;

    /// Platform types this plugin may run against. `None` means all.
    fn allowed_platform_types(&self) -> Option<Vec<String>> {
        None
    }

    /// Hosts this plugin may run against. `None` means unrestricted.
    fn allowed_hosts(&self) -> Option<Vec<HostPattern>> {
        None
    }

    /// Global phase: runs exactly once, unconditionally.
    async fn check_global(&self, ctx: &TestContext, test: &mut Test) -> anyhow::Result<()> {
        let _ = (ctx, test);
        Ok(())
    }

    /// Platform phase: runs once per eligible platform.
    async fn check_platform(
        &self,
        ctx: &TestContext,
        platform: &dyn PlatformHandler,
        test: &mut Test,
    ) -> anyhow::Result<()> {
        let _ = (ctx, platform, test);
        Ok(())
    }

    /// Host-direct phase: runs in-process, once per eligible host.
    async fn check_host(
        &self,
        ctx: &TestContext,
        host: &str,
        test: &mut Test,
    ) -> anyhow::Result<()> {
        let _ = (ctx, host, test);
        Ok(())
    }

    /// Host-remote-batched phase: contribute commands for one host.
    fn remote_checks(&self, ctx: &TestContext, host: &str) -> anyhow::Result<Vec<RemoteCheck>> {
        let _ = (ctx, host);
        Ok(Vec::new())
    }

    /// Check-node phase: inspect the shared why-run outcome for one host.
    /// Only invoked when output was captured.
    async fn check_node(
        &self,
        ctx: &TestContext,
        host: &str,
        stdout: &str,
        stderr: &str,
        exit_code: i32,
        test: &mut Test,
    ) -> anyhow::Result<()> {
        let _ = (ctx, host, stdout, stderr, exit_code, test);
        Ok(())
    }
}
