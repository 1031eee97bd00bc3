//! Conductor Core Library
//!
//! Deployment and test orchestration over a fleet of configuration
//! platforms: package/deliver/deploy pipeline, disposable container
//! sandboxes and a phased test scheduler.

pub mod config;
pub mod deployer;
pub mod error;
pub mod fakes;
pub mod inventory;
pub mod sandbox;
pub mod scheduler;
pub mod ssh;
pub mod telemetry;
pub mod transport;

pub use config::{FleetConfig, ShellPlatform, StaticInventory};

pub use deployer::Deployer;

pub use error::{ConductorError, Result};

pub use inventory::{Inventory, PlatformHandler, RepoInfo};

pub use sandbox::{ContainerRuntime, SandboxError, SandboxRegistry};

pub use scheduler::plugin::{
    CheckNodeOutcome, HostPattern, PhaseSet, RemoteCheck, TestContext, TestPlugin,
};
pub use scheduler::report::{ReportPlugin, RunContext};
pub use scheduler::test::{Test, TestScope};
pub use scheduler::TestScheduler;

pub use ssh::SshTransport;

pub use telemetry::init_tracing;

pub use transport::{
    HostAction, HostCallSpec, HostOutput, RemoteOptions, RemoteTransport, TransportFailure,
};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
