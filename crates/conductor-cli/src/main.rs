//! Fleet conductor CLI.
//!
//! The `conductor` command drives deployments and fleet validation from a
//! JSON fleet configuration.
//!
//! ## Commands
//!
//! - `deploy`: package, deliver and deploy platforms on target hosts
//! - `check`: why-run deployment, reporting pending changes only
//! - `test`: run the phased test scheduler and emit reports

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;

use conductor_core::sandbox::docker::DockerCli;
use conductor_core::{
    Deployer, FleetConfig, HostOutput, SandboxRegistry, SshTransport, TestScheduler,
};

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Fleet deployment and test orchestration", long_about = None)]
struct Cli {
    /// Fleet configuration file
    #[arg(long, global = true, default_value = "fleet.json")]
    config: PathBuf,

    /// User the transport authenticates as on the remote hosts
    #[arg(long, global = true, env = "CONDUCTOR_REMOTE_USER", default_value = "admin")]
    user: String,

    /// Print remote actions instead of executing them
    #[arg(long, global = true)]
    dry_run: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy platforms on target hosts
    Deploy {
        /// Host descriptor (host name, platform name or "all"); repeatable
        #[arg(short = 'H', long = "host", required = true)]
        hosts: Vec<String>,

        /// JSON secrets file registered into the platforms; repeatable
        #[arg(long = "secrets")]
        secrets: Vec<PathBuf>,

        /// Fan out across hosts in parallel with captured output
        #[arg(long)]
        parallel: bool,

        /// Skip artefact delivery and deploy straight from the package
        #[arg(long)]
        force_direct: bool,

        /// Allow deploying from a branch other than the primary one
        #[arg(long)]
        allow_non_primary_branch: bool,
    },

    /// Why-run a deployment, reporting what it would change
    Check {
        /// Host descriptor; repeatable
        #[arg(short = 'H', long = "host", required = true)]
        hosts: Vec<String>,

        /// Timeout in seconds for the whole check
        #[arg(long)]
        timeout: Option<u64>,

        /// Fan out across hosts in parallel with captured output
        #[arg(long)]
        parallel: bool,
    },

    /// Run validation tests over the fleet
    Test {
        /// Host descriptor; repeatable (omit to run only global and
        /// platform tests)
        #[arg(short = 'H', long = "host")]
        hosts: Vec<String>,

        /// Test name to run; repeatable ("all" or omit for every test)
        #[arg(short, long = "test")]
        tests: Vec<String>,

        /// Report to emit; repeatable (default: stdout)
        #[arg(short, long = "report")]
        reports: Vec<String>,

        /// Analyse previously captured check-node logs instead of
        /// running check-node
        #[arg(long)]
        skip_run: bool,

        /// Directory of captured logs used with --skip-run
        #[arg(long, default_value = "./run_logs")]
        run_logs_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    conductor_core::init_tracing(cli.json, level);

    let config = FleetConfig::load(&cli.config)
        .with_context(|| format!("Failed to load fleet config {}", cli.config.display()))?;
    let inventory = Arc::new(config.into_inventory()?);
    let transport = Arc::new(
        SshTransport::new(cli.user.clone())
            .with_dry_run(cli.dry_run)
            .with_debug(cli.verbose),
    );
    let deployer = Deployer::new(
        inventory,
        transport,
        Arc::new(SandboxRegistry::new()),
        Arc::new(DockerCli::new()),
    );

    let exit_code = match cli.command {
        Commands::Deploy {
            hosts,
            secrets,
            parallel,
            force_direct,
            allow_non_primary_branch,
        } => {
            let mut deployer = deployer;
            deployer.secrets = secrets;
            deployer.concurrent_execution = parallel;
            deployer.force_direct_deploy = force_direct;
            deployer.allow_non_primary_branch = allow_non_primary_branch;
            cmd_deploy(deployer, &hosts).await?
        }
        Commands::Check {
            hosts,
            timeout,
            parallel,
        } => {
            let mut deployer = deployer;
            deployer.use_why_run = true;
            deployer.timeout = timeout.map(std::time::Duration::from_secs);
            deployer.concurrent_execution = parallel;
            cmd_deploy(deployer, &hosts).await?
        }
        Commands::Test {
            hosts,
            tests,
            reports,
            skip_run,
            run_logs_dir,
        } => {
            let mut scheduler = TestScheduler::new(deployer)?;
            scheduler.requested_tests = tests;
            scheduler.requested_reports = reports;
            scheduler.skip_run = skip_run;
            scheduler.run_logs_dir = run_logs_dir;
            scheduler.run_tests(&hosts).await?
        }
    };
    std::process::exit(exit_code);
}

async fn cmd_deploy(deployer: Deployer, hosts: &[String]) -> Result<i32> {
    deployer.validate()?;
    let results = deployer.deploy_for(hosts).await?;

    let mut failed = false;
    for (host, output) in &results {
        match output {
            HostOutput::Success { exit_code: 0, .. } => println!("{host}: OK"),
            HostOutput::Success { exit_code, .. } => {
                failed = true;
                println!("{host}: FAILED (exit code {exit_code})");
            }
            HostOutput::Failed(marker) => {
                failed = true;
                println!("{host}: FAILED ({marker})");
            }
        }
    }
    Ok(i32::from(failed))
}
