//! SSH-backed [`RemoteTransport`] shelling out to the `ssh`/`scp` CLIs.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::transport::{
    HostCallSpec, HostOutput, RemoteOptions, RemoteTransport, TransportFailure,
};

/// Routes each host's actions through one ssh session (plus one scp run
/// per transferred file). Hosts are reached by name unless an address
/// override was installed through [`rebind`](RemoteTransport::rebind).
#[derive(Debug, Clone)]
pub struct SshTransport {
    user: String,
    dry_run: bool,
    debug: bool,
    addresses: BTreeMap<String, String>,
}

impl SshTransport {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            dry_run: false,
            debug: false,
            addresses: BTreeMap::new(),
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    fn address_of<'a>(&'a self, host: &'a str) -> &'a str {
        self.addresses.get(host).map(String::as_str).unwrap_or(host)
    }

    /// Shell script equivalent of a call spec, minus the file transfers.
    fn script_for(spec: &HostCallSpec) -> String {
        let mut lines = Vec::new();
        for (key, value) in &spec.env {
            lines.push(format!("export {key}='{value}'"));
        }
        for action in &spec.actions {
            lines.extend(action.bash.iter().cloned());
        }
        lines.join("\n")
    }

    async fn run_on_host(&self, host: &str, spec: &HostCallSpec) -> HostOutput {
        let address = self.address_of(host);
        let target = format!("{}@{}", self.user, address);

        for action in &spec.actions {
            for (source, destination) in &action.scp {
                let result = Command::new("scp")
                    .arg("-o")
                    .arg("StrictHostKeyChecking=no")
                    .arg(source)
                    .arg(format!("{target}:{destination}"))
                    .stdin(Stdio::null())
                    .output()
                    .await;
                match result {
                    Ok(output) if output.status.success() => {}
                    Ok(output) => {
                        warn!(
                            host = %host,
                            source = %source,
                            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                            "scp failed"
                        );
                        return HostOutput::Failed(TransportFailure::ConnectionError);
                    }
                    Err(e) => {
                        warn!(host = %host, error = %e, "cannot spawn scp");
                        return HostOutput::Failed(TransportFailure::TransportError);
                    }
                }
            }
        }

        let script = Self::script_for(spec);
        debug!(host = %host, target = %target, "running remote script");
        let result = Command::new("ssh")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg(&target)
            .arg("/bin/bash")
            .arg("-c")
            .arg(&script)
            .stdin(Stdio::null())
            .output()
            .await;
        match result {
            Ok(output) => HostOutput::Success {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Err(e) => {
                warn!(host = %host, error = %e, "cannot spawn ssh");
                HostOutput::Failed(TransportFailure::TransportError)
            }
        }
    }

    fn persist(host: &str, output: &HostOutput, dir: &std::path::Path) {
        if let HostOutput::Success { stdout, .. } = output {
            let path = dir.join(format!("{host}.stdout"));
            if let Err(e) =
                std::fs::create_dir_all(dir).and_then(|()| std::fs::write(&path, stdout))
            {
                warn!(host = %host, path = %path.display(), error = %e, "cannot persist run log");
            }
        }
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn run_on_hosts(
        &self,
        calls: BTreeMap<String, HostCallSpec>,
        options: &RemoteOptions,
    ) -> BTreeMap<String, HostOutput> {
        if self.dry_run {
            // Print what would run, mark every host as skipped.
            for (host, spec) in &calls {
                println!("---- {host} ----");
                println!("{}", Self::script_for(spec));
            }
            return calls
                .keys()
                .map(|host| (host.clone(), HostOutput::Failed(TransportFailure::DryRunSkipped)))
                .collect();
        }

        let run_all = async {
            if options.concurrent {
                let futures: Vec<_> = calls
                    .iter()
                    .map(|(host, spec)| async move {
                        (host.clone(), self.run_on_host(host, spec).await)
                    })
                    .collect();
                join_all(futures).await.into_iter().collect()
            } else {
                let mut outputs = BTreeMap::new();
                for (host, spec) in &calls {
                    let output = self.run_on_host(host, spec).await;
                    if options.log_to_stdout {
                        if let HostOutput::Success { stdout, stderr, .. } = &output {
                            print!("{stdout}");
                            eprint!("{stderr}");
                        }
                    }
                    outputs.insert(host.clone(), output);
                }
                outputs
            }
        };

        let mut outputs: BTreeMap<String, HostOutput> = match options.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, run_all).await {
                Ok(outputs) => outputs,
                Err(_) => calls
                    .keys()
                    .map(|host| (host.clone(), HostOutput::Failed(TransportFailure::Timeout)))
                    .collect(),
            },
            None => run_all.await,
        };

        if let Some(dir) = &options.log_to_dir {
            for (host, output) in &outputs {
                Self::persist(host, output, dir);
            }
        }

        // One entry per input host, whatever happened.
        for host in calls.keys() {
            outputs
                .entry(host.clone())
                .or_insert(HostOutput::Failed(TransportFailure::TransportError));
        }
        outputs
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
        let mut rebound = self.clone();
        rebound.user = user.to_string();
        rebound
            .addresses
            .insert(host.to_string(), address.to_string());
        Arc::new(rebound)
    }
}
