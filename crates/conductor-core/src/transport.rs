//! Remote transport contract.
//!
//! The pipeline never opens connections itself; it batches per-host action
//! lists and hands them to a [`RemoteTransport`] implementation. A transport
//! failure for one host must surface as that host's [`HostOutput::Failed`]
//! entry and never abort the other hosts of the batch.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One remote action: file transfers followed by shell commands.
///
/// `scp` maps local source paths to remote destinations; `bash` lines are
/// executed in order after the transfers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAction {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scp: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bash: Vec<String>,
}

impl HostAction {
    /// Action made of shell commands only.
    pub fn bash<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scp: BTreeMap::new(),
            bash: lines.into_iter().map(Into::into).collect(),
        }
    }
}

/// Everything to run on a single host during one batched call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCallSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    pub actions: Vec<HostAction>,
}

/// Error markers a transport may return instead of captured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportFailure {
    ConnectionError,
    Timeout,
    TransportError,
    DryRunSkipped,
}

impl std::fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportFailure::ConnectionError => "connection_error",
            TransportFailure::Timeout => "timeout",
            TransportFailure::TransportError => "transport_error",
            TransportFailure::DryRunSkipped => "dry_run_skipped",
        };
        f.write_str(name)
    }
}

/// Per-host outcome of a batched transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostOutput {
    /// Commands ran; output and exit status were captured.
    Success {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    /// The host could not be driven; the marker says why.
    Failed(TransportFailure),
}

impl HostOutput {
    pub fn is_success(&self) -> bool {
        matches!(self, HostOutput::Success { .. })
    }

    /// Exit code, if output was captured.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            HostOutput::Success { exit_code, .. } => Some(*exit_code),
            HostOutput::Failed(_) => None,
        }
    }
}

/// Controls for one batched transport call.
#[derive(Debug, Clone, Default)]
pub struct RemoteOptions {
    /// Overall timeout for the batch; exceeding it yields `Failed(Timeout)`
    /// markers, never a raised error.
    pub timeout: Option<Duration>,
    /// Fan out one worker per host and capture output, instead of running
    /// hosts sequentially with streamed output.
    pub concurrent: bool,
    /// Stream captured output to stdout as it arrives (sequential mode).
    pub log_to_stdout: bool,
    /// Mirror per-host output into `<dir>/<host>.stdout` files.
    pub log_to_dir: Option<PathBuf>,
}

/// Executes batched actions on remote hosts.
///
/// Implementations decide how connections are opened (ssh, container exec,
/// in-memory fake). The contract is purely per-host: one entry in, one
/// [`HostOutput`] out, failures isolated per host.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Run each host's action list, honouring `options`.
    ///
    /// Must return exactly one entry per input host.
    async fn run_on_hosts(
        &self,
        calls: BTreeMap<String, HostCallSpec>,
        options: &RemoteOptions,
    ) -> BTreeMap<String, HostOutput>;

    /// User name the transport authenticates as on the remote side.
    fn remote_user(&self) -> String;

    /// Transport-level dry run: actions are printed, never executed.
    fn dry_run(&self) -> bool {
        false
    }

    /// Debug mode: stream output, keep execution sequential.
    fn debug(&self) -> bool {
        false
    }

    /// Derive a transport that routes `host`'s traffic to `address`,
    /// authenticating as `user`. Used to redirect a host into its sandbox
    /// container.
    fn rebind(&self, host: &str, address: &str, user: &str) -> Arc<dyn RemoteTransport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_marker_display() {
        assert_eq!(TransportFailure::ConnectionError.to_string(), "connection_error");
        assert_eq!(TransportFailure::Timeout.to_string(), "timeout");
        assert_eq!(TransportFailure::DryRunSkipped.to_string(), "dry_run_skipped");
    }

    #[test]
    fn test_host_output_accessors() {
        let ok = HostOutput::Success {
            exit_code: 0,
            stdout: "out".into(),
            stderr: String::new(),
        };
        assert!(ok.is_success());
        assert_eq!(ok.exit_code(), Some(0));

        let failed = HostOutput::Failed(TransportFailure::Timeout);
        assert!(!failed.is_success());
        assert_eq!(failed.exit_code(), None);
    }

    #[test]
    fn test_host_call_spec_serde_roundtrip() {
        let mut env = BTreeMap::new();
        env.insert("conductor_node".to_string(), "n1".to_string());
        let spec = HostCallSpec {
            env,
            actions: vec![HostAction::bash(["echo hello"])],
        };
        let json = serde_json::to_string(&spec).unwrap();
        let back: HostCallSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, back);
    }
}
