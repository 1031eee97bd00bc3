//! Checks that the hostname reported by the node matches its declared name.

use async_trait::async_trait;

use crate::scheduler::plugin::{PhaseSet, RemoteCheck, TestContext, TestPlugin};

pub struct Hostname;

#[async_trait]
impl TestPlugin for Hostname {
    fn name(&self) -> &str {
        "hostname"
    }

    fn phases(&self) -> PhaseSet {
        PhaseSet::REMOTE
    }

    fn remote_checks(&self, _ctx: &TestContext, host: &str) -> anyhow::Result<Vec<RemoteCheck>> {
        let expected = host.to_string();
        Ok(vec![RemoteCheck::new(
            "echo \"$(hostname)\"",
            Box::new(move |stdout, _exit_code, test| {
                let actual = stdout.first().map(|l| l.trim()).unwrap_or_default();
                if actual != expected {
                    test.error(format!(
                        "hostname of node {expected} is reported as {actual}"
                    ));
                }
                Ok(())
            }),
        )])
    }
}
