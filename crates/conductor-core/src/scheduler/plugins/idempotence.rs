//! Checks that a why-run pass right after a deployment reports no pending
//! change.

use async_trait::async_trait;

use crate::scheduler::plugin::{PhaseSet, TestContext, TestPlugin};
use crate::scheduler::test::Test;
use crate::transport::HostOutput;

pub struct Idempotence;

#[async_trait]
impl TestPlugin for Idempotence {
    fn name(&self) -> &str {
        "idempotence"
    }

    fn phases(&self) -> PhaseSet {
        PhaseSet::HOST
    }

    async fn check_host(
        &self,
        ctx: &TestContext,
        host: &str,
        test: &mut Test,
    ) -> anyhow::Result<()> {
        let errors = ctx
            .deployer
            .with_sandbox_for(host, "idempotence", false, |deployer, _address| async move {
                let mut errors = Vec::new();
                deployer.deploy_for(&[host.to_string()]).await?;

                let mut check = deployer.clone();
                check.use_why_run = true;
                let results = check.deploy_for(&[host.to_string()]).await?;
                if results.len() != 1 {
                    errors.push(format!(
                        "wrong number of nodes being tested: {}",
                        results.len()
                    ));
                    return Ok(errors);
                }
                for (tested, output) in results {
                    if tested != host {
                        errors.push(format!(
                            "wrong node being tested: {tested} should be {host}"
                        ));
                    }
                    match output {
                        HostOutput::Failed(marker) => {
                            errors.push(format!(
                                "check-node could not run because of error: {marker}"
                            ));
                        }
                        HostOutput::Success { exit_code, .. } if exit_code != 0 => {
                            errors.push(format!("check-node returned error code {exit_code}"));
                        }
                        HostOutput::Success { .. } => {}
                    }
                }
                Ok(errors)
            })
            .await?;
        for error in errors {
            test.error(error);
        }
        Ok(())
    }
}
