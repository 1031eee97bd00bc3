//! Checks that a full deployment succeeds on a pristine sandbox of the node.

use async_trait::async_trait;

use crate::scheduler::plugin::{PhaseSet, TestContext, TestPlugin};
use crate::scheduler::test::Test;
use crate::transport::HostOutput;

pub struct DeployFromScratch;

#[async_trait]
impl TestPlugin for DeployFromScratch {
    fn name(&self) -> &str {
        "deploy_from_scratch"
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
            .with_sandbox_for(host, "deploy_from_scratch", false, |deployer, _address| {
                async move {
                    let mut errors = Vec::new();
                    let results = deployer.deploy_for(&[host.to_string()]).await?;
                    if results.len() != 1 {
                        errors.push(format!(
                            "wrong number of nodes being deployed: {}",
                            results.len()
                        ));
                        return Ok(errors);
                    }
                    // results holds exactly one entry.
                    for (deployed, output) in results {
                        if deployed != host {
                            errors.push(format!(
                                "wrong node being deployed: {deployed} should be {host}"
                            ));
                        }
                        match output {
                            HostOutput::Failed(marker) => {
                                errors.push(format!(
                                    "deploy could not run because of error: {marker}"
                                ));
                            }
                            HostOutput::Success { exit_code, .. } if exit_code != 0 => {
                                errors.push(format!("deploy returned error code {exit_code}"));
                            }
                            HostOutput::Success { .. } => {}
                        }
                    }
                    Ok(errors)
                }
            })
            .await?;
        for error in errors {
            test.error(error);
        }
        Ok(())
    }
}
