//! Scans captured check-node output for error lines.

use async_trait::async_trait;
use regex::Regex;

use crate::scheduler::plugin::{PhaseSet, TestContext, TestPlugin};
use crate::scheduler::test::Test;

pub struct DeployOutputErrors {
    error_line: Regex,
}

impl DeployOutputErrors {
    pub fn new() -> Self {
        Self {
            error_line: Regex::new(r"\b(ERROR|FATAL)\b").expect("hardcoded pattern"),
        }
    }
}

impl Default for DeployOutputErrors {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TestPlugin for DeployOutputErrors {
    fn name(&self) -> &str {
        "deploy_output_errors"
    }

    fn phases(&self) -> PhaseSet {
        PhaseSet::CHECK_NODE
    }

    async fn check_node(
        &self,
        _ctx: &TestContext,
        _host: &str,
        stdout: &str,
        stderr: &str,
        _exit_code: i32,
        test: &mut Test,
    ) -> anyhow::Result<()> {
        for line in stdout.lines().chain(stderr.lines()) {
            if self.error_line.is_match(line) {
                test.error(format!("error found in check-node output: {line}"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes;

    #[tokio::test]
    async fn test_error_lines_are_reported() {
        let ctx = fakes::test_context(&["n1"]);
        let plugin = DeployOutputErrors::new();
        let mut test = Test::for_host("deploy_output_errors", "plat", "n1");
        plugin
            .check_node(
                &ctx,
                "n1",
                "recipe applied\nERROR: missing package\nall good",
                "FATAL failure in template",
                0,
                &mut test,
            )
            .await
            .unwrap();
        assert_eq!(test.errors().len(), 2);
    }

    #[tokio::test]
    async fn test_clean_output_passes() {
        let ctx = fakes::test_context(&["n1"]);
        let plugin = DeployOutputErrors::new();
        let mut test = Test::for_host("deploy_output_errors", "plat", "n1");
        plugin
            .check_node(&ctx, "n1", "nothing to do\n", "", 0, &mut test)
            .await
            .unwrap();
        assert!(test.passed());
    }
}
