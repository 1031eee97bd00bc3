//! Checks that every registered platform repository exists on disk.

use async_trait::async_trait;

use crate::scheduler::plugin::{PhaseSet, TestContext, TestPlugin};
use crate::scheduler::test::Test;

pub struct PlatformRepositories;

#[async_trait]
impl TestPlugin for PlatformRepositories {
    fn name(&self) -> &str {
        "platform_repositories"
    }

    fn phases(&self) -> PhaseSet {
        PhaseSet::GLOBAL
    }

    async fn check_global(&self, ctx: &TestContext, test: &mut Test) -> anyhow::Result<()> {
        for platform in ctx.inventory.platforms() {
            let path = platform.repository_path();
            if !path.is_dir() {
                test.error(format!(
                    "platform {} has no repository at {}",
                    platform.name(),
                    path.display()
                ));
            }
        }
        Ok(())
    }
}
