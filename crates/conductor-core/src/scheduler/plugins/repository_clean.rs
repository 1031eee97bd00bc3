//! Checks that a platform's working tree carries no local modifications.

use async_trait::async_trait;

use crate::inventory::PlatformHandler;
use crate::scheduler::plugin::{PhaseSet, TestContext, TestPlugin};
use crate::scheduler::test::Test;

pub struct RepositoryClean;

#[async_trait]
impl TestPlugin for RepositoryClean {
    fn name(&self) -> &str {
        "repository_clean"
    }

    fn phases(&self) -> PhaseSet {
        PhaseSet::PLATFORM
    }

    async fn check_platform(
        &self,
        _ctx: &TestContext,
        platform: &dyn PlatformHandler,
        test: &mut Test,
    ) -> anyhow::Result<()> {
        let info = platform.repo_info()?;
        if !info.is_clean() {
            test.error(format!(
                "repository of platform {} is not clean: {}",
                platform.name(),
                info.diff_files().join(", ")
            ));
        }
        Ok(())
    }
}
