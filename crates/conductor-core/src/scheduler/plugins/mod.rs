//! Built-in test plugins.

mod deploy_from_scratch;
mod deploy_output_errors;
mod hostname;
mod idempotence;
mod platform_repositories;
mod repository_clean;

use std::sync::Arc;

pub use deploy_from_scratch::DeployFromScratch;
pub use deploy_output_errors::DeployOutputErrors;
pub use hostname::Hostname;
pub use idempotence::Idempotence;
pub use platform_repositories::PlatformRepositories;
pub use repository_clean::RepositoryClean;

use crate::scheduler::plugin::TestPlugin;

/// Every plugin shipped with the scheduler, ready for registration.
pub fn builtin_plugins() -> Vec<Arc<dyn TestPlugin>> {
    vec![
        Arc::new(PlatformRepositories),
        Arc::new(RepositoryClean),
        Arc::new(Hostname),
        Arc::new(DeployFromScratch),
        Arc::new(Idempotence),
        Arc::new(DeployOutputErrors::new()),
    ]
}
