//! Error taxonomy for the orchestration core.
//!
//! Fatal configuration problems surface as [`ConductorError`] before any
//! remote side effect. Per-host transport failures and plugin faults never
//! travel through this type: the former land as markers in the per-host
//! result map, the latter as recorded error strings on the `Test` involved.

use crate::sandbox::SandboxError;

/// Errors produced by the deployment pipeline and the test scheduler.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("platform {platform} must be checked out on branch {expected} before deploying (found {actual})")]
    NotOnPrimaryBranch {
        platform: String,
        expected: String,
        actual: String,
    },

    #[error("unknown test names: {0}")]
    UnknownTests(String),

    #[error("unknown report names: {0}")]
    UnknownReports(String),

    #[error("cannot register test plugin {name} from platform type {platform_type}: already registered")]
    DuplicatePlugin {
        name: String,
        platform_type: String,
    },

    #[error("platform hook failed: {0}")]
    Platform(String),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("sandbox callback failed: {0}")]
    Callback(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core orchestration operations.
pub type Result<T> = std::result::Result<T, ConductorError>;
