//! Sandbox error taxonomy.

/// Errors raised by sandbox lifecycle operations.
///
/// Any of these aborts the sandbox operation before the caller's callback
/// runs; no partially created container is left running.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("unknown sandbox image {image} declared for host {host}")]
    UnknownImage { host: String, image: String },

    #[error("image operation failed: {0}")]
    Image(String),

    #[error("container operation failed: {0}")]
    Container(String),
}

pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
