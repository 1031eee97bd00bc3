//! Disposable container sandboxes for safe pre-merge deploy testing.
//!
//! - [`registry`] — process-wide keyed locks serialising image builds and
//!   container lifecycles per resource key.
//! - [`runtime`] — the container-runtime collaborator trait.
//! - [`docker`] — runtime implementation shelling out to the `docker` CLI.

pub mod docker;
mod error;
pub mod registry;
pub mod runtime;

pub use error::{SandboxError, SandboxResult};
pub use registry::SandboxRegistry;
pub use runtime::ContainerRuntime;
