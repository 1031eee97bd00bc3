//! Process-wide keyed-lock store for sandbox resources.
//!
//! Two keyed lock families exist: one per image tag (serialising builds)
//! and one per container name (serialising lifecycle transitions). Lock
//! creation for both families is guarded by one coarse mutex so creating a
//! key's lock is itself race-free; once a key's lock exists, operations on
//! different keys never contend.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex as AsyncMutex;

type KeyedLocks = HashMap<String, Arc<AsyncMutex<()>>>;

#[derive(Default)]
struct Locks {
    images: KeyedLocks,
    containers: KeyedLocks,
}

/// Keyed mutual-exclusion registry shared by every `Deployer` of the
/// process.
///
/// Constructed explicitly and passed around behind an `Arc`; [`reset`]
/// reinitialises both families for test isolation.
///
/// [`reset`]: SandboxRegistry::reset
#[derive(Default)]
pub struct SandboxRegistry {
    locks: StdMutex<Locks>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn image_lock(&self, tag: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("sandbox registry poisoned");
        locks.images.entry(tag.to_string()).or_default().clone()
    }

    fn container_lock(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("sandbox registry poisoned");
        locks.containers.entry(name.to_string()).or_default().clone()
    }

    /// Run `f` while holding the lock dedicated to an image tag.
    ///
    /// Concurrent callers for the same tag wait; callers for distinct tags
    /// proceed independently.
    pub async fn with_image_lock<T, F, Fut>(&self, tag: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.image_lock(tag);
        let _guard = lock.lock().await;
        f().await
    }

    /// Run `f` while holding the lock dedicated to a container name.
    pub async fn with_container_lock<T, F, Fut>(&self, name: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.container_lock(name);
        let _guard = lock.lock().await;
        f().await
    }

    /// Drop every keyed lock, reinitialising both families.
    ///
    /// Meant for test isolation; a lock currently held by a task stays
    /// valid for that task but new callers get a fresh one.
    pub fn reset(&self) {
        let mut locks = self.locks.lock().expect("sandbox registry poisoned");
        *locks = Locks::default();
    }

    #[cfg(test)]
    fn lock_counts(&self) -> (usize, usize) {
        let locks = self.locks.lock().unwrap();
        (locks.images.len(), locks.containers.len())
    }
}
