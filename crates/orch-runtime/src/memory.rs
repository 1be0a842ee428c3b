//! In-memory container inventory.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use orch_core::ContainerInfo;

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::ContainerRuntime;

/// A container runtime whose inventory is set by hand.
///
/// Stopped containers stay inspectable with `running == false`, removed
/// ones disappear, matching how a real engine reports them.
#[derive(Debug, Default)]
pub struct InMemoryRuntime {
    containers: Mutex<BTreeMap<String, ContainerInfo>>,
    unavailable: AtomicBool,
    list_calls: AtomicUsize,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_containers(containers: impl IntoIterator<Item = ContainerInfo>) -> Self {
        let runtime = Self::new();
        for container in containers {
            runtime.insert(container);
        }
        runtime
    }

    /// Build a running container attached to one network.
    pub fn container(id: &str, name: &str, ip: &str) -> ContainerInfo {
        ContainerInfo {
            id: id.to_string(),
            name: name.to_string(),
            status: "running".to_string(),
            running: true,
            networks: BTreeMap::from([("bridge".to_string(), ip.to_string())]),
            ..Default::default()
        }
    }

    pub fn insert(&self, container: ContainerInfo) {
        self.lock().insert(container.id.clone(), container);
    }

    /// Mark a container as exited.
    pub fn stop(&self, id: &str) {
        if let Some(container) = self.lock().get_mut(id) {
            container.running = false;
            container.status = "exited".to_string();
        }
    }

    pub fn remove(&self, id: &str) -> Option<ContainerInfo> {
        self.lock().remove(id)
    }

    /// Make every call fail as if the engine were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `list` calls served so far.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ContainerInfo>> {
        self.containers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> RuntimeResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RuntimeError::Connect("runtime marked unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn list(&self) -> RuntimeResult<Vec<ContainerInfo>> {
        self.check_available()?;
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.lock().values().filter(|c| c.running).cloned().collect())
    }

    async fn inspect(&self, id: &str) -> RuntimeResult<Option<ContainerInfo>> {
        self.check_available()?;
        Ok(self.lock().get(id).cloned())
    }

    async fn ping(&self) -> RuntimeResult<()> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_returns_running_only() {
        let runtime = InMemoryRuntime::with_containers([
            InMemoryRuntime::container("a", "one", "10.0.0.2"),
            InMemoryRuntime::container("b", "two", "10.0.0.3"),
        ]);
        runtime.stop("b");

        let listed = runtime.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "a");
        assert!(!runtime.is_running("b").await.unwrap());
        assert!(runtime.inspect("b").await.unwrap().is_some());

        runtime.remove("b");
        assert!(runtime.inspect("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unavailable_runtime_fails_every_call() {
        let runtime = InMemoryRuntime::new();
        runtime.set_unavailable(true);
        assert!(runtime.ping().await.is_err());
        assert!(runtime.list().await.is_err());
        runtime.set_unavailable(false);
        assert!(runtime.ping().await.is_ok());
    }
}
