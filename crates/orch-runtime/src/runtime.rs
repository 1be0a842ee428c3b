use async_trait::async_trait;

use orch_core::ContainerInfo;

use crate::error::RuntimeResult;

/// Read-only view of a container engine.
///
/// Implementations are selected once at startup and shared behind an
/// `Arc<dyn ContainerRuntime>`.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Short backend name for logs and health output.
    fn name(&self) -> &'static str;

    /// Every running container with its labels and network addresses.
    async fn list(&self) -> RuntimeResult<Vec<ContainerInfo>>;

    /// Full details of one container, or `None` if the engine does not know it.
    async fn inspect(&self, id: &str) -> RuntimeResult<Option<ContainerInfo>>;

    /// Check that the engine answers.
    async fn ping(&self) -> RuntimeResult<()>;

    /// Whether `id` names a container that is currently running.
    async fn is_running(&self, id: &str) -> RuntimeResult<bool> {
        Ok(self.inspect(id).await?.is_some_and(|c| c.running))
    }
}
