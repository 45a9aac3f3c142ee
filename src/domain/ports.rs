//! Domain Ports - Core trait definitions for the pool manager
//!
//! These traits define the boundaries between the reconciliation logic and
//! external systems: the pool/dataset command-line tools and the cluster
//! resource store. Adapters implement these traits to provide concrete
//! functionality; tests substitute in-memory fakes.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

// =============================================================================
// Command Execution Port
// =============================================================================

/// Result of one external command invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// stdout followed by stderr
    pub combined: Vec<u8>,
    /// stdout only
    pub stdout: Vec<u8>,
    /// Whether the process exited with status zero
    pub success: bool,
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
}

impl CommandOutput {
    pub fn combined_str(&self) -> String {
        String::from_utf8_lossy(&self.combined).into_owned()
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Port for running the external pool tools.
///
/// Implementations only fail when the process cannot be run at all; a
/// non-zero exit is reported through [`CommandOutput::success`].
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, tool: &str, args: &[String]) -> Result<CommandOutput>;
}

// =============================================================================
// Resource Store Port
// =============================================================================

/// Port for the cluster key-value resource store.
///
/// `update` and `update_status` use optimistic concurrency: they fail with
/// [`crate::error::Error::Conflict`] when the stored resource version differs
/// from the one carried by the object.
#[async_trait]
pub trait ResourceStore<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>>;

    /// List resources, optionally filtered by an equality label selector
    /// (`key=value[,key=value]`)
    async fn list(&self, label_selector: Option<&str>) -> Result<Vec<K>>;

    async fn create(&self, obj: &K) -> Result<K>;

    async fn update(&self, obj: &K) -> Result<K>;

    async fn update_status(&self, obj: &K) -> Result<K>;

    /// Delete a resource; deleting a missing resource succeeds
    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type CommandRunnerRef = Arc<dyn CommandRunner>;
pub type ResourceStoreRef<K> = Arc<dyn ResourceStore<K>>;
