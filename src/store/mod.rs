//! Resource store adapters
//!
//! - [`KubeStore`]: the Kubernetes API server
//! - [`MemoryStore`]: in-process store with the same write semantics

pub mod kube_store;
pub mod memory;

pub use crate::domain::ports::{ResourceStore, ResourceStoreRef};
pub use kube_store::KubeStore;
pub use memory::MemoryStore;
