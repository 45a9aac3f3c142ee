//! Custom Resource Definitions for the cStor pool manager
//!
//! This module contains all CRD types:
//! - CStorPool: A pool built from block device groups on one node
//! - CStorVolumeReplica: A volume replica dataset hosted in a pool

pub mod condition;
pub mod cstor_pool;
pub mod volume_replica;

pub use condition::*;
pub use cstor_pool::*;
pub use volume_replica::*;

// Re-export common types for convenience
pub use chrono::{DateTime, Utc};
