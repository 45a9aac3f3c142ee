//! Runtime configuration and fixed retry intervals

use std::time::Duration;
use tracing::warn;

use crate::crd::POOL_UID_LABEL;
use crate::error::{Error, Result};

// =============================================================================
// Intervals
// =============================================================================

/// Retry interval while the custom resource definitions are missing
pub const CRD_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Retry interval while waiting for an expected pool to show up
pub const POOL_NAME_HANDLER_INTERVAL: Duration = Duration::from_secs(5);

/// Default informer resync period
pub const SHARED_INFORMER_INTERVAL: Duration = Duration::from_secs(30);

/// Engine liveness retry interval during startup
pub const INITIAL_ENGINE_RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Engine liveness polling interval once the controllers run
pub const CONTINUOUS_ENGINE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Environment variable naming the pool resource UID owned by this node
pub const CSTOR_ID_ENV: &str = "OPENEBS_IO_CSTOR_ID";

/// Environment variable overriding the informer resync period (seconds)
pub const RESYNC_INTERVAL_ENV: &str = "RESYNC_INTERVAL";

/// Default number of workers per reconciler
pub const DEFAULT_THREADS: usize = 1;

/// Pool management tool
pub const POOL_TOOL: &str = "zpool";

/// Dataset management tool
pub const DATASET_TOOL: &str = "zfs";

// =============================================================================
// Read-only Latch Policy
// =============================================================================

/// What releases a read-only latch set by the capacity threshold
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ReadOnlyRelease {
    /// Only an explicit release annotation clears the latch
    #[default]
    Manual,
    /// The latch clears once used capacity drops below the threshold
    OnRecovery,
}

impl std::fmt::Display for ReadOnlyRelease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadOnlyRelease::Manual => write!(f, "manual"),
            ReadOnlyRelease::OnRecovery => write!(f, "on-recovery"),
        }
    }
}

// =============================================================================
// Operator Configuration
// =============================================================================

/// Configuration for the pool manager
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Workers per reconciler
    pub threads: usize,
    /// Pool management binary
    pub pool_tool: String,
    /// Dataset management binary
    pub dataset_tool: String,
    /// Informer resync period
    pub resync_interval: Duration,
    /// Read-only latch release policy
    pub read_only_release: ReadOnlyRelease,
    /// UID of the pool resource this node manages; everything else is ignored
    pub cstor_id: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            pool_tool: POOL_TOOL.to_string(),
            dataset_tool: DATASET_TOOL.to_string(),
            resync_interval: SHARED_INFORMER_INTERVAL,
            read_only_release: ReadOnlyRelease::default(),
            cstor_id: String::new(),
        }
    }
}

impl OperatorConfig {
    /// Reject a configuration that does not name the pool of this node
    pub fn validate(&self) -> Result<()> {
        if self.cstor_id.trim().is_empty() {
            return Err(Error::Configuration(format!(
                "{} must be set to the UID of the CStorPool on this node",
                CSTOR_ID_ENV
            )));
        }
        Ok(())
    }

    /// Label selector restricting replicas to the pool owned by this node
    pub fn replica_label_selector(&self) -> String {
        format!("{}={}", POOL_UID_LABEL, self.cstor_id)
    }

    /// Whether a pool resource with this UID is managed by this node
    pub fn owns_pool(&self, uid: &str) -> bool {
        !self.cstor_id.is_empty() && self.cstor_id == uid
    }
}

/// Resync interval from the environment, defaulting when missing or invalid
pub fn resync_interval() -> Duration {
    parse_resync_interval(std::env::var(RESYNC_INTERVAL_ENV).ok().as_deref())
}

/// Parse a resync interval in seconds; missing, zero or garbage falls back
/// to [`SHARED_INFORMER_INTERVAL`]
pub fn parse_resync_interval(value: Option<&str>) -> Duration {
    match value.map(|v| v.trim().parse::<u64>()) {
        Some(Ok(secs)) if secs > 0 => Duration::from_secs(secs),
        _ => {
            warn!(
                value = ?value,
                "Incorrect resync interval obtained from env, defaulting to {:?}",
                SHARED_INFORMER_INTERVAL
            );
            SHARED_INFORMER_INTERVAL
        }
    }
}
