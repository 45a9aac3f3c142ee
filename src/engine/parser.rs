//! Parsers for the text output of the pool and dataset tools
//!
//! These are position based and match the tools' current output format.
//! Input that does not have the expected shape is reported as
//! [`Error::MalformedOutput`] instead of being read as zero values.

use serde::Deserialize;

use crate::domain::types::{PoolCapacity, PoolHealth, ReplicaCapacity, ReplicaHealth};
use crate::error::{Error, Result};

/// Output printed by the liveness probe once the engine has no pools
pub const NO_POOLS_AVAILABLE: &str = "no pools available";

/// Output of `destroy` for a pool that is already gone
pub const NO_SUCH_POOL: &str = "no such pool";

/// Output of `destroy` for a dataset that is already gone
pub const DATASET_DOES_NOT_EXIST: &str = "dataset does not exist";

/// Output of `create` for a dataset that is already there
pub const DATASET_ALREADY_EXISTS: &str = "dataset already exists";

fn malformed(command: &str, reason: impl Into<String>) -> Error {
    Error::MalformedOutput {
        command: command.to_string(),
        reason: reason.into(),
    }
}

/// Split the output of a `get -Hp -ovalue a,b` query into its two values.
///
/// The output is two value lines and a line terminator; trailing blank lines
/// are tolerated, anything else is malformed.
fn two_values<'a>(command: &str, output: &'a str) -> Result<(&'a str, &'a str)> {
    let lines: Vec<&str> = output.split('\n').collect();
    if lines.len() < 3 {
        return Err(malformed(
            command,
            format!("expected 3 lines, got {}: {:?}", lines.len(), output),
        ));
    }
    if lines[2..].iter().any(|l| !l.trim().is_empty()) {
        return Err(malformed(command, format!("unexpected trailing output: {:?}", output)));
    }
    Ok((lines[0].trim(), lines[1].trim()))
}

// =============================================================================
// Pool Output
// =============================================================================

/// Map a health string printed by the pool tool
pub fn pool_health(value: &str) -> PoolHealth {
    match value {
        "ONLINE" => PoolHealth::Online,
        "DEGRADED" | "REMOVED" => PoolHealth::Degraded,
        "FAULTED" | "OFFLINE" => PoolHealth::Offline,
        _ => PoolHealth::Error,
    }
}

/// Parse `get -Hp -ovalue health,io.openebs:readonly`:
///
/// ```text
/// ONLINE
/// off
/// ```
pub fn pool_status(output: &str) -> Result<(PoolHealth, bool)> {
    let (health, read_only) = two_values("pool status", output)?;
    Ok((pool_health(health), read_only == "on"))
}

/// Parse `get size,free,allocated`:
///
/// ```text
/// NAME          PROPERTY   VALUE  SOURCE
/// cstor-2ebe40  size       9.94G  -
/// cstor-2ebe40  free       9.94G  -
/// cstor-2ebe40  allocated  202K   -
/// ```
///
/// A row with fewer than four columns leaves its field empty; callers treat
/// an empty free or used value as a failure.
pub fn pool_capacity(output: &str) -> PoolCapacity {
    let mut capacity = PoolCapacity::default();
    if output.trim().is_empty() {
        return capacity;
    }
    let lines: Vec<&str> = output.split('\n').collect();
    if lines.len() < 4 {
        return capacity;
    }

    let value = |row: &str| -> String {
        let fields: Vec<&str> = row.split_whitespace().collect();
        if fields.len() < 4 {
            String::new()
        } else {
            fields[2].trim().to_string()
        }
    };

    capacity.total = value(lines[1]);
    capacity.free = value(lines[2]);
    capacity.used = value(lines[3]);
    capacity
}

/// Parse a newline separated name listing, dropping blank entries
pub fn names(output: &str) -> Vec<String> {
    output
        .split('\n')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// =============================================================================
// Dataset Output
// =============================================================================

#[derive(Debug, Deserialize)]
struct ReplicaStats {
    #[serde(default)]
    stats: Vec<ReplicaStat>,
}

#[derive(Debug, Deserialize)]
struct ReplicaStat {
    name: String,
    #[serde(default)]
    status: String,
}

/// Map a replica status string printed by the dataset tool
pub fn replica_health(value: &str) -> ReplicaHealth {
    match value {
        "Healthy" => ReplicaHealth::Healthy,
        "Degraded" | "Rebuilding" | "Reconstructing" => ReplicaHealth::Degraded,
        "Offline" => ReplicaHealth::Offline,
        _ => ReplicaHealth::Error,
    }
}

/// Parse `stats <dataset>` JSON output and return the health of `dataset`.
/// A listing that does not name the dataset is malformed.
pub fn replica_stats(dataset: &str, output: &str) -> Result<ReplicaHealth> {
    let parsed: ReplicaStats = serde_json::from_str(output.trim())
        .map_err(|e| malformed("replica stats", e.to_string()))?;
    let stat = parsed
        .stats
        .iter()
        .find(|s| s.name == dataset)
        .ok_or_else(|| malformed("replica stats", format!("no stats for {}", dataset)))?;
    Ok(replica_health(&stat.status))
}

/// Parse `get -Hp -ovalue used,logicalused <dataset>`
pub fn replica_capacity(output: &str) -> Result<ReplicaCapacity> {
    let (used, logical_used) = two_values("replica capacity", output)?;
    if used.is_empty() || logical_used.is_empty() {
        return Err(malformed("replica capacity", format!("empty value in {:?}", output)));
    }
    Ok(ReplicaCapacity {
        used: used.to_string(),
        logical_used: logical_used.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const CAPACITY: &str = "NAME                                        PROPERTY   VALUE  SOURCE
cstor-2ebe403a-f2e2-11e8-87fd-42010a800087  size       9.94G  -
cstor-2ebe403a-f2e2-11e8-87fd-42010a800087  free       9.94G  -
cstor-2ebe403a-f2e2-11e8-87fd-42010a800087  allocated  202K   -
";

    #[test]
    fn test_pool_status() {
        assert_eq!(pool_status("ONLINE\noff\n\n").unwrap(), (PoolHealth::Online, false));
        assert_eq!(pool_status("DEGRADED\non\n\n").unwrap(), (PoolHealth::Degraded, true));
        assert_eq!(pool_status("ONLINE\noff\n").unwrap(), (PoolHealth::Online, false));
    }

    #[test]
    fn test_pool_status_malformed() {
        assert_matches!(pool_status("ONLINE\noff"), Err(Error::MalformedOutput { .. }));
        assert_matches!(pool_status("ONLINE\n"), Err(Error::MalformedOutput { .. }));
        assert_matches!(pool_status(""), Err(Error::MalformedOutput { .. }));
        assert_matches!(
            pool_status("ONLINE\noff\nsurprise\n"),
            Err(Error::MalformedOutput { .. })
        );
    }

    #[test]
    fn test_pool_health_mapping() {
        assert_eq!(pool_health("ONLINE"), PoolHealth::Online);
        assert_eq!(pool_health("DEGRADED"), PoolHealth::Degraded);
        assert_eq!(pool_health("REMOVED"), PoolHealth::Degraded);
        assert_eq!(pool_health("FAULTED"), PoolHealth::Offline);
        assert_eq!(pool_health("OFFLINE"), PoolHealth::Offline);
        assert_eq!(pool_health("UNAVAIL"), PoolHealth::Error);
        assert_eq!(pool_health("SUSPENDED"), PoolHealth::Error);
    }

    #[test]
    fn test_pool_capacity() {
        let capacity = pool_capacity(CAPACITY);
        assert_eq!(
            capacity,
            PoolCapacity {
                total: "9.94G".into(),
                free: "9.94G".into(),
                used: "202K".into(),
            }
        );
    }

    #[test]
    fn test_pool_capacity_short_row() {
        let output = "NAME PROPERTY VALUE SOURCE
cstor-1 size 9.94G -
cstor-1 free
cstor-1 allocated 202K -
";
        let capacity = pool_capacity(output);
        assert_eq!(capacity.total, "9.94G");
        assert_eq!(capacity.free, "");
        assert_eq!(capacity.used, "202K");
    }

    #[test]
    fn test_pool_capacity_missing_rows() {
        assert_eq!(pool_capacity(""), PoolCapacity::default());
        assert_eq!(
            pool_capacity("NAME PROPERTY VALUE SOURCE\ncstor-1 size 9.94G -"),
            PoolCapacity::default()
        );
    }

    #[test]
    fn test_names() {
        assert_eq!(names("cstor-1\n  cstor-2 \n\n"), vec!["cstor-1", "cstor-2"]);
        assert!(names("").is_empty());
        assert!(names("\n\n").is_empty());
    }

    #[test]
    fn test_replica_stats() {
        let out = r#"{"stats":[{"name":"cstor-a/pvc-1","status":"Rebuilding"}]}"#;
        assert_eq!(replica_stats("cstor-a/pvc-1", out).unwrap(), ReplicaHealth::Degraded);

        let out = r#"{"stats":[{"name":"cstor-a/pvc-2","status":"Healthy"},{"name":"cstor-a/pvc-1","status":"Offline"}]}"#;
        assert_eq!(replica_stats("cstor-a/pvc-1", out).unwrap(), ReplicaHealth::Offline);

        let out = r#"{"stats":[{"name":"x","status":"Init"}]}"#;
        assert_eq!(replica_stats("x", out).unwrap(), ReplicaHealth::Error);

        assert_matches!(replica_stats("x", r#"{"stats":[]}"#), Err(Error::MalformedOutput { .. }));

        // Another replica's entry must not stand in for the requested one.
        let out = r#"{"stats":[{"name":"cstor-a/pvc-2","status":"Healthy"}]}"#;
        assert_matches!(replica_stats("cstor-a/pvc-1", out), Err(Error::MalformedOutput { .. }));
        assert_matches!(replica_stats("x", "not json"), Err(Error::MalformedOutput { .. }));
    }

    #[test]
    fn test_replica_capacity() {
        assert_eq!(
            replica_capacity("6K\n6K\n").unwrap(),
            ReplicaCapacity {
                used: "6K".into(),
                logical_used: "6K".into(),
            }
        );
        assert_matches!(replica_capacity("6K\n"), Err(Error::MalformedOutput { .. }));
        assert_matches!(replica_capacity("\n6K\n"), Err(Error::MalformedOutput { .. }));
    }
}
