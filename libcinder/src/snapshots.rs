//! Snapshot lifecycle operations against Cinder: create, list, get, delete
//! and waiting for a snapshot to become available.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::backend::{BlockStorage, CreateOpts, ListOpts, Snapshot, SnapshotPage};
use crate::config::Config;
use crate::error::{BackendError, SnapshotError, WaitReadyError};
use crate::metrics::{ApiMetrics, MetricContext, MetricsRecorder};
use crate::wait::{self, Backoff, Readiness, WaitError};

pub const SNAPSHOT_READY_STATUS: &str = "available";
pub const SNAPSHOT_CREATING_STATUS: &str = "creating";

pub const SNAPSHOT_DESCRIPTION: &str = "Created by OpenStack Cinder CSI driver";
pub const SNAPSHOT_FORCE_CREATE: &str = "force-create";
/// Short alias of [`SNAPSHOT_FORCE_CREATE`].
pub const SNAPSHOT_FORCE: &str = "force";

/// Returned by `wait_ready` when the final lookup yields no snapshot.
pub const SNAPSHOT_STATUS_UNKNOWN: &str = "Failed to get snapshot status";

pub const SNAPSHOT_READY_BACKOFF: Backoff =
    Backoff::new(std::time::Duration::from_secs(1), 1.2, 10);

const METRIC_RESOURCE: &str = "snapshot";

/// Result of a single `list` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotListing {
    pub snapshots: Vec<Snapshot>,
    /// Marker to pass as the `Marker` filter to fetch the next page.
    pub next_token: Option<String>,
}

pub struct SnapshotManager {
    backend: Arc<dyn BlockStorage>,
    metrics: Arc<dyn MetricsRecorder>,
    ready_backoff: Backoff,
}

impl SnapshotManager {
    pub fn new(backend: Arc<dyn BlockStorage>) -> Self {
        Self {
            backend,
            metrics: Arc::new(ApiMetrics),
            ready_backoff: SNAPSHOT_READY_BACKOFF,
        }
    }

    pub fn with_config(backend: Arc<dyn BlockStorage>, config: &Config) -> Self {
        Self {
            ready_backoff: config.snapshot.ready_backoff(),
            ..Self::new(backend)
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Takes a snapshot of `volume_id`. A `force-create` (or `force`) entry in
    /// `tags` is consumed as the force flag; the remaining tags become the
    /// snapshot metadata.
    pub async fn create(
        &self,
        ctx: &CancellationToken,
        name: &str,
        volume_id: &str,
        tags: HashMap<String, String>,
    ) -> Result<Snapshot, SnapshotError> {
        let (force, metadata) = split_force_flag(tags);
        let opts = CreateOpts {
            volume_id: volume_id.to_string(),
            name: name.to_string(),
            description: SNAPSHOT_DESCRIPTION.to_string(),
            force,
            metadata,
        };

        let mc = MetricContext::new(self.metrics.as_ref(), METRIC_RESOURCE, "create");
        let res = call(ctx, self.backend.create_snapshot(&opts)).await;
        let snapshot = mc.observe_request(res)?;
        info!(
            "Created snapshot {} of volume {volume_id} (force: {force})",
            snapshot.id
        );
        Ok(snapshot)
    }

    /// Lists snapshots matching `filters`. Recognized keys are `Status`,
    /// `Name`, `VolumeID`, `Marker` and `Limit`.
    ///
    /// Only one page is fetched; the returned token is the `marker` of the
    /// next page, if the backend reported one.
    pub async fn list(
        &self,
        ctx: &CancellationToken,
        filters: &HashMap<String, String>,
    ) -> Result<SnapshotListing, SnapshotError> {
        let opts = list_opts_from_filters(filters);

        let mc = MetricContext::new(self.metrics.as_ref(), METRIC_RESOURCE, "list");
        let res = call(ctx, self.backend.list_snapshots(&opts, None))
            .await
            .and_then(listing_from_page);
        let listing = mc.observe_request(res)?;
        debug!(
            "Listed {} snapshots (next token: {:?})",
            listing.snapshots.len(),
            listing.next_token
        );
        Ok(listing)
    }

    pub async fn delete(
        &self,
        ctx: &CancellationToken,
        snapshot_id: &str,
    ) -> Result<(), SnapshotError> {
        let mc = MetricContext::new(self.metrics.as_ref(), METRIC_RESOURCE, "delete");
        let res = call(ctx, self.backend.delete_snapshot(snapshot_id)).await;
        match mc.observe_request(res) {
            Ok(()) => {
                info!("Deleted snapshot {snapshot_id}");
                Ok(())
            }
            Err(e) => {
                error!("Failed to delete snapshot {snapshot_id}: {e}");
                Err(e)
            }
        }
    }

    pub async fn get(
        &self,
        ctx: &CancellationToken,
        snapshot_id: &str,
    ) -> Result<Snapshot, SnapshotError> {
        let mc = MetricContext::new(self.metrics.as_ref(), METRIC_RESOURCE, "get");
        let res = call(ctx, self.backend.get_snapshot(snapshot_id)).await;
        mc.observe_request(res).inspect_err(|e| {
            error!("Failed to get snapshot {snapshot_id}: {e}");
        })
    }

    /// Polls the snapshot until its status is `available`.
    ///
    /// Whatever the outcome, the status is read once more at the end and
    /// returned, or [`SNAPSHOT_STATUS_UNKNOWN`] if that lookup fails too. The
    /// call succeeds only if the snapshot was seen available while polling.
    pub async fn wait_ready(
        &self,
        ctx: &CancellationToken,
        snapshot_id: &str,
    ) -> Result<String, WaitReadyError> {
        let polled = wait::exponential_backoff(ctx, self.ready_backoff, move || async move {
            match self.get(ctx, snapshot_id).await {
                Ok(snapshot) if snapshot.status == SNAPSHOT_READY_STATUS => Readiness::Ready,
                Ok(snapshot) => {
                    debug!(
                        "Snapshot {snapshot_id} is not ready yet, status: {}",
                        snapshot.status
                    );
                    Readiness::NotReady
                }
                Err(e) => Readiness::Failed(e),
            }
        })
        .await;

        let outcome = match polled {
            Ok(()) => Ok(()),
            Err(WaitError::Interrupted(source)) => Err(SnapshotError::NotReady {
                snapshot_id: snapshot_id.to_string(),
                source,
            }),
            Err(WaitError::Failed(e)) => Err(e),
        };

        // best effort, the lookup error is dropped
        let status = match self.get(ctx, snapshot_id).await {
            Ok(snapshot) => snapshot.status,
            Err(_) => SNAPSHOT_STATUS_UNKNOWN.to_string(),
        };

        match outcome {
            Ok(()) => {
                info!("Snapshot {snapshot_id} is ready");
                Ok(status)
            }
            Err(source) => Err(WaitReadyError { status, source }),
        }
    }
}

async fn call<T>(
    ctx: &CancellationToken,
    fut: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, SnapshotError> {
    match wait::cancellable(ctx, fut).await {
        Some(res) => res.map_err(SnapshotError::from),
        None => Err(SnapshotError::Cancelled),
    }
}

/// Removes the force entries from `tags` and parses the flag. A value that
/// does not parse counts as `false`.
fn split_force_flag(mut tags: HashMap<String, String>) -> (bool, HashMap<String, String>) {
    let mut force = None;
    for key in [SNAPSHOT_FORCE_CREATE, SNAPSHOT_FORCE] {
        if let Some(value) = tags.remove(key) {
            let parsed = parse_bool(&value).unwrap_or_else(|| {
                debug!("Make force create flag to false due to invalid value {value:?} of {key}");
                false
            });
            force.get_or_insert(parsed);
        }
    }
    (force.unwrap_or(false), tags)
}

/// Boolean grammar accepted for tag values.
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

fn list_opts_from_filters(filters: &HashMap<String, String>) -> ListOpts {
    let mut opts = ListOpts::default();
    for (key, val) in filters {
        match key.as_str() {
            "Status" => opts.status = Some(val.clone()),
            "Name" => opts.name = Some(val.clone()),
            "VolumeID" => opts.volume_id = Some(val.clone()),
            "Marker" => opts.marker = Some(val.clone()),
            "Limit" => opts.limit = val.parse().unwrap_or_default(),
            _ => debug!("Not a valid filter key {key}"),
        }
    }
    opts
}

fn listing_from_page(page: SnapshotPage) -> Result<SnapshotListing, SnapshotError> {
    let next_token = match page.next_page_url() {
        Some(next) => marker_from_page_url(next)?,
        None => None,
    };
    Ok(SnapshotListing {
        snapshots: page.snapshots,
        next_token,
    })
}

fn marker_from_page_url(next: &str) -> Result<Option<String>, SnapshotError> {
    let url = Url::parse(next).map_err(|source| SnapshotError::InvalidPageUrl {
        url: next.to_string(),
        source,
    })?;
    Ok(url
        .query_pairs()
        .find(|(key, _)| key == "marker")
        .map(|(_, value)| value.into_owned())
        .filter(|marker| !marker.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_split_force_flag() {
        let (force, rest) = split_force_flag(tags(&[("force", "true"), ("env", "prod")]));
        assert!(force);
        assert_eq!(rest, tags(&[("env", "prod")]));

        let (force, rest) = split_force_flag(tags(&[("force-create", "0")]));
        assert!(!force);
        assert!(rest.is_empty());

        let (force, rest) = split_force_flag(tags(&[("env", "dev")]));
        assert!(!force);
        assert_eq!(rest, tags(&[("env", "dev")]));
    }

    #[test]
    fn test_malformed_force_defaults_to_false_and_is_removed() {
        for value in ["yes", "", "on", "tRuE", "2"] {
            let (force, rest) = split_force_flag(tags(&[("force-create", value), ("a", "b")]));
            assert!(!force, "value {value:?} must not force");
            assert_eq!(rest, tags(&[("a", "b")]));
        }
    }

    #[test]
    fn test_canonical_force_key_wins_over_alias() {
        let (force, rest) = split_force_flag(tags(&[("force-create", "false"), ("force", "true")]));
        assert!(!force);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_parse_bool_grammar() {
        for v in ["1", "t", "T", "TRUE", "true", "True"] {
            assert_eq!(parse_bool(v), Some(true));
        }
        for v in ["0", "f", "F", "FALSE", "false", "False"] {
            assert_eq!(parse_bool(v), Some(false));
        }
        assert_eq!(parse_bool("yes"), None);
    }

    #[test]
    fn test_list_opts_from_filters() {
        let opts = list_opts_from_filters(&tags(&[
            ("Status", "available"),
            ("Limit", "5"),
            ("bogus", "x"),
        ]));
        assert_eq!(
            opts,
            ListOpts {
                status: Some("available".into()),
                limit: 5,
                ..Default::default()
            }
        );

        let opts = list_opts_from_filters(&tags(&[
            ("Name", "n"),
            ("VolumeID", "vol-1"),
            ("Marker", "snap-3"),
            ("Limit", "five"),
            ("TenantID", "t"),
            ("status", "lowercase keys are not recognized"),
        ]));
        assert_eq!(
            opts,
            ListOpts {
                name: Some("n".into()),
                volume_id: Some("vol-1".into()),
                marker: Some("snap-3".into()),
                limit: 0,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_marker_from_page_url() {
        assert_eq!(
            marker_from_page_url("https://cinder:8776/v3/p/snapshots/detail?limit=2&marker=abc")
                .unwrap(),
            Some("abc".to_string())
        );
        assert_eq!(
            marker_from_page_url("https://cinder:8776/v3/p/snapshots/detail?limit=2").unwrap(),
            None
        );
        assert!(matches!(
            marker_from_page_url("not a url"),
            Err(SnapshotError::InvalidPageUrl { .. })
        ));
    }
}
