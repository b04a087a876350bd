//! In-process `BlockStorage` that keeps snapshots in a map.
//!
//! Created snapshots start in `creating` and switch to `available` after a
//! configurable number of lookups, which lets readiness polling run against
//! it. Faults can be injected per operation and every request is journaled.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use url::Url;

use super::{BlockStorage, CreateOpts, ListOpts, Snapshot, SnapshotPage};
use crate::error::BackendError;
use crate::snapshots::{SNAPSHOT_CREATING_STATUS, SNAPSHOT_READY_STATUS};

const DEFAULT_BASE_URL: &str = "http://cinder.memory.local/v3";
// Cinder's osapi_max_limit default.
const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    List,
    Get,
    Delete,
}

#[derive(Debug)]
struct Entry {
    snapshot: Snapshot,
    gets_until_ready: Option<u32>,
}

#[derive(Debug, Default)]
struct State {
    // ids are zero padded, so key order is creation order
    snapshots: BTreeMap<String, Entry>,
    next_id: u64,
    ready_after: Option<u32>,
    faults: HashMap<Operation, BackendError>,
    create_requests: Vec<CreateOpts>,
    list_requests: Vec<ListOpts>,
    get_calls: HashMap<String, u32>,
}

#[derive(Debug)]
pub struct MemoryBlockStorage {
    state: Mutex<State>,
    page_size: usize,
    base_url: String,
}

impl Default for MemoryBlockStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlockStorage {
    /// New snapshots become available on their first lookup.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                ready_after: Some(1),
                ..Default::default()
            }),
            page_size: DEFAULT_PAGE_SIZE,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Number of lookups after which a new snapshot reports `available`.
    /// `Some(0)` creates snapshots already available, `None` never turns them.
    pub fn with_ready_after(self, gets: Option<u32>) -> Self {
        self.set_ready_after(gets);
        self
    }

    pub fn set_ready_after(&self, gets: Option<u32>) {
        self.state().ready_after = gets;
    }

    pub fn insert_snapshot(&self, snapshot: Snapshot) {
        self.state().snapshots.insert(
            snapshot.id.clone(),
            Entry {
                snapshot,
                gets_until_ready: None,
            },
        );
    }

    pub fn set_status(&self, snapshot_id: &str, status: &str) -> bool {
        match self.state().snapshots.get_mut(snapshot_id) {
            Some(entry) => {
                entry.snapshot.status = status.to_string();
                entry.gets_until_ready = None;
                true
            }
            None => false,
        }
    }

    /// Makes every following call of `op` fail with `err` until cleared.
    pub fn fail(&self, op: Operation, err: BackendError) {
        self.state().faults.insert(op, err);
    }

    pub fn clear_fault(&self, op: Operation) {
        self.state().faults.remove(&op);
    }

    pub fn create_requests(&self) -> Vec<CreateOpts> {
        self.state().create_requests.clone()
    }

    pub fn list_requests(&self) -> Vec<ListOpts> {
        self.state().list_requests.clone()
    }

    pub fn get_calls(&self, snapshot_id: &str) -> u32 {
        self.state()
            .get_calls
            .get(snapshot_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.state().snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_page_url(
        &self,
        opts: &ListOpts,
        marker: &str,
        limit: usize,
    ) -> Result<String, BackendError> {
        let mut url = Url::parse(&format!("{}/snapshots/detail", self.base_url))
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in opts.query_pairs() {
                if key != "marker" && key != "limit" {
                    query.append_pair(key, &value);
                }
            }
            query.append_pair("limit", &limit.to_string());
            query.append_pair("marker", marker);
        }
        Ok(url.into())
    }
}

fn check_fault(state: &State, op: Operation) -> Result<(), BackendError> {
    match state.faults.get(&op) {
        Some(err) => Err(err.clone()),
        None => Ok(()),
    }
}

fn matches_filters(opts: &ListOpts, snapshot: &Snapshot) -> bool {
    opts.status.as_ref().is_none_or(|s| *s == snapshot.status)
        && opts.name.as_ref().is_none_or(|n| *n == snapshot.name)
        && opts.volume_id.as_ref().is_none_or(|v| *v == snapshot.volume_id)
}

/// Reads `marker` and `limit` from a next-page URL.
fn page_cursor(page_url: &str) -> Result<(Option<String>, Option<usize>), BackendError> {
    let url = Url::parse(page_url).map_err(|e| BackendError::Api {
        status: 400,
        message: format!("invalid page url {page_url}: {e}"),
    })?;
    let mut marker = None;
    let mut limit = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "marker" => marker = Some(value.into_owned()),
            "limit" => limit = value.parse().ok(),
            _ => {}
        }
    }
    Ok((marker, limit))
}

#[async_trait]
impl BlockStorage for MemoryBlockStorage {
    async fn create_snapshot(&self, opts: &CreateOpts) -> Result<Snapshot, BackendError> {
        let mut state = self.state();
        state.create_requests.push(opts.clone());
        check_fault(&state, Operation::Create)?;

        if opts.volume_id.is_empty() {
            return Err(BackendError::Api {
                status: 400,
                message: "volume_id is required".to_string(),
            });
        }

        state.next_id += 1;
        let id = format!("snap-{:06}", state.next_id);
        let (status, gets_until_ready) = match state.ready_after {
            Some(0) => (SNAPSHOT_READY_STATUS, None),
            other => (SNAPSHOT_CREATING_STATUS, other),
        };
        let now = Utc::now();
        let snapshot = Snapshot {
            id: id.clone(),
            name: opts.name.clone(),
            description: opts.description.clone(),
            volume_id: opts.volume_id.clone(),
            status: status.to_string(),
            size: 0,
            metadata: opts.metadata.clone(),
            created_at: Some(now),
            updated_at: Some(now),
        };
        state.snapshots.insert(
            id,
            Entry {
                snapshot: snapshot.clone(),
                gets_until_ready,
            },
        );
        Ok(snapshot)
    }

    async fn list_snapshots(
        &self,
        opts: &ListOpts,
        page_url: Option<&str>,
    ) -> Result<SnapshotPage, BackendError> {
        let mut state = self.state();
        state.list_requests.push(opts.clone());
        check_fault(&state, Operation::List)?;

        let (marker, limit) = match page_url {
            Some(url) => {
                let (marker, limit) = page_cursor(url)?;
                (marker, limit.unwrap_or(opts.limit))
            }
            None => (opts.marker.clone(), opts.limit),
        };
        let page_size = match limit {
            0 => self.page_size,
            n => n.min(self.page_size),
        };

        if let Some(marker) = &marker {
            if !state.snapshots.contains_key(marker) {
                return Err(BackendError::NotFound(format!("marker {marker}")));
            }
        }

        let mut remaining = state
            .snapshots
            .iter()
            .filter(|(id, _)| marker.as_ref().is_none_or(|m| id.as_str() > m.as_str()))
            .map(|(_, entry)| &entry.snapshot)
            .filter(|snapshot| matches_filters(opts, snapshot));

        let snapshots: Vec<Snapshot> = remaining.by_ref().take(page_size).cloned().collect();
        let has_more = remaining.next().is_some();

        let next_page_url = match snapshots.last() {
            Some(last) if has_more => Some(self.next_page_url(opts, &last.id, page_size)?),
            _ => None,
        };

        Ok(SnapshotPage {
            snapshots,
            next_page_url,
        })
    }

    async fn get_snapshot(&self, snapshot_id: &str) -> Result<Snapshot, BackendError> {
        let mut state = self.state();
        *state.get_calls.entry(snapshot_id.to_string()).or_default() += 1;
        check_fault(&state, Operation::Get)?;

        let entry = state
            .snapshots
            .get_mut(snapshot_id)
            .ok_or_else(|| BackendError::NotFound(format!("snapshot {snapshot_id}")))?;

        if let Some(remaining) = entry.gets_until_ready {
            let remaining = remaining.saturating_sub(1);
            if remaining == 0 {
                entry.snapshot.status = SNAPSHOT_READY_STATUS.to_string();
                entry.snapshot.updated_at = Some(Utc::now());
                entry.gets_until_ready = None;
            } else {
                entry.gets_until_ready = Some(remaining);
            }
        }
        Ok(entry.snapshot.clone())
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), BackendError> {
        let mut state = self.state();
        check_fault(&state, Operation::Delete)?;

        state
            .snapshots
            .remove(snapshot_id)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(format!("snapshot {snapshot_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(volume_id: &str, name: &str) -> CreateOpts {
        CreateOpts {
            volume_id: volume_id.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_snapshot_turns_available_after_configured_gets() {
        let backend = MemoryBlockStorage::new().with_ready_after(Some(3));
        let snap = backend.create_snapshot(&opts("vol-1", "a")).await.unwrap();
        assert_eq!(snap.status, SNAPSHOT_CREATING_STATUS);

        let statuses: Vec<String> = {
            let mut out = Vec::new();
            for _ in 0..4 {
                out.push(backend.get_snapshot(&snap.id).await.unwrap().status);
            }
            out
        };
        assert_eq!(statuses, ["creating", "creating", "available", "available"]);
        assert_eq!(backend.get_calls(&snap.id), 4);
    }

    #[tokio::test]
    async fn test_never_ready() {
        let backend = MemoryBlockStorage::new().with_ready_after(None);
        let snap = backend.create_snapshot(&opts("vol-1", "a")).await.unwrap();
        for _ in 0..20 {
            assert_eq!(
                backend.get_snapshot(&snap.id).await.unwrap().status,
                SNAPSHOT_CREATING_STATUS
            );
        }
    }

    #[tokio::test]
    async fn test_paging_follows_next_page_url() {
        let backend = MemoryBlockStorage::new().with_page_size(2);
        for i in 0..5 {
            backend
                .create_snapshot(&opts("vol-1", &format!("s{i}")))
                .await
                .unwrap();
        }
        let list = ListOpts::default();

        let first = backend.list_snapshots(&list, None).await.unwrap();
        assert_eq!(first.snapshots.len(), 2);
        let next = first.next_page_url().unwrap().to_string();
        assert!(next.contains("marker=snap-000002"));

        let second = backend.list_snapshots(&list, Some(next.as_str())).await.unwrap();
        assert_eq!(second.snapshots[0].id, "snap-000003");

        let third = backend
            .list_snapshots(&list, second.next_page_url())
            .await
            .unwrap();
        assert_eq!(third.snapshots.len(), 1);
        assert_eq!(third.next_page_url(), None);
    }

    #[tokio::test]
    async fn test_list_filters_and_unknown_marker() {
        let backend = MemoryBlockStorage::new().with_ready_after(Some(0));
        backend.create_snapshot(&opts("vol-1", "a")).await.unwrap();
        backend.create_snapshot(&opts("vol-2", "b")).await.unwrap();

        let page = backend
            .list_snapshots(
                &ListOpts {
                    volume_id: Some("vol-2".into()),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(page.snapshots.len(), 1);
        assert_eq!(page.snapshots[0].name, "b");

        let err = backend
            .list_snapshots(
                &ListOpts {
                    marker: Some("snap-999999".into()),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let backend = MemoryBlockStorage::new();
        backend.fail(Operation::Create, BackendError::Transport("reset".into()));
        let err = backend.create_snapshot(&opts("vol-1", "a")).await.unwrap_err();
        assert_eq!(err, BackendError::Transport("reset".into()));
        assert_eq!(backend.create_requests().len(), 1);
        assert!(backend.is_empty());

        backend.clear_fault(Operation::Create);
        backend.create_snapshot(&opts("vol-1", "a")).await.unwrap();
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_unknown_snapshot() {
        let backend = MemoryBlockStorage::new();
        let err = backend.delete_snapshot("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
