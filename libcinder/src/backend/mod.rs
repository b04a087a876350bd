//! Block storage backend interface.
//!
//! `BlockStorage` is the seam between the snapshot manager and whatever talks
//! to Cinder. The request and response types mirror the Cinder v3 snapshot
//! resource so that an SDK-backed implementation can map them one to one.
//!
//! Submodules:
//! - `memory`: in-process implementation with paging, delayed readiness and
//!   fault injection

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

pub mod memory;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub volume_id: String,
    pub status: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default, with = "cinder_time", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "cinder_time", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Cinder timestamps carry no zone (`2024-05-01T10:00:00.000000`) and are UTC.
/// RFC 3339 input with an explicit offset is accepted as well.
mod cinder_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_str(&ts.format(FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) if !raw.is_empty() => parse(&raw).map(Some).map_err(D::Error::custom),
            _ => Ok(None),
        }
    }

    pub(super) fn parse(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        match DateTime::parse_from_rfc3339(raw) {
            Ok(ts) => Ok(ts.with_timezone(&Utc)),
            Err(_) => NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").map(|ts| ts.and_utc()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreateOpts {
    pub volume_id: String,
    pub name: String,
    pub description: String,
    pub force: bool,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOpts {
    pub status: Option<String>,
    pub name: Option<String>,
    pub volume_id: Option<String>,
    pub marker: Option<String>,
    /// Page size requested from the backend; 0 leaves it to the backend.
    pub limit: usize,
}

impl ListOpts {
    /// Query parameters of the Cinder list request. Unset fields are omitted.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(status) = &self.status {
            pairs.push(("status", status.clone()));
        }
        if let Some(name) = &self.name {
            pairs.push(("name", name.clone()));
        }
        if let Some(volume_id) = &self.volume_id {
            pairs.push(("volume_id", volume_id.clone()));
        }
        if let Some(marker) = &self.marker {
            pairs.push(("marker", marker.clone()));
        }
        if self.limit > 0 {
            pairs.push(("limit", self.limit.to_string()));
        }
        pairs
    }
}

/// One page of a snapshot listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotPage {
    pub snapshots: Vec<Snapshot>,
    pub next_page_url: Option<String>,
}

impl SnapshotPage {
    pub fn next_page_url(&self) -> Option<&str> {
        self.next_page_url.as_deref().filter(|u| !u.is_empty())
    }
}

#[async_trait]
pub trait BlockStorage: Send + Sync {
    async fn create_snapshot(&self, opts: &CreateOpts) -> Result<Snapshot, BackendError>;

    /// Fetches one page. `page_url` is `None` for the first page and the
    /// previous page's next-page URL afterwards.
    async fn list_snapshots(
        &self,
        opts: &ListOpts,
        page_url: Option<&str>,
    ) -> Result<SnapshotPage, BackendError>;

    async fn get_snapshot(&self, snapshot_id: &str) -> Result<Snapshot, BackendError>;

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), BackendError>;
}
