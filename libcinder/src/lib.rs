//! Client-side snapshot management for the Cinder CSI driver.
//!
//! [`SnapshotManager`] wraps a [`BlockStorage`] handle and exposes the
//! snapshot lifecycle used by the provisioning controller: create, list, get,
//! delete and waiting until a snapshot becomes available.

pub mod backend;
pub mod config;
pub mod error;
pub mod metrics;
pub mod snapshots;
pub mod wait;

pub use backend::{BlockStorage, CreateOpts, ListOpts, Snapshot, SnapshotPage};
pub use error::{BackendError, SnapshotError, WaitReadyError};
pub use snapshots::{SnapshotListing, SnapshotManager};
