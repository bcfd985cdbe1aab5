//! Local-first table store with dual persistence.
//!
//! The in-memory [`TableStore`] is the single source of truth for reads.
//! Two persisters mirror it: a SQLite-backed local cache
//! ([`LocalCachePersister`]) that loads on startup and saves every mutation,
//! and a remote relational replica ([`RemoteReplicaPersister`]) kept in sync
//! through per-table field transforms. Conflict policy is last writer wins
//! at the row level; the persisters each independently mirror whatever the
//! store currently holds.

pub mod error;
pub mod local;
pub mod remote;
pub mod tables;

pub use error::StoreError;
pub use local::LocalCachePersister;
pub use remote::{from_remote, to_remote, HttpReplica, RemoteReplica, RemoteReplicaPersister};
pub use tables::{ChangeEvent, RawRow, TableKind, TableStore};

use std::sync::Arc;
use tokio::task::JoinHandle;

/// Handles to the running persistence tasks. Dropping these does not stop
/// the tasks; they exit when the store's change feed closes.
pub struct PersistenceHandles {
    pub local: JoinHandle<()>,
    pub remote: Option<JoinHandle<()>>,
}

/// Brings the store to "ready": performs the initial local cache load, then
/// starts the local auto-save and (when a replica is configured) the remote
/// auto-save.
///
/// The ordering matters: the cache load finishes before either auto-save
/// task subscribes, so startup state is never echoed back to disk or to the
/// remote replica.
///
/// # Errors
///
/// Propagates any local cache failure; the store must not be used for
/// durable work until this returns `Ok`.
pub async fn initialize_persistence(
    store: &Arc<TableStore>,
    local: &LocalCachePersister,
    remote: Option<&RemoteReplicaPersister>,
) -> Result<PersistenceHandles, StoreError> {
    let loaded = local.load_into(store).await?;
    tracing::info!(rows = loaded, "local cache persister initialized");

    let local_handle = local.start_auto_save(store);
    let remote_handle = remote.map(|persister| {
        tracing::info!("remote replica persister initialized");
        persister.start_auto_save(store)
    });

    Ok(PersistenceHandles {
        local: local_handle,
        remote: remote_handle,
    })
}
