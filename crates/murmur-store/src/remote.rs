//! Remote relational replica persister.
//!
//! Mirrors every store mutation to an external relational database through
//! per-table field transforms that rename camelCase store fields to the
//! remote snake_case schema (and back). Replication is fire-and-forget
//! relative to the in-memory mutation: failures are logged and retried on
//! the persister's own interval, never surfaced to the mutating caller.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::error::StoreError;
use crate::tables::{ChangeEvent, RawRow, TableKind, TableStore};

/// Interval between retry sweeps of failed replica writes.
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Maximum number of failed writes held for retry. Beyond this the oldest
/// pending write is dropped with a warning; the replica is eventually
/// consistent, not a journal.
const RETRY_QUEUE_CAP: usize = 1_024;

/// The known store-side fields per table, paired with their remote column
/// names. The transforms are total over this set: unknown fields are
/// dropped, absent optional fields stay absent.
const USER_FIELDS: &[(&str, &str)] = &[
    ("id", "id"),
    ("email", "email"),
    ("firstName", "first_name"),
    ("lastName", "last_name"),
    ("configId", "config_id"),
    ("systemPrompt", "system_prompt"),
];

const SESSION_FIELDS: &[(&str, &str)] = &[
    ("id", "id"),
    ("userId", "user_id"),
    ("groupId", "group_id"),
    ("timestamp", "timestamp"),
];

const MESSAGE_FIELDS: &[(&str, &str)] = &[
    ("id", "id"),
    ("sessionId", "session_id"),
    ("role", "role"),
    ("content", "content"),
    ("timestamp", "timestamp"),
    ("metadata", "metadata"),
];

fn fields_for(table: TableKind) -> &'static [(&'static str, &'static str)] {
    match table {
        TableKind::Users => USER_FIELDS,
        TableKind::Sessions => SESSION_FIELDS,
        TableKind::Messages => MESSAGE_FIELDS,
    }
}

/// Transforms a store row into the remote schema shape.
///
/// Message metadata is serialized to a JSON string column; every other
/// field is a plain rename. Absent optional fields are omitted (the remote
/// treats missing columns as NULL).
pub fn to_remote(table: TableKind, row: &RawRow) -> RawRow {
    let mut out = RawRow::new();
    for (local, remote) in fields_for(table) {
        let Some(value) = row.get(*local) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        let value = if table == TableKind::Messages && *local == "metadata" {
            Value::String(value.to_string())
        } else {
            value.clone()
        };
        out.insert((*remote).to_string(), value);
    }
    out
}

/// Transforms a remote row back into the store shape. The inverse of
/// [`to_remote`]: NULL columns become absent fields, and message metadata is
/// parsed back out of its string column (unparseable metadata is dropped).
pub fn from_remote(table: TableKind, row: &RawRow) -> RawRow {
    let mut out = RawRow::new();
    for (local, remote) in fields_for(table) {
        let Some(value) = row.get(*remote) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        let value = if table == TableKind::Messages && *local == "metadata" {
            match value {
                Value::String(s) => match serde_json::from_str::<Value>(s) {
                    Ok(parsed) => parsed,
                    Err(_) => continue,
                },
                other => other.clone(),
            }
        } else {
            value.clone()
        };
        out.insert((*local).to_string(), value);
    }
    out
}

/// Seam for the remote relational database.
///
/// The production implementation is [`HttpReplica`]; tests substitute an
/// in-memory recorder.
#[async_trait]
pub trait RemoteReplica: Send + Sync {
    /// Inserts or replaces a row (already in remote shape).
    async fn upsert(&self, table: TableKind, row_id: &str, row: &RawRow)
        -> Result<(), StoreError>;

    /// Deletes a row. Deleting an absent row must succeed.
    async fn delete(&self, table: TableKind, row_id: &str) -> Result<(), StoreError>;
}

/// REST-style replica client (PostgREST-compatible endpoints).
pub struct HttpReplica {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpReplica {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn table_url(&self, table: TableKind) -> String {
        format!(
            "{}/rest/v1/{}",
            self.base_url.trim_end_matches('/'),
            table.as_str()
        )
    }
}

#[async_trait]
impl RemoteReplica for HttpReplica {
    async fn upsert(
        &self,
        table: TableKind,
        row_id: &str,
        row: &RawRow,
    ) -> Result<(), StoreError> {
        let response = self
            .http
            .post(self.table_url(table))
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Prefer", "resolution=merge-duplicates")
            .json(&vec![Value::Object(row.clone())])
            .send()
            .await
            .map_err(|e| StoreError::Remote(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StoreError::Remote(format!(
                "upsert {}/{} failed with status {}",
                table.as_str(),
                row_id,
                response.status()
            )));
        }
        Ok(())
    }

    async fn delete(&self, table: TableKind, row_id: &str) -> Result<(), StoreError> {
        let url = format!("{}?id=eq.{}", self.table_url(table), row_id);
        let response = self
            .http
            .delete(url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| StoreError::Remote(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StoreError::Remote(format!(
                "delete {}/{} failed with status {}",
                table.as_str(),
                row_id,
                response.status()
            )));
        }
        Ok(())
    }
}

/// One replica write that failed and is waiting for the retry sweep.
#[derive(Debug, Clone)]
struct PendingWrite {
    table: TableKind,
    row_id: String,
    /// Remote-shaped row, or `None` for a deletion.
    row: Option<RawRow>,
}

/// Drives the remote replica from the store's change feed.
pub struct RemoteReplicaPersister {
    replica: Arc<dyn RemoteReplica>,
}

impl RemoteReplicaPersister {
    pub fn new(replica: Arc<dyn RemoteReplica>) -> Self {
        Self { replica }
    }

    /// Spawns the auto-save task. Failed writes go into a bounded retry
    /// queue swept every [`RETRY_INTERVAL`]; the task exits when the store's
    /// change feed closes and the queue has drained its final attempt.
    pub fn start_auto_save(&self, store: &Arc<TableStore>) -> JoinHandle<()> {
        let mut rx = store.subscribe_changes();
        let replica = self.replica.clone();

        tokio::spawn(async move {
            let mut retry_queue: VecDeque<PendingWrite> = VecDeque::new();
            let mut ticker = tokio::time::interval(RETRY_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Ok(event) => {
                            let write = remote_write(&event);
                            if let Err(e) = attempt(&*replica, &write).await {
                                tracing::warn!(
                                    table = write.table.as_str(),
                                    row_id = %write.row_id,
                                    "remote replica write failed, queued for retry: {}",
                                    e
                                );
                                enqueue_retry(&mut retry_queue, write);
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "remote replica persister lagged behind mutations");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            sweep_retries(&*replica, &mut retry_queue).await;
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        sweep_retries(&*replica, &mut retry_queue).await;
                    }
                }
            }
        })
    }
}

fn remote_write(event: &ChangeEvent) -> PendingWrite {
    PendingWrite {
        table: event.table,
        row_id: event.row_id.clone(),
        row: event.row.as_ref().map(|row| to_remote(event.table, row)),
    }
}

fn enqueue_retry(queue: &mut VecDeque<PendingWrite>, write: PendingWrite) {
    if queue.len() >= RETRY_QUEUE_CAP {
        if let Some(dropped) = queue.pop_front() {
            tracing::warn!(
                table = dropped.table.as_str(),
                row_id = %dropped.row_id,
                "remote retry queue full, dropping oldest pending write"
            );
        }
    }
    queue.push_back(write);
}

async fn attempt(replica: &dyn RemoteReplica, write: &PendingWrite) -> Result<(), StoreError> {
    match &write.row {
        Some(row) => replica.upsert(write.table, &write.row_id, row).await,
        None => replica.delete(write.table, &write.row_id).await,
    }
}

/// Retries every queued write once, requeueing the ones that fail again.
async fn sweep_retries(replica: &dyn RemoteReplica, queue: &mut VecDeque<PendingWrite>) {
    let pending = queue.len();
    for _ in 0..pending {
        let Some(write) = queue.pop_front() else {
            break;
        };
        if let Err(e) = attempt(replica, &write).await {
            tracing::debug!(
                table = write.table.as_str(),
                row_id = %write.row_id,
                "remote replica retry failed, keeping queued: {}",
                e
            );
            queue.push_back(write);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> RawRow {
        value.as_object().expect("object").clone()
    }

    #[test]
    fn user_transform_renames_and_omits_absent_optionals() {
        let row = obj(json!({
            "id": "u1",
            "configId": "cfg-1",
            "systemPrompt": "be kind"
        }));

        let remote = to_remote(TableKind::Users, &row);
        assert_eq!(remote["id"], "u1");
        assert_eq!(remote["config_id"], "cfg-1");
        assert_eq!(remote["system_prompt"], "be kind");
        assert!(!remote.contains_key("email"));
        assert!(!remote.contains_key("first_name"));

        let back = from_remote(TableKind::Users, &remote);
        assert_eq!(back, row);
    }

    #[test]
    fn session_transform_is_total_over_known_fields() {
        let row = obj(json!({
            "id": "s1",
            "userId": "u1",
            "groupId": "g1",
            "timestamp": 1234,
            "unknownField": true
        }));

        let remote = to_remote(TableKind::Sessions, &row);
        assert_eq!(remote["user_id"], "u1");
        assert_eq!(remote["group_id"], "g1");
        assert_eq!(remote["timestamp"], 1234);
        assert!(!remote.contains_key("unknownField"));
        assert!(!remote.contains_key("unknown_field"));
    }

    #[test]
    fn message_metadata_is_stringified_and_parsed_back() {
        let row = obj(json!({
            "id": "m1",
            "sessionId": "s1",
            "role": "assistant",
            "content": "hello",
            "timestamp": 99,
            "metadata": {"prosody": {"joy": 0.8}}
        }));

        let remote = to_remote(TableKind::Messages, &row);
        let metadata = remote["metadata"].as_str().expect("stringified metadata");
        assert!(metadata.contains("prosody"));

        let back = from_remote(TableKind::Messages, &remote);
        assert_eq!(back["metadata"], json!({"prosody": {"joy": 0.8}}));
        assert_eq!(back, row);
    }

    #[test]
    fn null_remote_columns_become_absent_fields() {
        let remote = obj(json!({
            "id": "u2",
            "email": null,
            "first_name": "Ada",
            "config_id": null
        }));

        let local = from_remote(TableKind::Users, &remote);
        assert_eq!(local["id"], "u2");
        assert_eq!(local["firstName"], "Ada");
        assert!(!local.contains_key("email"));
        assert!(!local.contains_key("configId"));
    }

    struct RecordingReplica {
        calls: std::sync::Mutex<Vec<(String, String, bool)>>,
        fail_first: std::sync::atomic::AtomicBool,
    }

    impl RecordingReplica {
        fn new(fail_first: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: std::sync::Mutex::new(Vec::new()),
                fail_first: std::sync::atomic::AtomicBool::new(fail_first),
            })
        }
    }

    #[async_trait]
    impl RemoteReplica for RecordingReplica {
        async fn upsert(
            &self,
            table: TableKind,
            row_id: &str,
            _row: &RawRow,
        ) -> Result<(), StoreError> {
            if self
                .fail_first
                .swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                return Err(StoreError::Remote("transient".to_string()));
            }
            self.calls.lock().expect("lock").push((
                table.as_str().to_string(),
                row_id.to_string(),
                true,
            ));
            Ok(())
        }

        async fn delete(&self, table: TableKind, row_id: &str) -> Result<(), StoreError> {
            self.calls.lock().expect("lock").push((
                table.as_str().to_string(),
                row_id.to_string(),
                false,
            ));
            Ok(())
        }
    }

    #[tokio::test]
    async fn auto_save_replicates_mutations() {
        let replica = RecordingReplica::new(false);
        let store = Arc::new(TableStore::new());
        let persister = RemoteReplicaPersister::new(replica.clone());
        let handle = persister.start_auto_save(&store);

        store.create_user(&murmur_types::User::new("u1")).await;
        store.delete_user("u1").await;
        drop(store);
        handle.await.expect("persister task should exit");

        let calls = replica.calls.lock().expect("lock").clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], ("users".to_string(), "u1".to_string(), true));
        assert_eq!(calls[1], ("users".to_string(), "u1".to_string(), false));
    }

    #[tokio::test]
    async fn failed_write_is_retried_not_surfaced() {
        let replica = RecordingReplica::new(true);
        let store = Arc::new(TableStore::new());
        let persister = RemoteReplicaPersister::new(replica.clone());
        let handle = persister.start_auto_save(&store);

        // The first upsert fails; the mutation itself still succeeds and
        // the write lands on the final drain sweep.
        store.create_user(&murmur_types::User::new("u2")).await;
        drop(store);
        handle.await.expect("persister task should exit");

        let calls = replica.calls.lock().expect("lock").clone();
        assert_eq!(calls, vec![("users".to_string(), "u2".to_string(), true)]);
    }
}
