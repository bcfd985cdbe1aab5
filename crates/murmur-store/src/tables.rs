//! The in-memory table store: three tables (users, sessions, messages),
//! last-writer-wins at row granularity, and a broadcast change feed that the
//! persisters subscribe to.
//!
//! The store is the single source of truth for reads. Rows are stored as
//! loosely-typed JSON maps (the shape that both persisters speak); the typed
//! accessors at the bottom of this module validate and coerce at the store
//! boundary so call sites never touch raw rows.

use std::collections::HashMap;

use murmur_types::{new_id, Message, MessageRole, Session, User};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

/// Capacity of the change-event broadcast channel. Persisters that lag
/// behind this many mutations will observe a `Lagged` error and resync.
const CHANGE_CHANNEL_CAPACITY: usize = 1_024;

/// The three persisted tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Users,
    Sessions,
    Messages,
}

impl TableKind {
    /// All tables, in a fixed order used by the persisters.
    pub const ALL: [TableKind; 3] = [TableKind::Users, TableKind::Sessions, TableKind::Messages];

    /// Returns the table name used on disk and in the remote schema.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Sessions => "sessions",
            Self::Messages => "messages",
        }
    }

    /// Attempts to parse a table name. Returns `None` for unknown names.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "users" => Some(Self::Users),
            "sessions" => Some(Self::Sessions),
            "messages" => Some(Self::Messages),
            _ => None,
        }
    }
}

/// A loosely-typed row as held in memory and mirrored by the persisters.
pub type RawRow = serde_json::Map<String, Value>;

/// One mutation of the store, emitted to the change feed after the
/// in-memory write has completed.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub table: TableKind,
    pub row_id: String,
    /// The full row after the write, or `None` for a deletion.
    pub row: Option<RawRow>,
}

/// The in-memory table store.
///
/// All operations take the single table lock; mutations are therefore
/// serialized (last writer wins) and reads see a consistent snapshot.
pub struct TableStore {
    tables: RwLock<HashMap<TableKind, HashMap<String, RawRow>>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Default for TableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TableStore {
    /// Creates an empty store with the three default tables.
    pub fn new() -> Self {
        let mut tables = HashMap::new();
        for kind in TableKind::ALL {
            tables.insert(kind, HashMap::new());
        }
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            tables: RwLock::new(tables),
            changes,
        }
    }

    /// Subscribes to the mutation feed. Each persister holds its own
    /// receiver; a send with no receivers is silently dropped.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// Replaces (or inserts) a row. Last writer wins.
    pub async fn set_row(&self, table: TableKind, row_id: &str, row: RawRow) {
        {
            let mut tables = self.tables.write().await;
            tables
                .entry(table)
                .or_default()
                .insert(row_id.to_string(), row.clone());
        }
        let _ = self.changes.send(ChangeEvent {
            table,
            row_id: row_id.to_string(),
            row: Some(row),
        });
    }

    /// Deletes a row if present. Deleting an absent row is a no-op that
    /// still emits a change event (the persisters treat deletes as
    /// idempotent).
    pub async fn del_row(&self, table: TableKind, row_id: &str) {
        {
            let mut tables = self.tables.write().await;
            if let Some(rows) = tables.get_mut(&table) {
                rows.remove(row_id);
            }
        }
        let _ = self.changes.send(ChangeEvent {
            table,
            row_id: row_id.to_string(),
            row: None,
        });
    }

    /// Returns a copy of a raw row, if present.
    pub async fn get_row(&self, table: TableKind, row_id: &str) -> Option<RawRow> {
        let tables = self.tables.read().await;
        tables.get(&table).and_then(|rows| rows.get(row_id)).cloned()
    }

    /// Returns a snapshot of an entire table.
    pub async fn table_snapshot(&self, table: TableKind) -> HashMap<String, RawRow> {
        let tables = self.tables.read().await;
        tables.get(&table).cloned().unwrap_or_default()
    }

    // ---- entity operations -------------------------------------------------

    /// Persists a user row. Absent optional fields are omitted from the row
    /// rather than stored as nulls.
    pub async fn create_user(&self, user: &User) {
        let mut row = RawRow::new();
        row.insert("id".to_string(), Value::String(user.id.clone()));
        insert_opt(&mut row, "email", user.email.as_deref());
        insert_opt(&mut row, "firstName", user.first_name.as_deref());
        insert_opt(&mut row, "lastName", user.last_name.as_deref());
        insert_opt(&mut row, "configId", user.config_id.as_deref());
        insert_opt(&mut row, "systemPrompt", user.system_prompt.as_deref());
        self.set_row(TableKind::Users, &user.id.clone(), row).await;
    }

    /// Removes a user row. Idempotent.
    pub async fn delete_user(&self, user_id: &str) {
        self.del_row(TableKind::Users, user_id).await;
    }

    /// Mints a session id, persists the session row, and returns the id.
    pub async fn create_session(&self, user_id: &str, group_id: Option<&str>) -> String {
        let session_id = new_id();
        let mut row = RawRow::new();
        row.insert("id".to_string(), Value::String(session_id.clone()));
        row.insert("userId".to_string(), Value::String(user_id.to_string()));
        insert_opt(&mut row, "groupId", group_id);
        row.insert("timestamp".to_string(), Value::from(now_millis()));
        self.set_row(TableKind::Sessions, &session_id, row).await;
        session_id
    }

    /// Records an externally reported session (e.g. from the provider's
    /// `chat_metadata` frame) under the provider-assigned id.
    pub async fn record_session(&self, session_id: &str, user_id: &str, group_id: Option<&str>) {
        let mut row = RawRow::new();
        row.insert("id".to_string(), Value::String(session_id.to_string()));
        row.insert("userId".to_string(), Value::String(user_id.to_string()));
        insert_opt(&mut row, "groupId", group_id);
        row.insert("timestamp".to_string(), Value::from(now_millis()));
        self.set_row(TableKind::Sessions, session_id, row).await;
    }

    /// Mints a message id, persists the message row, and returns the id.
    pub async fn add_message(
        &self,
        session_id: &str,
        content: &str,
        role: MessageRole,
    ) -> String {
        self.add_message_with_metadata(session_id, content, role, None)
            .await
    }

    /// As [`add_message`](Self::add_message), with optional provider
    /// metadata attached.
    pub async fn add_message_with_metadata(
        &self,
        session_id: &str,
        content: &str,
        role: MessageRole,
        metadata: Option<Value>,
    ) -> String {
        let message_id = new_id();
        let mut row = RawRow::new();
        row.insert("id".to_string(), Value::String(message_id.clone()));
        row.insert(
            "sessionId".to_string(),
            Value::String(session_id.to_string()),
        );
        row.insert("role".to_string(), Value::String(role.as_str().to_string()));
        row.insert("content".to_string(), Value::String(content.to_string()));
        row.insert("timestamp".to_string(), Value::from(now_millis()));
        if let Some(metadata) = metadata {
            row.insert("metadata".to_string(), metadata);
        }
        self.set_row(TableKind::Messages, &message_id, row).await;
        message_id
    }

    // ---- typed accessors ---------------------------------------------------

    /// Reads a user row and coerces it to the typed record. Returns `None`
    /// when the row is absent; absent optional fields come back as `None`.
    pub async fn get_user(&self, user_id: &str) -> Option<User> {
        let row = self.get_row(TableKind::Users, user_id).await?;
        Some(User {
            id: coerce_string(row.get("id")).unwrap_or_else(|| user_id.to_string()),
            email: coerce_string(row.get("email")),
            first_name: coerce_string(row.get("firstName")),
            last_name: coerce_string(row.get("lastName")),
            config_id: coerce_string(row.get("configId")),
            system_prompt: coerce_string(row.get("systemPrompt")),
        })
    }

    /// Reads a session row and coerces it to the typed record.
    pub async fn get_session(&self, session_id: &str) -> Option<Session> {
        let row = self.get_row(TableKind::Sessions, session_id).await?;
        Some(Session {
            id: coerce_string(row.get("id")).unwrap_or_else(|| session_id.to_string()),
            user_id: coerce_string(row.get("userId")).unwrap_or_default(),
            group_id: coerce_string(row.get("groupId")),
            timestamp: coerce_i64(row.get("timestamp")).unwrap_or_default(),
        })
    }

    /// Reads a message row and coerces it to the typed record. Rows with an
    /// unrecognized role default to the user role rather than failing the
    /// read.
    pub async fn get_message(&self, message_id: &str) -> Option<Message> {
        let row = self.get_row(TableKind::Messages, message_id).await?;
        let role = coerce_string(row.get("role"))
            .and_then(|s| MessageRole::parse(&s))
            .unwrap_or(MessageRole::User);
        Some(Message {
            id: coerce_string(row.get("id")).unwrap_or_else(|| message_id.to_string()),
            session_id: coerce_string(row.get("sessionId")).unwrap_or_default(),
            role,
            content: coerce_string(row.get("content")).unwrap_or_default(),
            timestamp: coerce_i64(row.get("timestamp")).unwrap_or_default(),
            metadata: row.get("metadata").cloned(),
        })
    }
}

fn insert_opt(row: &mut RawRow, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        row.insert(key.to_string(), Value::String(value.to_string()));
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Coerces a raw cell to a string: strings pass through, scalars are
/// stringified, null/absent become `None`.
fn coerce_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Coerces a raw cell to an i64, accepting numeric strings from older cache
/// snapshots.
fn coerce_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
