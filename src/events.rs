use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Pool, Row, Sqlite, sqlite::SqlitePoolOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    #[error("invalid events table name: {0}")]
    InvalidTable(String),
    #[error("event store connect failed: {0}")]
    Connect(String),
    #[error("event store query failed: {0}")]
    Query(String),
    #[error("event payload decode failed: {0}")]
    Decode(String),
}

/// One persisted Chat UI message event. Written by the front-end's own
/// backend; this service only ever reads them.
#[derive(Debug, Clone)]
pub struct ConversationEvent {
    pub conversation_id: String,
    /// Creation time in milliseconds since the epoch; the replay order key.
    pub created_at: i64,
    /// The stored document as-is. Shape varies across Chat UI builds, see
    /// `history::extract_role_content`.
    pub payload: Value,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// All events for a conversation, ordered ascending by creation time.
    async fn list_events(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ConversationEvent>, EventStoreError>;
}

/// In-memory store for tests and for running without a Chat UI database.
#[derive(Clone, Default)]
pub struct MemoryEventStore {
    inner: Arc<RwLock<Vec<ConversationEvent>>>,
}

impl MemoryEventStore {
    pub async fn push(&self, conversation_id: &str, created_at: i64, payload: Value) {
        let mut guard = self.inner.write().await;
        guard.push(ConversationEvent {
            conversation_id: conversation_id.to_string(),
            created_at,
            payload,
        });
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn list_events(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ConversationEvent>, EventStoreError> {
        let guard = self.inner.read().await;
        let mut out: Vec<ConversationEvent> = guard
            .iter()
            .filter(|event| event.conversation_id == conversation_id)
            .cloned()
            .collect();
        out.sort_by_key(|event| event.created_at);
        Ok(out)
    }
}

#[derive(Clone, Debug)]
pub struct SqliteEventStore {
    pool: Pool<Sqlite>,
    table: String,
}

impl SqliteEventStore {
    pub async fn new(dsn: &str, table: &str) -> Result<Self, EventStoreError> {
        // The table name is interpolated into SQL below; it comes from
        // configuration, not request input, but reject anything that is not
        // a bare identifier.
        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(EventStoreError::InvalidTable(table.to_string()));
        }
        ensure_sqlite_file(dsn).map_err(EventStoreError::Connect)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(
                dsn.parse::<sqlx::sqlite::SqliteConnectOptions>()
                    .map_err(|err| EventStoreError::Connect(err.to_string()))?
                    .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                    .busy_timeout(std::time::Duration::from_secs(5)),
            )
            .await
            .map_err(|err| EventStoreError::Connect(err.to_string()))?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             conversation_id TEXT NOT NULL,\
             created_at INTEGER NOT NULL,\
             payload TEXT NOT NULL\
             )",
        ))
        .execute(&pool)
        .await
        .map_err(|err| EventStoreError::Connect(err.to_string()))?;
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn list_events(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ConversationEvent>, EventStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT conversation_id, created_at, payload FROM {} \
             WHERE conversation_id = ? ORDER BY created_at ASC, rowid ASC",
            self.table,
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| EventStoreError::Query(err.to_string()))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let conversation_id: String = row
                .try_get(0)
                .map_err(|err| EventStoreError::Decode(err.to_string()))?;
            let created_at: i64 = row
                .try_get(1)
                .map_err(|err| EventStoreError::Decode(err.to_string()))?;
            let payload_text: String = row
                .try_get(2)
                .map_err(|err| EventStoreError::Decode(err.to_string()))?;
            let payload: Value = serde_json::from_str(&payload_text)
                .map_err(|err| EventStoreError::Decode(err.to_string()))?;
            out.push(ConversationEvent {
                conversation_id,
                created_at,
                payload,
            });
        }
        Ok(out)
    }
}

fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if dsn.contains(":memory:") || dsn.contains("mode=memory") {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_store_orders_by_created_at() {
        let store = MemoryEventStore::default();
        store.push("c1", 20, json!({"role": "assistant"})).await;
        store.push("c1", 10, json!({"role": "user"})).await;
        store.push("c2", 5, json!({"role": "user"})).await;

        let events = store.list_events("c1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].created_at, 10);
        assert_eq!(events[1].created_at, 20);
    }

    #[tokio::test]
    async fn sqlite_store_rejects_bad_table_names() {
        let err = SqliteEventStore::new("sqlite://:memory:", "events; DROP TABLE x")
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidTable(_)));
    }

    #[tokio::test]
    async fn sqlite_store_round_trips_events() {
        let dir = tempfile::tempdir().unwrap();
        let dsn = format!("sqlite://{}", dir.path().join("chatui.db").display());
        let store = SqliteEventStore::new(&dsn, "message_events").await.unwrap();

        sqlx::query(
            "INSERT INTO message_events (conversation_id, created_at, payload) VALUES (?, ?, ?)",
        )
        .bind("c1")
        .bind(100i64)
        .bind(json!({"role": "user", "content": "a"}).to_string())
        .execute(&store.pool)
        .await
        .unwrap();

        let events = store.list_events("c1").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["content"], "a");
        assert!(store.list_events("missing").await.unwrap().is_empty());
    }
}
