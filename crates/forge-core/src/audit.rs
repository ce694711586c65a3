//! One best-effort audit row per terminated chat request. A failure to
//! write is logged and swallowed -- audit logging is explicitly
//! non-critical per the concurrency model (it must never fail the request
//! whose outcome it is recording).

use async_trait::async_trait;

use crate::domain::ChatAuditRow;

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, row: ChatAuditRow);
}

pub mod in_memory {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct InMemoryAuditSink {
        rows: Mutex<Vec<ChatAuditRow>>,
    }

    impl InMemoryAuditSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn rows(&self) -> Vec<ChatAuditRow> {
            self.rows.lock().clone()
        }
    }

    #[async_trait]
    impl AuditSink for InMemoryAuditSink {
        async fn record(&self, row: ChatAuditRow) {
            self.rows.lock().push(row);
        }
    }
}

pub use in_memory::InMemoryAuditSink;

#[cfg(feature = "sqlite-backend")]
pub mod sqlite {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use rusqlite::{params, Connection};

    pub struct SqliteAuditSink {
        conn: SyncMutex<Connection>,
    }

    impl SqliteAuditSink {
        pub fn open(path: &str) -> anyhow::Result<Self> {
            let conn = Connection::open(path)?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS chat_audit (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT,
                    user_id TEXT NOT NULL,
                    agent_id TEXT,
                    route TEXT NOT NULL,
                    status_code INTEGER NOT NULL,
                    duration_ms INTEGER NOT NULL,
                    model TEXT,
                    message_preview TEXT NOT NULL,
                    tool_count INTEGER NOT NULL,
                    hitl_triggered INTEGER NOT NULL,
                    warnings_count INTEGER NOT NULL,
                    error_message TEXT,
                    created_at TEXT NOT NULL
                )",
                [],
            )?;
            Ok(SqliteAuditSink { conn: SyncMutex::new(conn) })
        }
    }

    #[async_trait]
    impl AuditSink for SqliteAuditSink {
        async fn record(&self, row: ChatAuditRow) {
            let conn = self.conn.lock();
            let result = conn.execute(
                "INSERT INTO chat_audit (session_id, user_id, agent_id, route, status_code, duration_ms, model,
                    message_preview, tool_count, hitl_triggered, warnings_count, error_message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    row.session_id,
                    row.user_id,
                    row.agent_id,
                    row.route,
                    row.status_code,
                    row.duration_ms,
                    row.model,
                    row.message_preview,
                    row.tool_count,
                    row.hitl_triggered,
                    row.warnings_count,
                    row.error_message,
                    chrono::Utc::now().to_rfc3339(),
                ],
            );
            if let Err(e) = result {
                tracing::warn!(error = %e, "failed to write chat audit row");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> ChatAuditRow {
        ChatAuditRow {
            session_id: Some("s1".to_string()),
            user_id: "u1".to_string(),
            agent_id: None,
            route: "/agent-api/chat".to_string(),
            status_code: 200,
            duration_ms: 42,
            model: Some("claude-3-5-sonnet".to_string()),
            message_preview: ChatAuditRow::truncate_preview("hello"),
            tool_count: 0,
            hitl_triggered: false,
            warnings_count: 0,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn in_memory_sink_records_rows() {
        let sink = InMemoryAuditSink::new();
        sink.record(row()).await;
        assert_eq!(sink.rows().len(), 1);
    }
}
