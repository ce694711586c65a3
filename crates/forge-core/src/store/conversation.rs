//! Conversation persistence: sessions and their message history. Three
//! variants share one trait (local SQL, shared SQL pool, keyed store) per
//! spec -- here: an in-memory keyed-store stand-in used in tests/dev, and a
//! local SQLite-backed implementation for single-process deployments.
//!
//! `role="system", content="[COMPLETE]"` is the termination marker: any
//! store implementing `get_incomplete_sessions` must exclude sessions whose
//! most recent message is that marker.

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::domain::{ConversationMessage, MessageRole, Session};

#[derive(Debug, Error)]
pub enum ConversationStoreError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session {0} is owned by a different user")]
    OwnershipViolation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_session(&self, session: Session) -> Result<(), ConversationStoreError>;

    /// Appends a message. Sticky ownership: the session's `user_id` is set
    /// by its first message and is immutable thereafter.
    async fn persist_message(&self, message: ConversationMessage) -> Result<(), ConversationStoreError>;

    async fn get_history(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationMessage>, ConversationStoreError>;

    async fn list_sessions(&self, user_id: &str) -> Result<Vec<Session>, ConversationStoreError>;

    async fn delete_session(&self, session_id: &str, user_id: &str) -> Result<(), ConversationStoreError>;

    async fn get_session_user_id(&self, session_id: &str) -> Result<Option<String>, ConversationStoreError>;

    /// Sessions whose most recent message is not the `[COMPLETE]` marker.
    async fn get_incomplete_sessions(&self, user_id: &str) -> Result<Vec<Session>, ConversationStoreError>;

    async fn close(&self) -> Result<(), ConversationStoreError>;
}

pub mod in_memory {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct InMemoryConversationStore {
        sessions: Mutex<HashMap<String, Session>>,
        messages: Mutex<HashMap<String, Vec<ConversationMessage>>>,
    }

    impl InMemoryConversationStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl ConversationStore for InMemoryConversationStore {
        async fn create_session(&self, session: Session) -> Result<(), ConversationStoreError> {
            self.sessions.lock().entry(session.id.clone()).or_insert(session);
            Ok(())
        }

        async fn persist_message(&self, message: ConversationMessage) -> Result<(), ConversationStoreError> {
            {
                let sessions = self.sessions.lock();
                if let Some(session) = sessions.get(&message.session_id) {
                    if session.user_id != message.user_id {
                        return Err(ConversationStoreError::OwnershipViolation(message.session_id));
                    }
                }
            }
            self.messages
                .lock()
                .entry(message.session_id.clone())
                .or_default()
                .push(message);
            Ok(())
        }

        async fn get_history(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationMessage>, ConversationStoreError> {
            let messages = self.messages.lock();
            let Some(all) = messages.get(session_id) else {
                return Ok(Vec::new());
            };
            let start = all.len().saturating_sub(limit);
            Ok(all[start..].to_vec())
        }

        async fn list_sessions(&self, user_id: &str) -> Result<Vec<Session>, ConversationStoreError> {
            Ok(self
                .sessions
                .lock()
                .values()
                .filter(|s| s.user_id == user_id)
                .cloned()
                .collect())
        }

        async fn delete_session(&self, session_id: &str, user_id: &str) -> Result<(), ConversationStoreError> {
            let mut sessions = self.sessions.lock();
            match sessions.get(session_id) {
                Some(session) if session.user_id == user_id => {
                    sessions.remove(session_id);
                    self.messages.lock().remove(session_id);
                    Ok(())
                }
                Some(_) => Err(ConversationStoreError::OwnershipViolation(session_id.to_string())),
                None => Err(ConversationStoreError::NotFound(session_id.to_string())),
            }
        }

        async fn get_session_user_id(&self, session_id: &str) -> Result<Option<String>, ConversationStoreError> {
            Ok(self.sessions.lock().get(session_id).map(|s| s.user_id.clone()))
        }

        async fn get_incomplete_sessions(&self, user_id: &str) -> Result<Vec<Session>, ConversationStoreError> {
            let sessions = self.sessions.lock();
            let messages = self.messages.lock();
            Ok(sessions
                .values()
                .filter(|s| s.user_id == user_id)
                .filter(|s| {
                    messages
                        .get(&s.id)
                        .and_then(|m| m.last())
                        .map(|m| !m.is_completion_marker())
                        .unwrap_or(true)
                })
                .cloned()
                .collect())
        }

        async fn close(&self) -> Result<(), ConversationStoreError> {
            Ok(())
        }
    }
}

pub use in_memory::InMemoryConversationStore;

#[cfg(feature = "sqlite-backend")]
pub mod sqlite {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use rusqlite::{params, Connection, OptionalExtension};

    pub struct SqliteConversationStore {
        conn: SyncMutex<Connection>,
    }

    impl SqliteConversationStore {
        pub fn open(path: &str) -> anyhow::Result<Self> {
            let conn = Connection::open(path)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    agent_id TEXT,
                    created_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS conversation_messages (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL,
                    stage TEXT NOT NULL,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    agent_id TEXT,
                    user_id TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );",
            )?;
            Ok(SqliteConversationStore { conn: SyncMutex::new(conn) })
        }

        fn role_to_str(role: MessageRole) -> &'static str {
            match role {
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
                MessageRole::Tool => "tool",
                MessageRole::System => "system",
            }
        }

        fn role_from_str(s: &str) -> MessageRole {
            match s {
                "assistant" => MessageRole::Assistant,
                "tool" => MessageRole::Tool,
                "system" => MessageRole::System,
                _ => MessageRole::User,
            }
        }
    }

    #[async_trait]
    impl ConversationStore for SqliteConversationStore {
        async fn create_session(&self, session: Session) -> Result<(), ConversationStoreError> {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT OR IGNORE INTO sessions (id, user_id, agent_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![session.id, session.user_id, session.agent_id, session.created_at.to_rfc3339()],
            )
            .map_err(|e| ConversationStoreError::Storage(e.to_string()))?;
            Ok(())
        }

        async fn persist_message(&self, message: ConversationMessage) -> Result<(), ConversationStoreError> {
            let conn = self.conn.lock();
            let owner: Option<String> = conn
                .query_row(
                    "SELECT user_id FROM sessions WHERE id = ?1",
                    params![message.session_id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(|e| ConversationStoreError::Storage(e.to_string()))?;
            if let Some(owner) = owner {
                if owner != message.user_id {
                    return Err(ConversationStoreError::OwnershipViolation(message.session_id));
                }
            }
            conn.execute(
                "INSERT INTO conversation_messages (session_id, stage, role, content, agent_id, user_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    message.session_id,
                    message.stage,
                    Self::role_to_str(message.role),
                    message.content,
                    message.agent_id,
                    message.user_id,
                    message.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| ConversationStoreError::Storage(e.to_string()))?;
            Ok(())
        }

        async fn get_history(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationMessage>, ConversationStoreError> {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT session_id, stage, role, content, agent_id, user_id, created_at
                     FROM conversation_messages WHERE session_id = ?1 ORDER BY seq DESC LIMIT ?2",
                )
                .map_err(|e| ConversationStoreError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(params![session_id, limit as i64], |r| {
                    let role: String = r.get(2)?;
                    let created_at: String = r.get(6)?;
                    Ok(ConversationMessage {
                        session_id: r.get(0)?,
                        stage: r.get(1)?,
                        role: Self::role_from_str(&role),
                        content: r.get(3)?,
                        agent_id: r.get(4)?,
                        user_id: r.get(5)?,
                        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                            .unwrap_or_else(|_| Utc::now().into())
                            .with_timezone(&Utc),
                    })
                })
                .map_err(|e| ConversationStoreError::Storage(e.to_string()))?;
            let mut messages: Vec<ConversationMessage> =
                rows.collect::<Result<_, _>>().map_err(|e| ConversationStoreError::Storage(e.to_string()))?;
            messages.reverse();
            Ok(messages)
        }

        async fn list_sessions(&self, user_id: &str) -> Result<Vec<Session>, ConversationStoreError> {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare("SELECT id, user_id, agent_id, created_at FROM sessions WHERE user_id = ?1")
                .map_err(|e| ConversationStoreError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(params![user_id], |r| {
                    let created_at: String = r.get(3)?;
                    Ok(Session {
                        id: r.get(0)?,
                        user_id: r.get(1)?,
                        agent_id: r.get(2)?,
                        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                            .unwrap_or_else(|_| Utc::now().into())
                            .with_timezone(&Utc),
                    })
                })
                .map_err(|e| ConversationStoreError::Storage(e.to_string()))?;
            rows.collect::<Result<_, _>>().map_err(|e| ConversationStoreError::Storage(e.to_string()))
        }

        async fn delete_session(&self, session_id: &str, user_id: &str) -> Result<(), ConversationStoreError> {
            let conn = self.conn.lock();
            let owner: Option<String> = conn
                .query_row("SELECT user_id FROM sessions WHERE id = ?1", params![session_id], |r| r.get(0))
                .optional()
                .map_err(|e| ConversationStoreError::Storage(e.to_string()))?;
            match owner {
                None => Err(ConversationStoreError::NotFound(session_id.to_string())),
                Some(owner) if owner != user_id => Err(ConversationStoreError::OwnershipViolation(session_id.to_string())),
                Some(_) => {
                    conn.execute("DELETE FROM conversation_messages WHERE session_id = ?1", params![session_id])
                        .map_err(|e| ConversationStoreError::Storage(e.to_string()))?;
                    conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])
                        .map_err(|e| ConversationStoreError::Storage(e.to_string()))?;
                    Ok(())
                }
            }
        }

        async fn get_session_user_id(&self, session_id: &str) -> Result<Option<String>, ConversationStoreError> {
            let conn = self.conn.lock();
            conn.query_row("SELECT user_id FROM sessions WHERE id = ?1", params![session_id], |r| r.get(0))
                .optional()
                .map_err(|e| ConversationStoreError::Storage(e.to_string()))
        }

        async fn get_incomplete_sessions(&self, user_id: &str) -> Result<Vec<Session>, ConversationStoreError> {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT s.id, s.user_id, s.agent_id, s.created_at FROM sessions s
                     WHERE s.user_id = ?1 AND NOT EXISTS (
                        SELECT 1 FROM conversation_messages m
                        WHERE m.session_id = s.id
                        AND m.seq = (SELECT MAX(seq) FROM conversation_messages WHERE session_id = s.id)
                        AND m.role = 'system' AND m.content = '[COMPLETE]'
                     )",
                )
                .map_err(|e| ConversationStoreError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(params![user_id], |r| {
                    let created_at: String = r.get(3)?;
                    Ok(Session {
                        id: r.get(0)?,
                        user_id: r.get(1)?,
                        agent_id: r.get(2)?,
                        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                            .unwrap_or_else(|_| Utc::now().into())
                            .with_timezone(&Utc),
                    })
                })
                .map_err(|e| ConversationStoreError::Storage(e.to_string()))?;
            rows.collect::<Result<_, _>>().map_err(|e| ConversationStoreError::Storage(e.to_string()))
        }

        async fn close(&self) -> Result<(), ConversationStoreError> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, user: &str) -> Session {
        Session {
            id: id.to_string(),
            user_id: user.to_string(),
            agent_id: None,
            created_at: Utc::now(),
        }
    }

    fn message(session_id: &str, user: &str, role: MessageRole, content: &str) -> ConversationMessage {
        ConversationMessage {
            session_id: session_id.to_string(),
            stage: "turn".to_string(),
            role,
            content: content.to_string(),
            agent_id: None,
            user_id: user.to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn round_trip_persists_in_order() {
        let store = InMemoryConversationStore::new();
        store.create_session(session("s1", "u1")).await.unwrap();
        store.persist_message(message("s1", "u1", MessageRole::User, "hi")).await.unwrap();
        store.persist_message(message("s1", "u1", MessageRole::Assistant, "hello")).await.unwrap();
        let history = store.get_history("s1", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "hi");
        assert_eq!(history[1].content, "hello");
    }

    #[tokio::test]
    async fn ownership_violation_is_rejected() {
        let store = InMemoryConversationStore::new();
        store.create_session(session("s1", "owner")).await.unwrap();
        let result = store.persist_message(message("s1", "intruder", MessageRole::User, "hi")).await;
        assert!(matches!(result, Err(ConversationStoreError::OwnershipViolation(_))));
    }

    #[tokio::test]
    async fn completion_marker_excludes_from_incomplete() {
        let store = InMemoryConversationStore::new();
        store.create_session(session("s1", "u1")).await.unwrap();
        store.create_session(session("s2", "u1")).await.unwrap();
        store.persist_message(message("s1", "u1", MessageRole::User, "hi")).await.unwrap();
        store
            .persist_message(message("s2", "u1", MessageRole::System, "[COMPLETE]"))
            .await
            .unwrap();
        let incomplete = store.get_incomplete_sessions("u1").await.unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].id, "s1");
    }
}
