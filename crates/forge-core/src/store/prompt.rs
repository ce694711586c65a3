//! System prompt versions with atomic activation: at most one version is
//! active at a time. Activation is a two-statement transaction (deactivate
//! all, then activate the target) so a reader never observes two actives.

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::domain::PromptVersion;

#[derive(Debug, Error)]
pub enum PromptStoreError {
    #[error("prompt version not found: {0}")]
    NotFound(i64),
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait PromptStore: Send + Sync {
    async fn create_version(&self, version: String, content: String, notes: Option<String>) -> Result<PromptVersion, PromptStoreError>;

    async fn list_versions(&self) -> Result<Vec<PromptVersion>, PromptStoreError>;

    /// Activates `id`, deactivating whatever was previously active. No-op
    /// if `id` is already active.
    async fn activate(&self, id: i64) -> Result<(), PromptStoreError>;

    /// The single active version, if any (0 or 1 invariant).
    async fn get_active(&self) -> Result<Option<PromptVersion>, PromptStoreError>;
}

pub mod in_memory {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct InMemoryPromptStore {
        versions: Mutex<Vec<PromptVersion>>,
        next_id: Mutex<i64>,
    }

    impl InMemoryPromptStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl PromptStore for InMemoryPromptStore {
        async fn create_version(&self, version: String, content: String, notes: Option<String>) -> Result<PromptVersion, PromptStoreError> {
            let mut next_id = self.next_id.lock();
            *next_id += 1;
            let record = PromptVersion {
                id: *next_id,
                version,
                content,
                is_active: false,
                created_at: Utc::now(),
                activated_at: None,
                notes,
            };
            self.versions.lock().push(record.clone());
            Ok(record)
        }

        async fn list_versions(&self) -> Result<Vec<PromptVersion>, PromptStoreError> {
            Ok(self.versions.lock().clone())
        }

        async fn activate(&self, id: i64) -> Result<(), PromptStoreError> {
            let mut versions = self.versions.lock();
            if !versions.iter().any(|v| v.id == id) {
                return Err(PromptStoreError::NotFound(id));
            }
            let now = Utc::now();
            for version in versions.iter_mut() {
                if version.id == id {
                    version.is_active = true;
                    version.activated_at = Some(now);
                } else {
                    version.is_active = false;
                }
            }
            Ok(())
        }

        async fn get_active(&self) -> Result<Option<PromptVersion>, PromptStoreError> {
            Ok(self.versions.lock().iter().find(|v| v.is_active).cloned())
        }
    }
}

pub use in_memory::InMemoryPromptStore;

#[cfg(feature = "sqlite-backend")]
pub mod sqlite {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use rusqlite::{params, Connection, OptionalExtension};

    pub struct SqlitePromptStore {
        conn: SyncMutex<Connection>,
    }

    impl SqlitePromptStore {
        pub fn open(path: &str) -> anyhow::Result<Self> {
            let conn = Connection::open(path)?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS prompt_versions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    version TEXT NOT NULL,
                    content TEXT NOT NULL,
                    is_active INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    activated_at TEXT,
                    notes TEXT
                )",
                [],
            )?;
            Ok(SqlitePromptStore { conn: SyncMutex::new(conn) })
        }

        fn row_to_version(row: &rusqlite::Row) -> rusqlite::Result<PromptVersion> {
            let created_at: String = row.get(4)?;
            let activated_at: Option<String> = row.get(5)?;
            Ok(PromptVersion {
                id: row.get(0)?,
                version: row.get(1)?,
                content: row.get(2)?,
                is_active: row.get::<_, i64>(3)? != 0,
                created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                    .unwrap_or_else(|_| Utc::now().into())
                    .with_timezone(&Utc),
                activated_at: activated_at.and_then(|s| {
                    chrono::DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))
                }),
                notes: row.get(6)?,
            })
        }
    }

    #[async_trait]
    impl PromptStore for SqlitePromptStore {
        async fn create_version(&self, version: String, content: String, notes: Option<String>) -> Result<PromptVersion, PromptStoreError> {
            let conn = self.conn.lock();
            let now = Utc::now();
            conn.execute(
                "INSERT INTO prompt_versions (version, content, is_active, created_at, notes)
                 VALUES (?1, ?2, 0, ?3, ?4)",
                params![version, content, now.to_rfc3339(), notes],
            )
            .map_err(|e| PromptStoreError::Storage(e.to_string()))?;
            let id = conn.last_insert_rowid();
            Ok(PromptVersion { id, version, content, is_active: false, created_at: now, activated_at: None, notes })
        }

        async fn list_versions(&self) -> Result<Vec<PromptVersion>, PromptStoreError> {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare("SELECT id, version, content, is_active, created_at, activated_at, notes FROM prompt_versions")
                .map_err(|e| PromptStoreError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map([], Self::row_to_version)
                .map_err(|e| PromptStoreError::Storage(e.to_string()))?;
            rows.collect::<Result<_, _>>().map_err(|e| PromptStoreError::Storage(e.to_string()))
        }

        /// Two statements inside one transaction: deactivate everything,
        /// then activate the target. A reader never observes two actives.
        async fn activate(&self, id: i64) -> Result<(), PromptStoreError> {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(|e| PromptStoreError::Storage(e.to_string()))?;
            let exists: Option<i64> = tx
                .query_row("SELECT id FROM prompt_versions WHERE id = ?1", params![id], |r| r.get(0))
                .optional()
                .map_err(|e| PromptStoreError::Storage(e.to_string()))?;
            if exists.is_none() {
                return Err(PromptStoreError::NotFound(id));
            }
            let now = Utc::now().to_rfc3339();
            tx.execute("UPDATE prompt_versions SET is_active = 0", [])
                .map_err(|e| PromptStoreError::Storage(e.to_string()))?;
            tx.execute(
                "UPDATE prompt_versions SET is_active = 1, activated_at = ?2 WHERE id = ?1",
                params![id, now],
            )
            .map_err(|e| PromptStoreError::Storage(e.to_string()))?;
            tx.commit().map_err(|e| PromptStoreError::Storage(e.to_string()))?;
            Ok(())
        }

        async fn get_active(&self) -> Result<Option<PromptVersion>, PromptStoreError> {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT id, version, content, is_active, created_at, activated_at, notes
                 FROM prompt_versions WHERE is_active = 1",
                [],
                Self::row_to_version,
            )
            .optional()
            .map_err(|e| PromptStoreError::Storage(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn activation_is_exclusive() {
        let store = InMemoryPromptStore::new();
        let v1 = store.create_version("v1".to_string(), "a".to_string(), None).await.unwrap();
        let v2 = store.create_version("v2".to_string(), "b".to_string(), None).await.unwrap();
        store.activate(v1.id).await.unwrap();
        assert_eq!(store.get_active().await.unwrap().unwrap().id, v1.id);
        store.activate(v2.id).await.unwrap();
        let active = store.list_versions().await.unwrap();
        let active_count = active.iter().filter(|v| v.is_active).count();
        assert_eq!(active_count, 1);
        assert_eq!(store.get_active().await.unwrap().unwrap().id, v2.id);
    }

    #[tokio::test]
    async fn activating_unknown_version_errors() {
        let store = InMemoryPromptStore::new();
        assert!(matches!(store.activate(999).await, Err(PromptStoreError::NotFound(999))));
    }
}
