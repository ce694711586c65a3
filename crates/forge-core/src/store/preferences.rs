//! Per-user saved preferences: model and HITL level overrides, gated at
//! read time by an agent's `allow_user_*` flags (see `crate::preferences`).
//! This module only owns persistence -- one row per user, upserted whole.

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::domain::UserPreferences;

#[derive(Debug, Error)]
pub enum PreferencesStoreError {
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait PreferencesStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<UserPreferences>, PreferencesStoreError>;

    /// Upserts the full row; `updated_at` is stamped by the store, not the
    /// caller.
    async fn upsert(&self, prefs: UserPreferences) -> Result<UserPreferences, PreferencesStoreError>;
}

pub mod in_memory {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct InMemoryPreferencesStore {
        rows: Mutex<HashMap<String, UserPreferences>>,
    }

    impl InMemoryPreferencesStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl PreferencesStore for InMemoryPreferencesStore {
        async fn get(&self, user_id: &str) -> Result<Option<UserPreferences>, PreferencesStoreError> {
            Ok(self.rows.lock().get(user_id).cloned())
        }

        async fn upsert(&self, mut prefs: UserPreferences) -> Result<UserPreferences, PreferencesStoreError> {
            prefs.updated_at = Some(Utc::now());
            self.rows.lock().insert(prefs.user_id.clone(), prefs.clone());
            Ok(prefs)
        }
    }
}

pub use in_memory::InMemoryPreferencesStore;

#[cfg(feature = "sqlite-backend")]
pub mod sqlite {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use rusqlite::{params, Connection, OptionalExtension};

    pub struct SqlitePreferencesStore {
        conn: SyncMutex<Connection>,
    }

    impl SqlitePreferencesStore {
        pub fn open(path: &str) -> anyhow::Result<Self> {
            let conn = Connection::open(path)?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS user_preferences (
                    user_id TEXT PRIMARY KEY,
                    model TEXT,
                    hitl_level TEXT,
                    updated_at TEXT NOT NULL
                )",
                [],
            )?;
            Ok(SqlitePreferencesStore { conn: SyncMutex::new(conn) })
        }

        fn hitl_to_str(level: crate::domain::HitlLevel) -> &'static str {
            match level {
                crate::domain::HitlLevel::Autonomous => "autonomous",
                crate::domain::HitlLevel::Cautious => "cautious",
                crate::domain::HitlLevel::Standard => "standard",
                crate::domain::HitlLevel::Paranoid => "paranoid",
            }
        }

        fn hitl_from_str(s: &str) -> Option<crate::domain::HitlLevel> {
            match s {
                "autonomous" => Some(crate::domain::HitlLevel::Autonomous),
                "cautious" => Some(crate::domain::HitlLevel::Cautious),
                "standard" => Some(crate::domain::HitlLevel::Standard),
                "paranoid" => Some(crate::domain::HitlLevel::Paranoid),
                _ => None,
            }
        }
    }

    #[async_trait]
    impl PreferencesStore for SqlitePreferencesStore {
        async fn get(&self, user_id: &str) -> Result<Option<UserPreferences>, PreferencesStoreError> {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT user_id, model, hitl_level, updated_at FROM user_preferences WHERE user_id = ?1",
                params![user_id],
                |r| {
                    let hitl_level: Option<String> = r.get(2)?;
                    let updated_at: String = r.get(3)?;
                    Ok(UserPreferences {
                        user_id: r.get(0)?,
                        model: r.get(1)?,
                        hitl_level: hitl_level.and_then(|s| Self::hitl_from_str(&s)),
                        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
                            .ok()
                            .map(|d| d.with_timezone(&Utc)),
                    })
                },
            )
            .optional()
            .map_err(|e| PreferencesStoreError::Storage(e.to_string()))
        }

        async fn upsert(&self, mut prefs: UserPreferences) -> Result<UserPreferences, PreferencesStoreError> {
            prefs.updated_at = Some(Utc::now());
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO user_preferences (user_id, model, hitl_level, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET model = excluded.model, hitl_level = excluded.hitl_level, updated_at = excluded.updated_at",
                params![
                    prefs.user_id,
                    prefs.model,
                    prefs.hitl_level.map(Self::hitl_to_str),
                    prefs.updated_at.expect("stamped above").to_rfc3339(),
                ],
            )
            .map_err(|e| PreferencesStoreError::Storage(e.to_string()))?;
            Ok(prefs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let store = InMemoryPreferencesStore::new();
        let prefs = UserPreferences {
            user_id: "u1".to_string(),
            model: Some("gpt-4o".to_string()),
            hitl_level: Some(crate::domain::HitlLevel::Paranoid),
            updated_at: None,
        };
        store.upsert(prefs).await.unwrap();
        let fetched = store.get("u1").await.unwrap().unwrap();
        assert_eq!(fetched.model.as_deref(), Some("gpt-4o"));
        assert!(fetched.updated_at.is_some());
    }

    #[tokio::test]
    async fn unknown_user_returns_none() {
        let store = InMemoryPreferencesStore::new();
        assert!(store.get("nobody").await.unwrap().is_none());
    }
}
