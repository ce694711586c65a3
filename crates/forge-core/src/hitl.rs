//! Human-in-the-loop pause/resume engine. A gated tool call suspends the
//! turn, serialises its resumable state under a fresh token, and hands the
//! token to the caller. `resume` is delete-on-read so a token is redeemed
//! at most once, even past its TTL.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{Agent, HitlLevel, PausedHitlState, ToolSpec};

pub const DEFAULT_TTL_SECS: i64 = 5 * 60;

/// `shouldPause(level, toolSpec)` decision table from the spec.
pub fn should_pause(level: HitlLevel, tool: &ToolSpec) -> bool {
    match level {
        HitlLevel::Autonomous => false,
        HitlLevel::Cautious => tool.requires_confirmation,
        HitlLevel::Standard => matches!(
            tool.http_method().to_ascii_uppercase().as_str(),
            "POST" | "PUT" | "PATCH" | "DELETE"
        ),
        HitlLevel::Paranoid => true,
    }
}

/// Storage contract a HITL backend must provide. Delete precedes the expiry
/// check in `HitlEngine::resume` so at-most-once holds even for expired rows.
#[async_trait]
pub trait HitlStore: Send + Sync {
    async fn put(&self, token: &str, state_json: String, expires_at: DateTime<Utc>) -> anyhow::Result<()>;

    /// Removes and returns the row unconditionally, regardless of expiry.
    async fn take(&self, token: &str) -> anyhow::Result<Option<(String, DateTime<Utc>)>>;

    /// Deletes rows past their expiry. Returns the number removed.
    async fn purge_expired(&self) -> anyhow::Result<u64>;
}

pub struct HitlEngine {
    store: Arc<dyn HitlStore>,
    ttl: Duration,
}

impl HitlEngine {
    pub fn new(store: Arc<dyn HitlStore>) -> Self {
        HitlEngine {
            store,
            ttl: Duration::from_secs(DEFAULT_TTL_SECS as u64),
        }
    }

    pub fn with_ttl(store: Arc<dyn HitlStore>, ttl: Duration) -> Self {
        HitlEngine { store, ttl }
    }

    pub fn should_pause(&self, level: HitlLevel, tool: &ToolSpec) -> bool {
        should_pause(level, tool)
    }

    pub async fn pause(&self, state: &PausedHitlState) -> anyhow::Result<String> {
        let token = Uuid::new_v4().to_string();
        let state_json = serde_json::to_string(state)?;
        let expires_at = Utc::now() + chrono::Duration::from_std(self.ttl)?;
        self.store.put(&token, state_json, expires_at).await?;
        Ok(token)
    }

    /// At-most-once: the first caller within TTL gets `Some`; every other
    /// caller (including a second call with the same token, or any call
    /// after expiry) gets `None`.
    pub async fn resume(&self, token: &str) -> anyhow::Result<Option<PausedHitlState>> {
        let Some((state_json, expires_at)) = self.store.take(token).await? else {
            return Ok(None);
        };
        if expires_at < Utc::now() {
            return Ok(None);
        }
        let state: PausedHitlState = serde_json::from_str(&state_json)?;
        Ok(Some(state))
    }

    /// Spawns the background sweep for backends that need it (SQL/keyed
    /// stores). Cleanup failure is logged and non-fatal.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = engine.store.purge_expired().await {
                    tracing::warn!(error = %e, "hitl cleanup sweep failed");
                }
            }
        })
    }
}

/// Resolves an agent's effective HITL-gated tool set for the duration of one
/// turn: used by the loop to decide whether to pause before dispatch.
pub fn agent_hitl_level(agent: Option<&Agent>, user_override: Option<HitlLevel>) -> HitlLevel {
    match agent {
        Some(a) if a.allow_user_hitl_config => user_override.unwrap_or(a.default_hitl_level),
        Some(a) => a.default_hitl_level,
        None => user_override.unwrap_or_default(),
    }
}

pub mod in_memory {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct InMemoryHitlStore {
        rows: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
    }

    impl InMemoryHitlStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl HitlStore for InMemoryHitlStore {
        async fn put(&self, token: &str, state_json: String, expires_at: DateTime<Utc>) -> anyhow::Result<()> {
            self.rows.lock().insert(token.to_string(), (state_json, expires_at));
            Ok(())
        }

        async fn take(&self, token: &str) -> anyhow::Result<Option<(String, DateTime<Utc>)>> {
            Ok(self.rows.lock().remove(token))
        }

        async fn purge_expired(&self) -> anyhow::Result<u64> {
            let now = Utc::now();
            let mut rows = self.rows.lock();
            let before = rows.len();
            rows.retain(|_, (_, expires_at)| *expires_at >= now);
            Ok((before - rows.len()) as u64)
        }
    }
}

#[cfg(feature = "sqlite-backend")]
pub mod sqlite {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use rusqlite::{params, Connection};

    pub struct SqliteHitlStore {
        conn: SyncMutex<Connection>,
    }

    impl SqliteHitlStore {
        pub fn open(path: &str) -> anyhow::Result<Self> {
            let conn = Connection::open(path)?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS paused_hitl_state (
                    token TEXT PRIMARY KEY,
                    state_json TEXT NOT NULL,
                    expires_at TEXT NOT NULL,
                    created_at TEXT NOT NULL
                )",
                [],
            )?;
            Ok(SqliteHitlStore {
                conn: SyncMutex::new(conn),
            })
        }
    }

    #[async_trait]
    impl HitlStore for SqliteHitlStore {
        async fn put(&self, token: &str, state_json: String, expires_at: DateTime<Utc>) -> anyhow::Result<()> {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT OR REPLACE INTO paused_hitl_state (token, state_json, expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![token, state_json, expires_at.to_rfc3339(), Utc::now().to_rfc3339()],
            )?;
            Ok(())
        }

        async fn take(&self, token: &str) -> anyhow::Result<Option<(String, DateTime<Utc>)>> {
            let conn = self.conn.lock();
            let row = conn
                .query_row(
                    "SELECT state_json, expires_at FROM paused_hitl_state WHERE token = ?1",
                    params![token],
                    |r| {
                        let state_json: String = r.get(0)?;
                        let expires_at: String = r.get(1)?;
                        Ok((state_json, expires_at))
                    },
                )
                .ok();
            if row.is_some() {
                conn.execute(
                    "DELETE FROM paused_hitl_state WHERE token = ?1",
                    params![token],
                )?;
            }
            Ok(match row {
                Some((state_json, expires_at)) => {
                    let expires_at = DateTime::parse_from_rfc3339(&expires_at)?.with_timezone(&Utc);
                    Some((state_json, expires_at))
                }
                None => None,
            })
        }

        async fn purge_expired(&self) -> anyhow::Result<u64> {
            let conn = self.conn.lock();
            let now = Utc::now().to_rfc3339();
            let n = conn.execute(
                "DELETE FROM paused_hitl_state WHERE expires_at < ?1",
                params![now],
            )?;
            Ok(n as u64)
        }
    }
}

#[cfg(feature = "redis-backend")]
pub mod redis_backend {
    use super::*;
    use redis::AsyncCommands;

    /// Redis's own key TTL drives expiry; `purge_expired` is a no-op here.
    pub struct RedisHitlStore {
        client: redis::Client,
    }

    impl RedisHitlStore {
        pub fn new(url: &str) -> anyhow::Result<Self> {
            Ok(RedisHitlStore {
                client: redis::Client::open(url)?,
            })
        }

        fn key(token: &str) -> String {
            format!("hitl:{token}")
        }
    }

    #[async_trait]
    impl HitlStore for RedisHitlStore {
        async fn put(&self, token: &str, state_json: String, expires_at: DateTime<Utc>) -> anyhow::Result<()> {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let ttl_secs = (expires_at - Utc::now()).num_seconds().max(1) as u64;
            let payload = format!("{}\u{1}{}", expires_at.to_rfc3339(), state_json);
            let _: () = conn.set_ex(Self::key(token), payload, ttl_secs).await?;
            Ok(())
        }

        async fn take(&self, token: &str) -> anyhow::Result<Option<(String, DateTime<Utc>)>> {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let key = Self::key(token);
            let payload: Option<String> = conn.get(&key).await?;
            if payload.is_some() {
                let _: () = conn.del(&key).await?;
            }
            Ok(payload.and_then(|p| {
                let mut parts = p.splitn(2, '\u{1}');
                let expires_at = parts.next()?;
                let state_json = parts.next()?;
                let expires_at = DateTime::parse_from_rfc3339(expires_at).ok()?.with_timezone(&Utc);
                Some((state_json.to_string(), expires_at))
            }))
        }

        async fn purge_expired(&self) -> anyhow::Result<u64> {
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::in_memory::InMemoryHitlStore;
    use super::*;
    use crate::domain::{McpRouting, ToolLifecycle};
    use std::collections::HashMap;

    fn tool(method: &str, requires_confirmation: bool) -> ToolSpec {
        ToolSpec {
            name: "delete_user".to_string(),
            description: "".to_string(),
            input_schema: HashMap::new(),
            mcp_routing: Some(McpRouting {
                endpoint: "/delete".to_string(),
                method: method.to_string(),
            }),
            requires_confirmation,
            lifecycle: ToolLifecycle::Promoted,
        }
    }

    #[test]
    fn decision_table() {
        let get_tool = tool("GET", false);
        let delete_tool = tool("DELETE", false);
        let confirm_tool = tool("GET", true);

        assert!(!should_pause(HitlLevel::Autonomous, &delete_tool));
        assert!(!should_pause(HitlLevel::Cautious, &get_tool));
        assert!(should_pause(HitlLevel::Cautious, &confirm_tool));
        assert!(!should_pause(HitlLevel::Standard, &get_tool));
        assert!(should_pause(HitlLevel::Standard, &delete_tool));
        assert!(should_pause(HitlLevel::Paranoid, &get_tool));
    }

    fn sample_state() -> PausedHitlState {
        PausedHitlState {
            session_id: "s1".to_string(),
            agent_id: None,
            user_id: "u1".to_string(),
            pending_tool_calls: vec![],
            conversation_messages: vec![],
            turn_index: 0,
            tool_name: "delete_user".to_string(),
            args: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn at_most_once() {
        let engine = HitlEngine::new(Arc::new(InMemoryHitlStore::new()));
        let token = engine.pause(&sample_state()).await.unwrap();
        let first = engine.resume(&token).await.unwrap();
        assert!(first.is_some());
        let second = engine.resume(&token).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn ttl_expiry_even_if_row_present() {
        let engine = HitlEngine::with_ttl(Arc::new(InMemoryHitlStore::new()), Duration::from_secs(0));
        let token = engine.pause(&sample_state()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let result = engine.resume(&token).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn unknown_token_returns_none() {
        let engine = HitlEngine::new(Arc::new(InMemoryHitlStore::new()));
        assert!(engine.resume("no-such-token").await.unwrap().is_none());
    }
}
