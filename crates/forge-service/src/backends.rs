//! Backend selection for every store the process can run against either
//! in-memory or persistently. Kept out of `main.rs` so the startup
//! sequence there reads as intent ("open the conversation store at this
//! path") rather than feature-gated plumbing.

use std::sync::Arc;

use forge_core::audit::AuditSink;
use forge_core::hitl::HitlStore;
use forge_core::rate_limit::{RateLimitConfig, RateLimiter};
use forge_core::store::{ConversationStore, PreferencesStore, PromptStore};

#[cfg(feature = "sqlite-backend")]
pub fn open_conversation_store(path: &str) -> anyhow::Result<Arc<dyn ConversationStore>> {
    Ok(Arc::new(forge_core::store::conversation::sqlite::SqliteConversationStore::open(path)?))
}

#[cfg(not(feature = "sqlite-backend"))]
pub fn open_conversation_store(_path: &str) -> anyhow::Result<Arc<dyn ConversationStore>> {
    anyhow::bail!("--database-url given but this binary was built without the sqlite-backend feature")
}

#[cfg(feature = "sqlite-backend")]
pub fn open_prompt_store(path: &str) -> anyhow::Result<Arc<dyn PromptStore>> {
    Ok(Arc::new(forge_core::store::prompt::sqlite::SqlitePromptStore::open(path)?))
}

#[cfg(not(feature = "sqlite-backend"))]
pub fn open_prompt_store(_path: &str) -> anyhow::Result<Arc<dyn PromptStore>> {
    anyhow::bail!("--database-url given but this binary was built without the sqlite-backend feature")
}

#[cfg(feature = "sqlite-backend")]
pub fn open_preferences_store(path: &str) -> anyhow::Result<Arc<dyn PreferencesStore>> {
    Ok(Arc::new(forge_core::store::preferences::sqlite::SqlitePreferencesStore::open(path)?))
}

#[cfg(not(feature = "sqlite-backend"))]
pub fn open_preferences_store(_path: &str) -> anyhow::Result<Arc<dyn PreferencesStore>> {
    anyhow::bail!("--database-url given but this binary was built without the sqlite-backend feature")
}

#[cfg(feature = "sqlite-backend")]
pub fn open_audit_sink(path: &str) -> anyhow::Result<Arc<dyn AuditSink>> {
    Ok(Arc::new(forge_core::audit::sqlite::SqliteAuditSink::open(path)?))
}

#[cfg(not(feature = "sqlite-backend"))]
pub fn open_audit_sink(_path: &str) -> anyhow::Result<Arc<dyn AuditSink>> {
    anyhow::bail!("--database-url given but this binary was built without the sqlite-backend feature")
}

#[cfg(feature = "sqlite-backend")]
pub fn open_sqlite_hitl_store(path: &str) -> anyhow::Result<Arc<dyn HitlStore>> {
    Ok(Arc::new(forge_core::hitl::sqlite::SqliteHitlStore::open(path)?))
}

#[cfg(not(feature = "sqlite-backend"))]
pub fn open_sqlite_hitl_store(_path: &str) -> anyhow::Result<Arc<dyn HitlStore>> {
    anyhow::bail!("--database-url given but this binary was built without the sqlite-backend feature")
}

#[cfg(feature = "redis-backend")]
pub fn open_redis_hitl_store(url: &str) -> anyhow::Result<Arc<dyn HitlStore>> {
    Ok(Arc::new(forge_core::hitl::redis_backend::RedisHitlStore::new(url)?))
}

#[cfg(not(feature = "redis-backend"))]
pub fn open_redis_hitl_store(_url: &str) -> anyhow::Result<Arc<dyn HitlStore>> {
    anyhow::bail!("--redis-url given but this binary was built without the redis-backend feature")
}

#[cfg(feature = "redis-backend")]
pub fn build_shared_rate_limiter(config: RateLimitConfig, url: &str) -> anyhow::Result<Arc<dyn RateLimiter>> {
    let store = forge_core::rate_limit::redis_backend::RedisCounterStore::new(url)?;
    Ok(Arc::new(forge_core::rate_limit::SharedKeyedRateLimiter::new(config, store)))
}

#[cfg(not(feature = "redis-backend"))]
pub fn build_shared_rate_limiter(_config: RateLimitConfig, _url: &str) -> anyhow::Result<Arc<dyn RateLimiter>> {
    anyhow::bail!("--redis-url given but this binary was built without the redis-backend feature")
}
