//! Agent registry: CRUD over named agent profiles, with two invariants the
//! store itself must hold rather than trust callers to maintain --
//! slugs are unique, and at most one *enabled* agent is ever the default.
//! Deleting the current default auto-promotes another enabled agent so the
//! invariant never lapses into "zero defaults" while agents still exist.

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

use crate::domain::Agent;

#[derive(Debug, Error)]
pub enum AgentStoreError {
    #[error("agent not found: {0}")]
    NotFound(String),
    #[error("agent slug already exists: {0}")]
    DuplicateSlug(String),
    #[error("invalid slug `{0}`: must match ^[a-z0-9_-]{{1,64}}$")]
    InvalidSlug(String),
    #[error("cannot delete a config-seeded agent: {0}")]
    SeededFromConfig(String),
}

pub fn slug_pattern() -> Regex {
    Regex::new(r"^[a-z0-9_-]{1,64}$").expect("static pattern")
}

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn list(&self) -> Vec<Agent>;
    async fn get(&self, id: &str) -> Option<Agent>;
    async fn get_default(&self) -> Option<Agent>;
    async fn create(&self, agent: Agent) -> Result<Agent, AgentStoreError>;
    async fn update(&self, agent: Agent) -> Result<Agent, AgentStoreError>;
    async fn delete(&self, id: &str) -> Result<(), AgentStoreError>;
    async fn set_default(&self, id: &str) -> Result<(), AgentStoreError>;
}

pub struct InMemoryAgentStore {
    agents: parking_lot::Mutex<Vec<Agent>>,
}

impl InMemoryAgentStore {
    pub fn new(seed: Vec<Agent>) -> Self {
        InMemoryAgentStore {
            agents: parking_lot::Mutex::new(seed),
        }
    }

    fn validate_slug(id: &str) -> Result<(), AgentStoreError> {
        if slug_pattern().is_match(id) {
            Ok(())
        } else {
            Err(AgentStoreError::InvalidSlug(id.to_string()))
        }
    }
}

#[async_trait]
impl AgentStore for InMemoryAgentStore {
    async fn list(&self) -> Vec<Agent> {
        self.agents.lock().clone()
    }

    async fn get(&self, id: &str) -> Option<Agent> {
        self.agents.lock().iter().find(|a| a.id == id).cloned()
    }

    async fn get_default(&self) -> Option<Agent> {
        self.agents.lock().iter().find(|a| a.enabled && a.is_default).cloned()
    }

    async fn create(&self, mut agent: Agent) -> Result<Agent, AgentStoreError> {
        Self::validate_slug(&agent.id)?;
        let mut agents = self.agents.lock();
        if agents.iter().any(|a| a.id == agent.id) {
            return Err(AgentStoreError::DuplicateSlug(agent.id));
        }
        if agent.is_default && agent.enabled {
            for existing in agents.iter_mut() {
                existing.is_default = false;
            }
        } else if !agents.iter().any(|a| a.enabled && a.is_default) && agent.enabled {
            // First enabled agent in an otherwise default-less registry
            // becomes the default, so the invariant holds from the start.
            agent.is_default = true;
        }
        agents.push(agent.clone());
        Ok(agent)
    }

    async fn update(&self, agent: Agent) -> Result<Agent, AgentStoreError> {
        let mut agents = self.agents.lock();
        let idx = agents
            .iter()
            .position(|a| a.id == agent.id)
            .ok_or_else(|| AgentStoreError::NotFound(agent.id.clone()))?;
        if agent.is_default && agent.enabled {
            for (i, existing) in agents.iter_mut().enumerate() {
                if i != idx {
                    existing.is_default = false;
                }
            }
        }
        agents[idx] = agent.clone();
        Ok(agent)
    }

    async fn delete(&self, id: &str) -> Result<(), AgentStoreError> {
        let mut agents = self.agents.lock();
        let idx = agents.iter().position(|a| a.id == id).ok_or_else(|| AgentStoreError::NotFound(id.to_string()))?;
        if agents[idx].seeded_from_config {
            return Err(AgentStoreError::SeededFromConfig(id.to_string()));
        }
        let was_default = agents[idx].is_default;
        agents.remove(idx);
        if was_default {
            if let Some(next) = agents.iter_mut().find(|a| a.enabled) {
                next.is_default = true;
            }
        }
        Ok(())
    }

    async fn set_default(&self, id: &str) -> Result<(), AgentStoreError> {
        let mut agents = self.agents.lock();
        if !agents.iter().any(|a| a.id == id && a.enabled) {
            return Err(AgentStoreError::NotFound(id.to_string()));
        }
        for agent in agents.iter_mut() {
            agent.is_default = agent.id == id;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HitlLevel;

    fn agent(id: &str, enabled: bool, is_default: bool) -> Agent {
        Agent {
            id: id.to_string(),
            display_name: id.to_string(),
            system_prompt: None,
            default_model: None,
            default_hitl_level: HitlLevel::Cautious,
            allow_user_model_select: false,
            allow_user_hitl_config: false,
            tool_allowlist_raw: "*".to_string(),
            max_turns: 10,
            max_tokens: 4096,
            is_default,
            enabled,
            seeded_from_config: false,
        }
    }

    #[tokio::test]
    async fn duplicate_slug_rejected() {
        let store = InMemoryAgentStore::new(vec![]);
        store.create(agent("a", true, true)).await.unwrap();
        let result = store.create(agent("a", true, false)).await;
        assert!(matches!(result, Err(AgentStoreError::DuplicateSlug(_))));
    }

    #[tokio::test]
    async fn setting_new_default_clears_old_one() {
        let store = InMemoryAgentStore::new(vec![]);
        store.create(agent("a", true, true)).await.unwrap();
        store.create(agent("b", true, false)).await.unwrap();
        store.set_default("b").await.unwrap();
        let agents = store.list().await;
        let defaults: Vec<_> = agents.iter().filter(|a| a.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].id, "b");
    }

    #[tokio::test]
    async fn deleting_default_auto_promotes_another_enabled_agent() {
        let store = InMemoryAgentStore::new(vec![agent("a", true, true), agent("b", true, false)]);
        store.delete("a").await.unwrap();
        let default = store.get_default().await;
        assert_eq!(default.unwrap().id, "b");
    }

    #[tokio::test]
    async fn seeded_from_config_agent_cannot_be_deleted() {
        let mut seeded = agent("a", true, true);
        seeded.seeded_from_config = true;
        let store = InMemoryAgentStore::new(vec![seeded]);
        let result = store.delete("a").await;
        assert!(matches!(result, Err(AgentStoreError::SeededFromConfig(_))));
    }

    #[tokio::test]
    async fn invalid_slug_rejected() {
        let store = InMemoryAgentStore::new(vec![]);
        let result = store.create(agent("Has Spaces", true, false)).await;
        assert!(matches!(result, Err(AgentStoreError::InvalidSlug(_))));
    }
}
