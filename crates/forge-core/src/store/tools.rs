//! The tool registry: a tool's lifecycle gates its visibility. Only
//! `promoted` tools are ever handed to the ReAct loop or listed to a
//! client; `candidate`/`flagged`/`retired` stay registered for admin
//! tooling but are invisible to chat.

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::domain::{ToolLifecycle, ToolSpec};

#[derive(Debug, Error)]
pub enum ToolStoreError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("a promoted tool already exists with name: {0}")]
    DuplicatePromotedName(String),
}

#[async_trait]
pub trait ToolStore: Send + Sync {
    async fn list_all(&self) -> Vec<ToolSpec>;

    /// Only `promoted` tools, optionally filtered by an agent's allowlist.
    async fn list_promoted(&self) -> Vec<ToolSpec>;

    async fn get(&self, name: &str) -> Option<ToolSpec>;

    async fn upsert(&self, tool: ToolSpec) -> Result<ToolSpec, ToolStoreError>;

    async fn set_lifecycle(&self, name: &str, lifecycle: ToolLifecycle) -> Result<(), ToolStoreError>;
}

#[derive(Default)]
pub struct InMemoryToolStore {
    tools: Mutex<Vec<ToolSpec>>,
}

impl InMemoryToolStore {
    pub fn new(seed: Vec<ToolSpec>) -> Self {
        InMemoryToolStore {
            tools: Mutex::new(seed),
        }
    }
}

#[async_trait]
impl ToolStore for InMemoryToolStore {
    async fn list_all(&self) -> Vec<ToolSpec> {
        self.tools.lock().clone()
    }

    async fn list_promoted(&self) -> Vec<ToolSpec> {
        self.tools
            .lock()
            .iter()
            .filter(|t| t.lifecycle == ToolLifecycle::Promoted)
            .cloned()
            .collect()
    }

    async fn get(&self, name: &str) -> Option<ToolSpec> {
        self.tools.lock().iter().find(|t| t.name == name).cloned()
    }

    async fn upsert(&self, tool: ToolSpec) -> Result<ToolSpec, ToolStoreError> {
        let mut tools = self.tools.lock();
        if tool.lifecycle == ToolLifecycle::Promoted
            && tools.iter().any(|t| t.name == tool.name && t.lifecycle == ToolLifecycle::Promoted)
        {
            return Err(ToolStoreError::DuplicatePromotedName(tool.name));
        }
        match tools.iter().position(|t| t.name == tool.name) {
            Some(idx) => tools[idx] = tool.clone(),
            None => tools.push(tool.clone()),
        }
        Ok(tool)
    }

    async fn set_lifecycle(&self, name: &str, lifecycle: ToolLifecycle) -> Result<(), ToolStoreError> {
        let mut tools = self.tools.lock();
        if lifecycle == ToolLifecycle::Promoted
            && tools.iter().any(|t| t.name == name && t.lifecycle == ToolLifecycle::Promoted)
        {
            // Already promoted under this name: idempotent, not a conflict.
        }
        let tool = tools.iter_mut().find(|t| t.name == name).ok_or_else(|| ToolStoreError::NotFound(name.to_string()))?;
        tool.lifecycle = lifecycle;
        Ok(())
    }
}

/// Narrows a promoted-tool list down to what an agent's allowlist permits.
/// A malformed allowlist parses to an empty `Named` list upstream, so this
/// naturally yields "no tools visible" without special-casing here.
pub fn filter_by_allowlist(tools: Vec<ToolSpec>, allowlist: &crate::domain::ToolAllowlist) -> Vec<ToolSpec> {
    tools.into_iter().filter(|t| allowlist.allows(&t.name)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn tool(name: &str, lifecycle: ToolLifecycle) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: "".to_string(),
            input_schema: HashMap::new(),
            mcp_routing: None,
            requires_confirmation: false,
            lifecycle,
        }
    }

    #[tokio::test]
    async fn only_promoted_tools_are_listed() {
        let store = InMemoryToolStore::new(vec![
            tool("a", ToolLifecycle::Promoted),
            tool("b", ToolLifecycle::Candidate),
            tool("c", ToolLifecycle::Retired),
        ]);
        let promoted = store.list_promoted().await;
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].name, "a");
    }

    #[tokio::test]
    async fn duplicate_promoted_name_rejected() {
        let store = InMemoryToolStore::new(vec![tool("a", ToolLifecycle::Promoted)]);
        let result = store.upsert(tool("a", ToolLifecycle::Promoted)).await;
        assert!(matches!(result, Err(ToolStoreError::DuplicatePromotedName(_))));
    }

    #[test]
    fn allowlist_filter_matches_named_list() {
        let tools = vec![tool("a", ToolLifecycle::Promoted), tool("b", ToolLifecycle::Promoted)];
        let allowlist = crate::domain::ToolAllowlist::Named(vec!["a".to_string()]);
        let filtered = filter_by_allowlist(tools, &allowlist);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "a");
    }
}
