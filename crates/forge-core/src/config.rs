//! Runtime configuration overlay: a hot-swappable, process-local view of
//! the four tunable sections (model defaults, HITL policy, permissions,
//! conversation window) layered under whatever an `Agent` specifies.
//!
//! Loaded from a JSON file with `${VAR}` substitution against the process
//! environment, and persisted back atomically (temp file + rename) so a
//! crash mid-write never leaves a torn config on disk. Held in an
//! `ArcSwap` so readers never block on a concurrent admin update.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    pub default_model: String,
    pub max_turns: u32,
    pub max_tokens: u32,
}

impl Default for ModelSection {
    fn default() -> Self {
        ModelSection {
            default_model: "claude-3-5-sonnet-20241022".to_string(),
            max_turns: crate::react::DEFAULT_MAX_TURNS,
            max_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlSection {
    pub default_level: crate::domain::HitlLevel,
}

impl Default for HitlSection {
    fn default() -> Self {
        HitlSection { default_level: crate::domain::HitlLevel::Cautious }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionsSection {
    pub allow_user_model_select: bool,
    pub allow_user_hitl_config: bool,
}

impl Default for PermissionsSection {
    fn default() -> Self {
        PermissionsSection { allow_user_model_select: false, allow_user_hitl_config: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSection {
    pub window: usize,
}

impl Default for ConversationSection {
    fn default() -> Self {
        ConversationSection { window: 25 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeOverlay {
    pub model: ModelSection,
    pub hitl: HitlSection,
    pub permissions: PermissionsSection,
    pub conversation: ConversationSection,
    /// Fallback system prompt used when neither the agent nor the active
    /// stored prompt supplies one. Below both in the precedence chain.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[source] std::io::Error),
    #[error("invalid config JSON: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("invalid env var name in substitution: {0}")]
    InvalidEnvVarName(String),
    #[error("failed to persist config: {0}")]
    Write(#[source] std::io::Error),
}

fn env_var_name_pattern() -> Regex {
    Regex::new(r"^[A-Z_][A-Z0-9_]*$").expect("static pattern")
}

/// Replaces every `${VAR_NAME}` in `raw` with the value of the named
/// environment variable (via `env_lookup`). Names must match
/// `^[A-Z_][A-Z0-9_]*$`; anything else is rejected rather than silently
/// left untouched.
pub fn substitute_env_vars(raw: &str, env_lookup: impl Fn(&str) -> Option<String>) -> Result<String, ConfigError> {
    let pattern = Regex::new(r"\$\{([^}]*)\}").expect("static pattern");
    let name_pattern = env_var_name_pattern();
    let mut result = String::with_capacity(raw.len());
    let mut last_end = 0;
    for capture in pattern.captures_iter(raw) {
        let whole = capture.get(0).expect("group 0 always present");
        let name = capture.get(1).expect("one capture group").as_str();
        if !name_pattern.is_match(name) {
            return Err(ConfigError::InvalidEnvVarName(name.to_string()));
        }
        result.push_str(&raw[last_end..whole.start()]);
        result.push_str(&env_lookup(name).unwrap_or_default());
        last_end = whole.end();
    }
    result.push_str(&raw[last_end..]);
    Ok(result)
}

impl RuntimeOverlay {
    pub fn load_from_str(raw: &str, env_lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(raw, env_lookup)?;
        serde_json::from_str(&substituted).map_err(ConfigError::Parse)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
        Self::load_from_str(&raw, |name| std::env::var(name).ok())
    }

    /// Writes `self` as JSON to `path` via a sibling temp file + rename, so
    /// a reader never observes a partially-written file.
    pub fn persist_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self).expect("RuntimeOverlay always serializes");
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = PathBuf::from(dir);
        tmp.push(format!(".{}.tmp", path.file_name().and_then(|n| n.to_str()).unwrap_or("forge-config")));
        std::fs::write(&tmp, json).map_err(ConfigError::Write)?;
        std::fs::rename(&tmp, path).map_err(ConfigError::Write)?;
        Ok(())
    }
}

/// The base runtime config overlaid with one agent's overrides, for the
/// duration of a single request (spec.md's "scoped config").
#[derive(Debug, Clone)]
pub struct ScopedConfig {
    pub default_model: String,
    pub max_turns: u32,
    pub max_tokens: u32,
    pub default_hitl_level: crate::domain::HitlLevel,
    pub allow_user_model_select: bool,
    pub allow_user_hitl_config: bool,
    pub system_prompt: Option<String>,
    pub conversation_window: usize,
}

impl ScopedConfig {
    /// Builds the scoped config for a request: base overlay values, with
    /// each field replaced by the agent's own value when one is present.
    pub fn build(overlay: &RuntimeOverlay, agent: Option<&crate::domain::Agent>) -> ScopedConfig {
        match agent {
            Some(a) => ScopedConfig {
                default_model: a.default_model.clone().unwrap_or_else(|| overlay.model.default_model.clone()),
                max_turns: a.max_turns,
                max_tokens: a.max_tokens,
                default_hitl_level: a.default_hitl_level,
                allow_user_model_select: a.allow_user_model_select,
                allow_user_hitl_config: a.allow_user_hitl_config,
                system_prompt: a.system_prompt.clone().or_else(|| overlay.system_prompt.clone()),
                conversation_window: overlay.conversation.window,
            },
            None => ScopedConfig {
                default_model: overlay.model.default_model.clone(),
                max_turns: overlay.model.max_turns,
                max_tokens: overlay.model.max_tokens,
                default_hitl_level: overlay.hitl.default_level,
                allow_user_model_select: overlay.permissions.allow_user_model_select,
                allow_user_hitl_config: overlay.permissions.allow_user_hitl_config,
                system_prompt: overlay.system_prompt.clone(),
                conversation_window: overlay.conversation.window,
            },
        }
    }
}

/// Hot-swappable handle shared across the process. Readers call `current()`
/// and never block; an admin update swaps in a fresh `Arc` wholesale.
pub struct ConfigHandle {
    current: ArcSwap<RuntimeOverlay>,
}

impl ConfigHandle {
    pub fn new(initial: RuntimeOverlay) -> Self {
        ConfigHandle { current: ArcSwap::from_pointee(initial) }
    }

    pub fn current(&self) -> Arc<RuntimeOverlay> {
        self.current.load_full()
    }

    pub fn swap(&self, new_value: RuntimeOverlay) {
        self.current.store(Arc::new(new_value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitution_replaces_known_vars() {
        let raw = r#"{"model":{"default_model":"${MODEL_NAME}","max_turns":10,"max_tokens":4096},"hitl":{"default_level":"cautious"},"permissions":{"allow_user_model_select":false,"allow_user_hitl_config":true},"conversation":{"window":25}}"#;
        let overlay = RuntimeOverlay::load_from_str(raw, |name| {
            if name == "MODEL_NAME" {
                Some("claude-3-5-sonnet".to_string())
            } else {
                None
            }
        })
        .unwrap();
        assert_eq!(overlay.model.default_model, "claude-3-5-sonnet");
    }

    #[test]
    fn substitution_rejects_invalid_names() {
        let result = substitute_env_vars("${not-valid}", |_| None);
        assert!(matches!(result, Err(ConfigError::InvalidEnvVarName(_))));
    }

    #[test]
    fn missing_var_substitutes_empty_string() {
        let result = substitute_env_vars("prefix-${UNSET_VAR}-suffix", |_| None).unwrap();
        assert_eq!(result, "prefix--suffix");
    }

    #[test]
    fn persist_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forge-config.json");
        let overlay = RuntimeOverlay::default();
        overlay.persist_to_file(&path).unwrap();
        let reloaded = RuntimeOverlay::load_from_file(&path).unwrap();
        assert_eq!(reloaded.conversation.window, overlay.conversation.window);
    }

    fn sample_agent() -> crate::domain::Agent {
        crate::domain::Agent {
            id: "a".to_string(),
            display_name: "A".to_string(),
            system_prompt: Some("be terse".to_string()),
            default_model: Some("claude-3-5-haiku".to_string()),
            default_hitl_level: crate::domain::HitlLevel::Paranoid,
            allow_user_model_select: true,
            allow_user_hitl_config: false,
            tool_allowlist_raw: "*".to_string(),
            max_turns: 4,
            max_tokens: 1024,
            is_default: false,
            enabled: true,
            seeded_from_config: false,
        }
    }

    #[test]
    fn scoped_config_without_agent_uses_overlay_defaults() {
        let overlay = RuntimeOverlay::default();
        let scoped = ScopedConfig::build(&overlay, None);
        assert_eq!(scoped.default_model, overlay.model.default_model);
        assert_eq!(scoped.system_prompt, None);
    }

    #[test]
    fn scoped_config_with_agent_overrides_base() {
        let overlay = RuntimeOverlay::default();
        let agent = sample_agent();
        let scoped = ScopedConfig::build(&overlay, Some(&agent));
        assert_eq!(scoped.default_model, "claude-3-5-haiku");
        assert_eq!(scoped.max_turns, 4);
        assert_eq!(scoped.default_hitl_level, crate::domain::HitlLevel::Paranoid);
        assert_eq!(scoped.system_prompt.as_deref(), Some("be terse"));
    }

    #[test]
    fn config_handle_swap_is_visible_to_readers() {
        let handle = ConfigHandle::new(RuntimeOverlay::default());
        assert_eq!(handle.current().conversation.window, 25);
        let mut updated = RuntimeOverlay::default();
        updated.conversation.window = 50;
        handle.swap(updated);
        assert_eq!(handle.current().conversation.window, 50);
    }
}
