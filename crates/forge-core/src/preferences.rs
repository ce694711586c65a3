//! Effective-settings resolution (spec §4.8): a user's saved preferences
//! only take effect where the agent's scoped config grants that override;
//! otherwise the agent (or global) default wins. Provider and API key are
//! then derived from the resolved model.

use crate::domain::{Agent, HitlLevel, UserPreferences};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    OpenAi,
    Google,
}

impl Provider {
    pub fn env_var(self) -> &'static str {
        match self {
            Provider::Anthropic => "ANTHROPIC_API_KEY",
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Google => "GOOGLE_API_KEY",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAi => "openai",
            Provider::Google => "google",
        }
    }
}

/// Derives the provider from a model name's prefix. Unknown prefixes
/// default to Anthropic, matching the spec's stated fallback.
pub fn provider_for_model(model: &str) -> Provider {
    if model.starts_with("gpt-") || model.starts_with("o3-") {
        Provider::OpenAi
    } else if model.starts_with("gemini-") {
        Provider::Google
    } else {
        Provider::Anthropic
    }
}

#[derive(Debug, Clone)]
pub struct EffectiveSettings {
    pub model: String,
    pub hitl_level: HitlLevel,
    pub provider: Provider,
    pub api_key: Option<String>,
}

pub struct PreferenceResolver;

impl PreferenceResolver {
    /// Resolves the model + HITL level a request actually runs with, then
    /// derives provider and API key. `default_model`/`env_lookup` let
    /// callers supply the global fallback model and an injectable env
    /// reader (tests don't want to depend on real process environment).
    pub fn resolve_effective(
        agent: Option<&Agent>,
        preferences: Option<&UserPreferences>,
        default_model: &str,
        env_lookup: impl Fn(&str) -> Option<String>,
    ) -> EffectiveSettings {
        let model = match agent {
            Some(a) if a.allow_user_model_select => preferences
                .and_then(|p| p.model.clone())
                .or_else(|| a.default_model.clone())
                .unwrap_or_else(|| default_model.to_string()),
            Some(a) => a.default_model.clone().unwrap_or_else(|| default_model.to_string()),
            None => preferences
                .and_then(|p| p.model.clone())
                .unwrap_or_else(|| default_model.to_string()),
        };

        let hitl_level = match agent {
            Some(a) if a.allow_user_hitl_config => preferences
                .and_then(|p| p.hitl_level)
                .unwrap_or(a.default_hitl_level),
            Some(a) => a.default_hitl_level,
            None => preferences.and_then(|p| p.hitl_level).unwrap_or_default(),
        };

        let provider = provider_for_model(&model);
        let api_key = env_lookup(provider.env_var());

        EffectiveSettings { model, hitl_level, provider, api_key }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HitlLevel;

    fn agent(allow_model: bool, allow_hitl: bool) -> Agent {
        Agent {
            id: "a".to_string(),
            display_name: "A".to_string(),
            system_prompt: None,
            default_model: Some("claude-3-5-sonnet".to_string()),
            default_hitl_level: HitlLevel::Cautious,
            allow_user_model_select: allow_model,
            allow_user_hitl_config: allow_hitl,
            tool_allowlist_raw: "*".to_string(),
            max_turns: 10,
            max_tokens: 4096,
            is_default: true,
            enabled: true,
            seeded_from_config: false,
        }
    }

    fn preferences(model: Option<&str>, hitl: Option<HitlLevel>) -> UserPreferences {
        UserPreferences {
            user_id: "u1".to_string(),
            model: model.map(|s| s.to_string()),
            hitl_level: hitl,
            updated_at: None,
        }
    }

    #[test]
    fn user_override_ignored_when_agent_disallows() {
        let agent = agent(false, false);
        let prefs = preferences(Some("gpt-4o"), Some(HitlLevel::Autonomous));
        let settings = PreferenceResolver::resolve_effective(Some(&agent), Some(&prefs), "fallback", |_| None);
        assert_eq!(settings.model, "claude-3-5-sonnet");
        assert_eq!(settings.hitl_level, HitlLevel::Cautious);
    }

    #[test]
    fn user_override_applied_when_agent_allows() {
        let agent = agent(true, true);
        let prefs = preferences(Some("gpt-4o"), Some(HitlLevel::Autonomous));
        let settings = PreferenceResolver::resolve_effective(Some(&agent), Some(&prefs), "fallback", |_| None);
        assert_eq!(settings.model, "gpt-4o");
        assert_eq!(settings.provider, Provider::OpenAi);
        assert_eq!(settings.hitl_level, HitlLevel::Autonomous);
    }

    #[test]
    fn provider_derivation_covers_known_prefixes() {
        assert_eq!(provider_for_model("claude-3-opus"), Provider::Anthropic);
        assert_eq!(provider_for_model("gpt-4o"), Provider::OpenAi);
        assert_eq!(provider_for_model("o3-mini"), Provider::OpenAi);
        assert_eq!(provider_for_model("gemini-1.5-pro"), Provider::Google);
        assert_eq!(provider_for_model("some-other-model"), Provider::Anthropic);
    }

    #[test]
    fn missing_api_key_surfaces_as_none() {
        let settings = PreferenceResolver::resolve_effective(None, None, "gpt-4o", |_| None);
        assert!(settings.api_key.is_none());
    }
}
