//! Post-tool-call verification: ordered checks over a tool's output.
//!
//! `VerifierRunner::verify` merges the bindings for a specific tool with the
//! wildcard (`"*"`) bindings, de-duplicates by verifier name, sorts
//! ascending by the `order` string (`"A-0001"`, `"I-0001"`, ...), and
//! evaluates sequentially on the `pass < warn < block` lattice. A `block`
//! short-circuits; otherwise the worst outcome seen is returned.

pub mod pool;

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;

use crate::domain::VerifierOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierRole {
    Read,
    Write,
    Any,
}

impl VerifierRole {
    /// Outcome synthesised when sandboxed execution times out or the
    /// worker crashes: `block` for anything that writes, `warn` otherwise.
    pub fn fallback_outcome(self) -> VerifierOutcome {
        match self {
            VerifierRole::Write => VerifierOutcome::Block,
            VerifierRole::Read | VerifierRole::Any => VerifierOutcome::Warn,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchemaField {
    pub name: String,
    pub kind: String, // "string" | "number" | "boolean" | "object" | "array"
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternMode {
    Match,
    Reject,
}

#[derive(Debug, Clone)]
pub struct PatternCheck {
    pub pattern: String,
    pub mode: PatternMode,
    pub failure_outcome: VerifierOutcome,
}

/// A registered custom verifier's identity. The closure executing it is
/// supplied to the runner (or the worker pool, for sandboxed execution) out
/// of band so that `VerifierDef` stays `Clone + Send + Sync` and cheap to
/// carry around in bindings.
#[derive(Debug, Clone)]
pub struct CustomVerifierRef {
    pub verifier_name: String,
    /// Path of the verifier file, already canonicalised beneath the
    /// configured verifiers directory at registration time. `None` means
    /// the configured path escaped the directory; such a binding always
    /// evaluates to `warn`.
    pub path: Option<String>,
    pub sandboxed: bool,
}

#[derive(Debug, Clone)]
pub enum VerifierKind {
    Schema(Vec<SchemaField>),
    Pattern(PatternCheck),
    Custom(CustomVerifierRef),
}

#[derive(Debug, Clone)]
pub struct VerifierDef {
    pub name: String,
    pub order: String,
    pub role: VerifierRole,
    pub kind: VerifierKind,
}

#[derive(Debug, Clone)]
pub struct VerifierBinding {
    pub tool_name: String, // "*" for wildcard
    pub verifier: VerifierDef,
}

/// Where `VerifierRunner` looks up which verifiers apply to a tool.
pub trait VerifierRegistry: Send + Sync {
    fn bindings_for(&self, tool_name: &str) -> Vec<VerifierDef>;
}

/// Simple in-memory registry: a flat list of bindings, merged and
/// de-duplicated on every lookup.
#[derive(Default)]
pub struct StaticVerifierRegistry {
    bindings: Vec<VerifierBinding>,
}

impl StaticVerifierRegistry {
    pub fn new(bindings: Vec<VerifierBinding>) -> Self {
        StaticVerifierRegistry { bindings }
    }
}

impl VerifierRegistry for StaticVerifierRegistry {
    fn bindings_for(&self, tool_name: &str) -> Vec<VerifierDef> {
        let mut seen = HashMap::new();
        for binding in &self.bindings {
            if binding.tool_name == tool_name || binding.tool_name == "*" {
                // Per-tool bindings take precedence over wildcard ones when
                // both declare a verifier of the same name.
                seen.entry(binding.verifier.name.clone())
                    .and_modify(|existing: &mut VerifierDef| {
                        if binding.tool_name != "*" {
                            *existing = binding.verifier.clone();
                        }
                    })
                    .or_insert_with(|| binding.verifier.clone());
            }
        }
        let mut defs: Vec<VerifierDef> = seen.into_values().collect();
        defs.sort_by(|a, b| a.order.cmp(&b.order));
        defs
    }
}

#[derive(Debug, Clone)]
pub struct VerifierOutcomeResult {
    pub verifier_name: String,
    pub outcome: VerifierOutcome,
    pub message: String,
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn evaluate_schema(fields: &[SchemaField], result: &Value) -> VerifierOutcomeResult {
    for field in fields {
        let value = result.get(&field.name);
        match value {
            None if field.required => {
                return VerifierOutcomeResult {
                    verifier_name: String::new(),
                    outcome: VerifierOutcome::Block,
                    message: format!("missing required field `{}`", field.name),
                };
            }
            None => continue,
            Some(v) => {
                let actual = json_type_name(v);
                if actual != field.kind {
                    return VerifierOutcomeResult {
                        verifier_name: String::new(),
                        outcome: VerifierOutcome::Block,
                        message: format!(
                            "field `{}` expected type `{}`, got `{}`",
                            field.name, field.kind, actual
                        ),
                    };
                }
            }
        }
    }
    VerifierOutcomeResult {
        verifier_name: String::new(),
        outcome: VerifierOutcome::Pass,
        message: String::new(),
    }
}

fn evaluate_pattern(check: &PatternCheck, result: &Value) -> VerifierOutcomeResult {
    let body = match result {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let regex = match Regex::new(&check.pattern) {
        Ok(r) => r,
        Err(e) => {
            return VerifierOutcomeResult {
                verifier_name: String::new(),
                outcome: VerifierOutcome::Warn,
                message: format!("invalid pattern: {e}"),
            }
        }
    };
    let matched = regex.is_match(&body);
    let violated = match check.mode {
        PatternMode::Match => !matched,
        PatternMode::Reject => matched,
    };
    if violated {
        VerifierOutcomeResult {
            verifier_name: String::new(),
            outcome: check.failure_outcome,
            message: format!("pattern `{}` check failed ({:?})", check.pattern, check.mode),
        }
    } else {
        VerifierOutcomeResult {
            verifier_name: String::new(),
            outcome: VerifierOutcome::Pass,
            message: String::new(),
        }
    }
}

/// Hook a deployment supplies to actually run an in-process custom
/// verifier (development mode). Sandboxed execution instead goes through
/// `VerifierWorkerPool`.
pub trait CustomVerifierFn: Send + Sync {
    fn call(&self, tool_name: &str, args: &Value, result: &Value) -> (VerifierOutcome, String);
}

impl<F> CustomVerifierFn for F
where
    F: Fn(&str, &Value, &Value) -> (VerifierOutcome, String) + Send + Sync,
{
    fn call(&self, tool_name: &str, args: &Value, result: &Value) -> (VerifierOutcome, String) {
        (self)(tool_name, args, result)
    }
}

pub struct VerifierRunner {
    registry: Box<dyn VerifierRegistry>,
    custom_fns: HashMap<String, Box<dyn CustomVerifierFn>>,
    worker_pool: Option<pool::VerifierWorkerPool>,
    sandbox_by_default: bool,
}

impl VerifierRunner {
    pub fn new(registry: Box<dyn VerifierRegistry>) -> Self {
        VerifierRunner {
            registry,
            custom_fns: HashMap::new(),
            worker_pool: None,
            sandbox_by_default: true,
        }
    }

    pub fn with_worker_pool(mut self, pool: pool::VerifierWorkerPool) -> Self {
        self.worker_pool = Some(pool);
        self
    }

    pub fn development_mode(mut self) -> Self {
        self.sandbox_by_default = false;
        self
    }

    pub fn register_custom_fn(&mut self, name: impl Into<String>, f: Box<dyn CustomVerifierFn>) {
        self.custom_fns.insert(name.into(), f);
    }

    /// Terminates the sandboxed worker pool, if one is configured. Part of
    /// the process's graceful shutdown sequence; a no-op when every custom
    /// verifier runs in-process.
    pub async fn shutdown(&self) {
        if let Some(pool) = &self.worker_pool {
            pool.shutdown().await;
        }
    }

    /// Runs every applicable verifier in order; returns the worst outcome
    /// seen (or the first `block`, short-circuiting the rest).
    pub async fn verify(&self, tool_name: &str, args: &Value, result: &Value) -> Vec<VerifierOutcomeResult> {
        let defs = self.registry.bindings_for(tool_name);
        let mut evaluated = Vec::new();
        for def in defs {
            let outcome = self.evaluate_one(&def, tool_name, args, result).await;
            let is_block = outcome.outcome == VerifierOutcome::Block;
            evaluated.push(VerifierOutcomeResult {
                verifier_name: def.name.clone(),
                ..outcome
            });
            if is_block {
                break;
            }
        }
        evaluated
    }

    /// Convenience for callers that only want the single worst verdict
    /// (the handlers' `warn`/`block` branch), not the full trace.
    pub fn worst(results: &[VerifierOutcomeResult]) -> Option<&VerifierOutcomeResult> {
        results.iter().max_by_key(|r| r.outcome)
    }

    async fn evaluate_one(&self, def: &VerifierDef, tool_name: &str, args: &Value, result: &Value) -> VerifierOutcomeResult {
        let outcome = match &def.kind {
            VerifierKind::Schema(fields) => evaluate_schema(fields, result),
            VerifierKind::Pattern(check) => evaluate_pattern(check, result),
            VerifierKind::Custom(custom_ref) => self.evaluate_custom(custom_ref, def.role, tool_name, args, result).await,
        };
        VerifierOutcomeResult {
            verifier_name: def.name.clone(),
            ..outcome
        }
    }

    async fn evaluate_custom(
        &self,
        custom_ref: &CustomVerifierRef,
        role: VerifierRole,
        tool_name: &str,
        args: &Value,
        result: &Value,
    ) -> VerifierOutcomeResult {
        if custom_ref.path.is_none() {
            return VerifierOutcomeResult {
                verifier_name: custom_ref.verifier_name.clone(),
                outcome: VerifierOutcome::Warn,
                message: "verifier path escapes the configured verifiers directory".to_string(),
            };
        }

        let sandboxed = custom_ref.sandboxed && self.sandbox_by_default;
        if sandboxed {
            let Some(pool) = &self.worker_pool else {
                return VerifierOutcomeResult {
                    verifier_name: custom_ref.verifier_name.clone(),
                    outcome: VerifierOutcome::Warn,
                    message: "no sandboxed worker pool configured".to_string(),
                };
            };
            let call = pool::CustomVerifierCall {
                verifier_name: custom_ref.verifier_name.clone(),
                tool_name: tool_name.to_string(),
                args: args.clone(),
                result: result.clone(),
                role,
            };
            let (outcome, message) = pool.dispatch(call).await;
            return VerifierOutcomeResult {
                verifier_name: custom_ref.verifier_name.clone(),
                outcome,
                message,
            };
        }

        match self.custom_fns.get(&custom_ref.verifier_name) {
            Some(f) => {
                let outcome_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    f.call(tool_name, args, result)
                }));
                match outcome_result {
                    Ok((outcome, message)) => VerifierOutcomeResult {
                        verifier_name: custom_ref.verifier_name.clone(),
                        outcome,
                        message,
                    },
                    Err(panic) => {
                        let message = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "custom verifier panicked".to_string());
                        VerifierOutcomeResult {
                            verifier_name: custom_ref.verifier_name.clone(),
                            outcome: VerifierOutcome::Warn,
                            message,
                        }
                    }
                }
            }
            None => VerifierOutcomeResult {
                verifier_name: custom_ref.verifier_name.clone(),
                outcome: VerifierOutcome::Warn,
                message: "custom verifier not registered".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_binding(name: &str, order: &str, tool: &str) -> VerifierBinding {
        VerifierBinding {
            tool_name: tool.to_string(),
            verifier: VerifierDef {
                name: name.to_string(),
                order: order.to_string(),
                role: VerifierRole::Any,
                kind: VerifierKind::Schema(vec![SchemaField {
                    name: "ok".to_string(),
                    kind: "boolean".to_string(),
                    required: true,
                }]),
            },
        }
    }

    #[tokio::test]
    async fn ordering_and_block_short_circuit() {
        let mut bindings = vec![
            schema_binding("r1", "R-0001", "tool_x"),
            schema_binding("i1", "I-0001", "tool_x"),
            schema_binding("a1", "A-0001", "tool_x"),
        ];
        // a1 will block because the field is missing.
        bindings[2].verifier.kind = VerifierKind::Schema(vec![SchemaField {
            name: "must_exist".to_string(),
            kind: "string".to_string(),
            required: true,
        }]);
        let registry = StaticVerifierRegistry::new(bindings);
        let runner = VerifierRunner::new(Box::new(registry));
        let results = runner
            .verify("tool_x", &serde_json::json!({}), &serde_json::json!({"ok": true}))
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].verifier_name, "a1");
        assert_eq!(results[0].outcome, VerifierOutcome::Block);
    }

    #[tokio::test]
    async fn wildcard_merge_dedup() {
        let bindings = vec![
            schema_binding("shared", "A-0001", "*"),
            schema_binding("shared", "A-0001", "tool_x"),
            schema_binding("only_x", "B-0001", "tool_x"),
        ];
        let registry = StaticVerifierRegistry::new(bindings);
        let runner = VerifierRunner::new(Box::new(registry));
        let results = runner
            .verify("tool_x", &serde_json::json!({}), &serde_json::json!({"ok": true}))
            .await;
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn pattern_invalid_regex_warns() {
        let binding = VerifierBinding {
            tool_name: "*".to_string(),
            verifier: VerifierDef {
                name: "p1".to_string(),
                order: "A-0001".to_string(),
                role: VerifierRole::Any,
                kind: VerifierKind::Pattern(PatternCheck {
                    pattern: "(".to_string(),
                    mode: PatternMode::Match,
                    failure_outcome: VerifierOutcome::Warn,
                }),
            },
        };
        let registry = StaticVerifierRegistry::new(vec![binding]);
        let runner = VerifierRunner::new(Box::new(registry));
        let results = runner
            .verify("any_tool", &serde_json::json!({}), &serde_json::json!("hello"))
            .await;
        assert_eq!(results[0].outcome, VerifierOutcome::Warn);
    }
}
