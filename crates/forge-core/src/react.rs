//! The ReAct orchestration loop: turn-by-turn LLM call + tool dispatch,
//! emitted as a channel of `ReactEvent` values (spec.md §9: a channel
//! stands in for the source's async generator -- the producer returns on
//! completion, the consumer drains it, and closing the channel early is how
//! a client disconnect is observed).

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::{ConversationMessage, HitlLevel, PendingToolCall, ToolSpec, VerifierOutcome};
use crate::hitl::should_pause;
use crate::verifier::VerifierRunner;

pub const DEFAULT_MAX_TURNS: u32 = 10;

#[derive(Debug, Clone, Default, Serialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Provider-agnostic conversation history shape. Concrete `LlmTurn`
/// implementations translate this into Anthropic tool-use-id threading or
/// OpenAI tool-role threading as needed -- that wire-format detail is the
/// one piece spec.md explicitly abstracts away.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum TurnMessage {
    User { content: String },
    Assistant { content: String },
    ToolUse { id: String, name: String, args: Value },
    ToolResult { tool_use_id: String, name: String, content: Value },
}

#[derive(Debug, Clone)]
pub struct LlmTurnRequest {
    pub provider: String,
    pub api_key: String,
    pub model: String,
    pub system: String,
    pub messages: Vec<TurnMessage>,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Default)]
pub struct LlmTurnOutcome {
    /// Consolidated text, when the provider assembles one: an authoritative
    /// overwrite of whatever was streamed as deltas this turn.
    pub text: Option<String>,
    pub tool_calls: Vec<PendingToolCall>,
    pub usage: Usage,
}

/// The single collaborator abstracting every LLM provider's wire format.
#[async_trait::async_trait]
pub trait LlmTurn: Send + Sync {
    /// Streams `ReactEvent::TextDelta` onto `events` as content arrives;
    /// returns once the turn is fully assembled.
    async fn call(&self, request: LlmTurnRequest, events: mpsc::Sender<ReactEvent>) -> anyhow::Result<LlmTurnOutcome>;
}

#[derive(Debug, Clone)]
pub struct ToolDispatchOutcome {
    pub status: Option<u16>,
    pub body: Value,
    pub error: Option<String>,
}

/// Dispatches one tool call over HTTP per the tool's `mcpRouting`.
#[async_trait::async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn dispatch(&self, tool: &ToolSpec, args: &Value) -> ToolDispatchOutcome;
}

pub struct HttpToolDispatcher {
    pub base_url: String,
    pub client: reqwest::Client,
}

#[async_trait::async_trait]
impl ToolDispatcher for HttpToolDispatcher {
    async fn dispatch(&self, tool: &ToolSpec, args: &Value) -> ToolDispatchOutcome {
        let Some(routing) = &tool.mcp_routing else {
            return ToolDispatchOutcome {
                status: None,
                body: Value::Null,
                error: Some("tool has no mcp routing".to_string()),
            };
        };
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), routing.endpoint);
        let method = routing.method.to_ascii_uppercase();
        let mut request = match method.as_str() {
            "GET" => self.client.get(&url),
            "POST" => self.client.post(&url),
            "PUT" => self.client.put(&url),
            "PATCH" => self.client.patch(&url),
            "DELETE" => self.client.delete(&url),
            other => {
                return ToolDispatchOutcome {
                    status: None,
                    body: Value::Null,
                    error: Some(format!("unsupported method: {other}")),
                }
            }
        };
        if method != "GET" {
            request = request.json(args);
        }
        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let body: Value = response.json().await.unwrap_or(Value::Null);
                if (200..300).contains(&status) {
                    ToolDispatchOutcome { status: Some(status), body, error: None }
                } else {
                    ToolDispatchOutcome {
                        status: Some(status),
                        body,
                        error: Some(format!("HTTP {status}")),
                    }
                }
            }
            Err(e) => ToolDispatchOutcome {
                status: None,
                body: Value::Null,
                error: Some(e.to_string()),
            },
        }
    }
}

/// State carried to the client (and back through resume) when a tool call
/// is gated on human confirmation. The loop itself never sets
/// `resume_token` -- it is filled in by the service layer once
/// `HitlEngine::pause` has actually stored the resumable state.
#[derive(Debug, Clone, Serialize)]
pub struct HitlPause {
    pub tool: String,
    pub args: Value,
    pub pending_tool_calls: Vec<PendingToolCall>,
    pub conversation_messages: Vec<ConversationMessage>,
    pub turn_index: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReactEvent {
    Text { content: String },
    TextDelta { content: String },
    ToolCall { id: String, name: String, args: Value },
    ToolResult { id: String, name: String, status: Option<u16>, body: Value, error: Option<String> },
    ToolWarning { tool: String, message: String, verifier: Option<String> },
    Hitl(HitlPause),
    Error { message: String },
    Done { usage: Usage, exhausted: bool },
}

/// What the loop actually did with a tool result after verification.
enum AfterToolCall {
    Continue,
    Warn { tool: String, message: String, verifier: String },
    Block { tool: String, message: String, verifier: String },
}

async fn run_verifier(verifier: &VerifierRunner, tool_name: &str, args: &Value, result: &Value) -> AfterToolCall {
    let results = verifier.verify(tool_name, args, result).await;
    let Some(worst) = VerifierRunner::worst(&results) else {
        return AfterToolCall::Continue;
    };
    match worst.outcome {
        VerifierOutcome::Pass => AfterToolCall::Continue,
        VerifierOutcome::Warn => AfterToolCall::Warn {
            tool: tool_name.to_string(),
            message: worst.message.clone(),
            verifier: worst.verifier_name.clone(),
        },
        VerifierOutcome::Block => AfterToolCall::Block {
            tool: tool_name.to_string(),
            message: worst.message.clone(),
            verifier: worst.verifier_name.clone(),
        },
    }
}

pub struct ReactLoopInputs {
    pub request_template: LlmTurnRequest,
    pub max_turns: u32,
    pub hitl_level: HitlLevel,
    pub session_id: String,
    pub agent_id: Option<String>,
    pub user_id: String,
}

/// What dispatching a batch of tool calls came to: either every call in the
/// batch was handled (dispatched, or a `block` verdict halted the rest), or
/// one of them needs human confirmation before anything further happens,
/// or the event channel's receiver is gone.
pub enum ToolBatchOutcome {
    Continue,
    Paused(HitlPause),
    Disconnected,
}

/// Dispatches `tool_calls[start_idx..]` in order, appending each call's
/// `ToolUse`/`ToolResult` onto `messages` as it goes. `should_pause` is
/// checked per call except at `start_idx` when `skip_pause_check` is set --
/// the resume handler already has the user's confirmation for that one, and
/// re-checking it would loop forever on a tool that always requires
/// confirmation. A `block` verifier verdict halts the remaining calls in
/// the batch without pausing; an unresolved `Hitl` stops it too, but is
/// reported back so the caller can hand the client a fresh resume token.
#[allow(clippy::too_many_arguments)]
pub async fn dispatch_tool_calls(
    tool_calls: &[PendingToolCall],
    start_idx: usize,
    skip_pause_check: bool,
    tools: &[ToolSpec],
    hitl_level: HitlLevel,
    turn_index: u32,
    dispatcher: &Arc<dyn ToolDispatcher>,
    verifier: &Arc<VerifierRunner>,
    events: &mpsc::Sender<ReactEvent>,
    cancel: &CancellationToken,
    messages: &mut Vec<TurnMessage>,
) -> ToolBatchOutcome {
    for (offset, tool_call) in tool_calls[start_idx..].iter().enumerate() {
        let idx = start_idx + offset;
        if cancel.is_cancelled() {
            return ToolBatchOutcome::Continue;
        }

        let tool_spec = tools.iter().find(|t| t.name == tool_call.name);

        let Some(tool_spec) = tool_spec else {
            let _ = events
                .send(ReactEvent::ToolResult {
                    id: tool_call.id.clone(),
                    name: tool_call.name.clone(),
                    status: None,
                    body: Value::Null,
                    error: Some(format!("unknown tool: {}", tool_call.name)),
                })
                .await;
            continue;
        };

        if !(skip_pause_check && idx == start_idx) && should_pause(hitl_level, tool_spec) {
            let pause = HitlPause {
                tool: tool_call.name.clone(),
                args: tool_call.args.clone(),
                pending_tool_calls: tool_calls.to_vec(),
                conversation_messages: Vec::new(),
                turn_index,
                message: format!("confirmation required for {}", tool_call.name),
                resume_token: None,
            };
            let _ = events.send(ReactEvent::Hitl(pause.clone())).await;
            return ToolBatchOutcome::Paused(pause);
        }

        messages.push(TurnMessage::ToolUse {
            id: tool_call.id.clone(),
            name: tool_call.name.clone(),
            args: tool_call.args.clone(),
        });

        if events
            .send(ReactEvent::ToolCall {
                id: tool_call.id.clone(),
                name: tool_call.name.clone(),
                args: tool_call.args.clone(),
            })
            .await
            .is_err()
        {
            return ToolBatchOutcome::Disconnected;
        }

        let dispatch_outcome = dispatcher.dispatch(tool_spec, &tool_call.args).await;

        if events
            .send(ReactEvent::ToolResult {
                id: tool_call.id.clone(),
                name: tool_call.name.clone(),
                status: dispatch_outcome.status,
                body: dispatch_outcome.body.clone(),
                error: dispatch_outcome.error.clone(),
            })
            .await
            .is_err()
        {
            return ToolBatchOutcome::Disconnected;
        }

        messages.push(TurnMessage::ToolResult {
            tool_use_id: tool_call.id.clone(),
            name: tool_call.name.clone(),
            content: dispatch_outcome.body.clone(),
        });

        match run_verifier(verifier, &tool_call.name, &tool_call.args, &dispatch_outcome.body).await {
            AfterToolCall::Continue => {}
            AfterToolCall::Warn { tool, message, verifier } => {
                let _ = events
                    .send(ReactEvent::ToolWarning { tool, message, verifier: Some(verifier) })
                    .await;
            }
            AfterToolCall::Block { tool, message, verifier } => {
                let _ = events
                    .send(ReactEvent::ToolWarning { tool, message, verifier: Some(verifier) })
                    .await;
                break; // halt further tool dispatch this turn.
            }
        }
    }
    ToolBatchOutcome::Continue
}

/// Runs the loop, streaming `ReactEvent`s onto `events`, until `Done`,
/// `Hitl`, or the `cancel` token fires. Returns only once terminated.
pub async fn run(
    inputs: ReactLoopInputs,
    llm: Arc<dyn LlmTurn>,
    dispatcher: Arc<dyn ToolDispatcher>,
    verifier: Arc<VerifierRunner>,
    events: mpsc::Sender<ReactEvent>,
    cancel: CancellationToken,
) {
    let mut messages = inputs.request_template.messages.clone();
    let mut total_usage = Usage::default();

    for turn_index in 0..inputs.max_turns {
        if cancel.is_cancelled() {
            return;
        }

        let turn_request = LlmTurnRequest {
            messages: messages.clone(),
            ..inputs.request_template.clone()
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            result = llm.call(turn_request, events.clone()) => result,
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = events.send(ReactEvent::Error { message: e.to_string() }).await;
                let _ = events
                    .send(ReactEvent::Done { usage: total_usage, exhausted: false })
                    .await;
                return;
            }
        };

        total_usage.add(&outcome.usage);

        if let Some(text) = &outcome.text {
            if events.send(ReactEvent::Text { content: text.clone() }).await.is_err() {
                return;
            }
            messages.push(TurnMessage::Assistant { content: text.clone() });
        }

        if outcome.tool_calls.is_empty() {
            let _ = events
                .send(ReactEvent::Done { usage: total_usage, exhausted: false })
                .await;
            return;
        }

        match dispatch_tool_calls(
            &outcome.tool_calls,
            0,
            false,
            &inputs.request_template.tools,
            inputs.hitl_level,
            turn_index,
            &dispatcher,
            &verifier,
            &events,
            &cancel,
            &mut messages,
        )
        .await
        {
            ToolBatchOutcome::Continue => {}
            ToolBatchOutcome::Paused(_) | ToolBatchOutcome::Disconnected => return,
        }
    }

    let _ = events
        .send(ReactEvent::Done { usage: total_usage, exhausted: true })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ToolLifecycle;
    use crate::verifier::{StaticVerifierRegistry, VerifierRunner};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct OneShotLlm {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl LlmTurn for OneShotLlm {
        async fn call(&self, _req: LlmTurnRequest, events: mpsc::Sender<ReactEvent>) -> anyhow::Result<LlmTurnOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                let _ = events
                    .send(ReactEvent::TextDelta { content: "Hel".to_string() })
                    .await;
                let _ = events
                    .send(ReactEvent::TextDelta { content: "lo".to_string() })
                    .await;
                Ok(LlmTurnOutcome {
                    text: Some("Hello".to_string()),
                    tool_calls: vec![],
                    usage: Usage { input_tokens: 10, output_tokens: 5 },
                })
            } else {
                Ok(LlmTurnOutcome::default())
            }
        }
    }

    struct EchoDispatcher;

    #[async_trait::async_trait]
    impl ToolDispatcher for EchoDispatcher {
        async fn dispatch(&self, _tool: &ToolSpec, args: &Value) -> ToolDispatchOutcome {
            ToolDispatchOutcome { status: Some(200), body: args.clone(), error: None }
        }
    }

    fn no_op_verifier() -> Arc<VerifierRunner> {
        Arc::new(VerifierRunner::new(Box::new(StaticVerifierRegistry::new(vec![]))))
    }

    #[tokio::test]
    async fn straight_through_chat_emits_text_then_done() {
        let (tx, mut rx) = mpsc::channel(32);
        let inputs = ReactLoopInputs {
            request_template: LlmTurnRequest {
                provider: "anthropic".to_string(),
                api_key: "key".to_string(),
                model: "claude-3".to_string(),
                system: "You are helpful".to_string(),
                messages: vec![TurnMessage::User { content: "hi".to_string() }],
                tools: vec![],
                max_tokens: 1024,
            },
            max_turns: DEFAULT_MAX_TURNS,
            hitl_level: HitlLevel::Autonomous,
            session_id: "s1".to_string(),
            agent_id: None,
            user_id: "u1".to_string(),
        };
        run(
            inputs,
            Arc::new(OneShotLlm { calls: AtomicUsize::new(0) }),
            Arc::new(EchoDispatcher),
            no_op_verifier(),
            tx,
            CancellationToken::new(),
        )
        .await;

        let mut saw_text = false;
        let mut saw_done = false;
        while let Some(event) = rx.recv().await {
            match event {
                ReactEvent::Text { content } => {
                    assert_eq!(content, "Hello");
                    saw_text = true;
                }
                ReactEvent::Done { exhausted, .. } => {
                    assert!(!exhausted);
                    saw_done = true;
                }
                _ => {}
            }
        }
        assert!(saw_text && saw_done);
    }

    struct AlwaysToolCallLlm;

    #[async_trait::async_trait]
    impl LlmTurn for AlwaysToolCallLlm {
        async fn call(&self, _req: LlmTurnRequest, _events: mpsc::Sender<ReactEvent>) -> anyhow::Result<LlmTurnOutcome> {
            Ok(LlmTurnOutcome {
                text: None,
                tool_calls: vec![PendingToolCall {
                    id: "call-1".to_string(),
                    name: "delete_user".to_string(),
                    args: serde_json::json!({"id": 42}),
                }],
                usage: Usage::default(),
            })
        }
    }

    #[tokio::test]
    async fn standard_hitl_pauses_before_dispatch() {
        let (tx, mut rx) = mpsc::channel(32);
        let tool = ToolSpec {
            name: "delete_user".to_string(),
            description: "".to_string(),
            input_schema: HashMap::new(),
            mcp_routing: Some(crate::domain::McpRouting {
                endpoint: "/users".to_string(),
                method: "DELETE".to_string(),
            }),
            requires_confirmation: false,
            lifecycle: ToolLifecycle::Promoted,
        };
        let inputs = ReactLoopInputs {
            request_template: LlmTurnRequest {
                provider: "anthropic".to_string(),
                api_key: "key".to_string(),
                model: "claude-3".to_string(),
                system: "sys".to_string(),
                messages: vec![],
                tools: vec![tool],
                max_tokens: 1024,
            },
            max_turns: DEFAULT_MAX_TURNS,
            hitl_level: HitlLevel::Standard,
            session_id: "s1".to_string(),
            agent_id: None,
            user_id: "u1".to_string(),
        };
        run(
            inputs,
            Arc::new(AlwaysToolCallLlm),
            Arc::new(EchoDispatcher),
            no_op_verifier(),
            tx,
            CancellationToken::new(),
        )
        .await;

        let mut got_hitl = false;
        while let Some(event) = rx.recv().await {
            if let ReactEvent::Hitl(pause) = event {
                assert_eq!(pause.tool, "delete_user");
                got_hitl = true;
            }
        }
        assert!(got_hitl);
    }
}
