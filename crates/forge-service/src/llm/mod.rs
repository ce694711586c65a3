//! Default `LlmTurn` implementation: one HTTP call per provider's native
//! wire format. This is the one place provider-specific shapes are allowed
//! to leak -- everything upstream of `forge_core::react` only ever sees
//! `TurnMessage`/`LlmTurnOutcome`.

use forge_core::domain::ToolSpec;
use forge_core::react::{LlmTurn, LlmTurnOutcome, LlmTurnRequest, PendingToolCall, ReactEvent, TurnMessage, Usage};
use serde_json::{json, Value};
use tokio::sync::mpsc;

pub struct HttpLlmTurn {
    client: reqwest::Client,
}

impl HttpLlmTurn {
    pub fn new() -> Self {
        HttpLlmTurn { client: reqwest::Client::new() }
    }
}

impl Default for HttpLlmTurn {
    fn default() -> Self {
        Self::new()
    }
}

fn tools_to_anthropic(tools: &[ToolSpec]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            let properties: serde_json::Map<String, Value> = t
                .input_schema
                .iter()
                .map(|(name, field)| {
                    (
                        name.clone(),
                        json!({ "type": field.kind, "description": field.description }),
                    )
                })
                .collect();
            let required: Vec<&String> = t
                .input_schema
                .iter()
                .filter(|(_, field)| !field.optional)
                .map(|(name, _)| name)
                .collect();
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": { "type": "object", "properties": properties, "required": required },
            })
        })
        .collect()
}

fn messages_to_anthropic(messages: &[TurnMessage]) -> Vec<Value> {
    let mut out = Vec::new();
    for message in messages {
        match message {
            TurnMessage::User { content } => out.push(json!({ "role": "user", "content": content })),
            TurnMessage::Assistant { content } => out.push(json!({ "role": "assistant", "content": content })),
            TurnMessage::ToolUse { id, name, args } => out.push(json!({
                "role": "assistant",
                "content": [{ "type": "tool_use", "id": id, "name": name, "input": args }],
            })),
            TurnMessage::ToolResult { tool_use_id, content, .. } => out.push(json!({
                "role": "user",
                "content": [{ "type": "tool_result", "tool_use_id": tool_use_id, "content": content.to_string() }],
            })),
        }
    }
    out
}

fn parse_anthropic_response(body: &Value) -> LlmTurnOutcome {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    if let Some(blocks) = body.get("content").and_then(|c| c.as_array()) {
        for block in blocks {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(s) = block.get("text").and_then(|t| t.as_str()) {
                        text.push_str(s);
                    }
                }
                Some("tool_use") => {
                    tool_calls.push(PendingToolCall {
                        id: block.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                        name: block.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                        args: block.get("input").cloned().unwrap_or(Value::Null),
                    });
                }
                _ => {}
            }
        }
    }
    let usage = body.get("usage");
    LlmTurnOutcome {
        text: if text.is_empty() { None } else { Some(text) },
        tool_calls,
        usage: Usage {
            input_tokens: usage.and_then(|u| u.get("input_tokens")).and_then(|v| v.as_u64()).unwrap_or(0),
            output_tokens: usage.and_then(|u| u.get("output_tokens")).and_then(|v| v.as_u64()).unwrap_or(0),
        },
    }
}

fn messages_to_openai(messages: &[TurnMessage]) -> Vec<Value> {
    let mut out = Vec::new();
    for message in messages {
        match message {
            TurnMessage::User { content } => out.push(json!({ "role": "user", "content": content })),
            TurnMessage::Assistant { content } => out.push(json!({ "role": "assistant", "content": content })),
            TurnMessage::ToolUse { id, name, args } => out.push(json!({
                "role": "assistant",
                "content": null,
                "tool_calls": [{ "id": id, "type": "function", "function": { "name": name, "arguments": args.to_string() } }],
            })),
            TurnMessage::ToolResult { tool_use_id, content, .. } => out.push(json!({
                "role": "tool",
                "tool_call_id": tool_use_id,
                "content": content.to_string(),
            })),
        }
    }
    out
}

fn tools_to_openai(tools: &[ToolSpec]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            let properties: serde_json::Map<String, Value> = t
                .input_schema
                .iter()
                .map(|(name, field)| (name.clone(), json!({ "type": field.kind, "description": field.description })))
                .collect();
            json!({
                "type": "function",
                "function": { "name": t.name, "description": t.description, "parameters": { "type": "object", "properties": properties } },
            })
        })
        .collect()
}

fn parse_openai_response(body: &Value) -> LlmTurnOutcome {
    let message = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .and_then(|c| c.get("message"));
    let text = message.and_then(|m| m.get("content")).and_then(|c| c.as_str()).map(|s| s.to_string());
    let tool_calls = message
        .and_then(|m| m.get("tool_calls"))
        .and_then(|c| c.as_array())
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let function = call.get("function")?;
                    let arguments_raw = function.get("arguments").and_then(|a| a.as_str()).unwrap_or("{}");
                    Some(PendingToolCall {
                        id: call.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                        name: function.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                        args: serde_json::from_str(arguments_raw).unwrap_or(Value::Null),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let usage = body.get("usage");
    LlmTurnOutcome {
        text,
        tool_calls,
        usage: Usage {
            input_tokens: usage.and_then(|u| u.get("prompt_tokens")).and_then(|v| v.as_u64()).unwrap_or(0),
            output_tokens: usage.and_then(|u| u.get("completion_tokens")).and_then(|v| v.as_u64()).unwrap_or(0),
        },
    }
}

#[async_trait::async_trait]
impl LlmTurn for HttpLlmTurn {
    async fn call(&self, request: LlmTurnRequest, events: mpsc::Sender<ReactEvent>) -> anyhow::Result<LlmTurnOutcome> {
        let outcome = match request.provider.as_str() {
            "anthropic" => {
                let body = json!({
                    "model": request.model,
                    "system": request.system,
                    "max_tokens": request.max_tokens,
                    "messages": messages_to_anthropic(&request.messages),
                    "tools": tools_to_anthropic(&request.tools),
                });
                let response = self
                    .client
                    .post("https://api.anthropic.com/v1/messages")
                    .header("x-api-key", &request.api_key)
                    .header("anthropic-version", "2023-06-01")
                    .json(&body)
                    .send()
                    .await?
                    .error_for_status()?
                    .json::<Value>()
                    .await?;
                parse_anthropic_response(&response)
            }
            "openai" => {
                let mut messages = vec![json!({ "role": "system", "content": request.system })];
                messages.extend(messages_to_openai(&request.messages));
                let body = json!({
                    "model": request.model,
                    "messages": messages,
                    "max_tokens": request.max_tokens,
                    "tools": tools_to_openai(&request.tools),
                });
                let response = self
                    .client
                    .post("https://api.openai.com/v1/chat/completions")
                    .bearer_auth(&request.api_key)
                    .json(&body)
                    .send()
                    .await?
                    .error_for_status()?
                    .json::<Value>()
                    .await?;
                parse_openai_response(&response)
            }
            other => anyhow::bail!("unsupported provider: {other}"),
        };

        if let Some(text) = &outcome.text {
            let _ = events.send(ReactEvent::TextDelta { content: text.clone() }).await;
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_anthropic_text_and_tool_use() {
        let body = json!({
            "content": [
                { "type": "text", "text": "Hello" },
                { "type": "tool_use", "id": "call-1", "name": "lookup", "input": { "q": "rust" } },
            ],
            "usage": { "input_tokens": 12, "output_tokens": 8 },
        });
        let outcome = parse_anthropic_response(&body);
        assert_eq!(outcome.text.as_deref(), Some("Hello"));
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_calls[0].name, "lookup");
        assert_eq!(outcome.usage.input_tokens, 12);
    }

    #[test]
    fn parses_openai_tool_call_arguments_as_json() {
        let body = json!({
            "choices": [{ "message": { "content": null, "tool_calls": [
                { "id": "call-1", "function": { "name": "lookup", "arguments": "{\"q\":\"rust\"}" } }
            ] } }],
            "usage": { "prompt_tokens": 5, "completion_tokens": 3 },
        });
        let outcome = parse_openai_response(&body);
        assert!(outcome.text.is_none());
        assert_eq!(outcome.tool_calls[0].args, json!({"q": "rust"}));
    }
}
