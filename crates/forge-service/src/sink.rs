//! `/agent-api/chat` and `/agent-api/chat-sync` share ~90% of their logic
//! (spec §9): both drive the same loop and react to the same events, and
//! differ only in where the events go. `EventSink` is that seam.

use forge_core::react::ReactEvent;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub args: Value,
    pub status: Option<u16>,
    pub result: Value,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolWarningRecord {
    pub tool: String,
    pub message: String,
    pub verifier: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct BufferedOutcome {
    pub message: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub warnings: Vec<ToolWarningRecord>,
    pub flags: Vec<String>,
}

pub trait EventSink: Send {
    /// Forwards one event downstream (an SSE frame, or into an in-memory
    /// accumulator). Returns `false` once the sink can no longer accept
    /// events (client disconnected).
    fn forward(&mut self, event: &ReactEvent) -> bool;
}

pub mod sse {
    use super::*;
    use axum::response::sse::Event;
    use tokio::sync::mpsc;

    /// Serializes each `ReactEvent` as one SSE frame
    /// (`event: <type>\ndata: <json>\n\n`) and pushes it onto the stream
    /// channel the handler's response body is built from.
    pub struct SseSink {
        tx: mpsc::Sender<Result<Event, std::convert::Infallible>>,
    }

    impl SseSink {
        pub fn new(tx: mpsc::Sender<Result<Event, std::convert::Infallible>>) -> Self {
            SseSink { tx }
        }

        fn event_name(event: &ReactEvent) -> &'static str {
            match event {
                ReactEvent::Text { .. } => "text",
                ReactEvent::TextDelta { .. } => "text_delta",
                ReactEvent::ToolCall { .. } => "tool_call",
                ReactEvent::ToolResult { .. } => "tool_result",
                ReactEvent::ToolWarning { .. } => "tool_warning",
                ReactEvent::Hitl(_) => "hitl",
                ReactEvent::Error { .. } => "error",
                ReactEvent::Done { .. } => "done",
            }
        }
    }

    impl EventSink for SseSink {
        fn forward(&mut self, event: &ReactEvent) -> bool {
            let name = Self::event_name(event);
            let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
            self.tx.try_send(Ok(Event::default().event(name).data(data))).is_ok()
        }
    }
}

pub use sse::SseSink;

/// Wraps another sink purely to tally what passed through it -- the
/// streaming handlers need tool/warning/hitl counts for their audit row but
/// have no buffered outcome to read them back from the way `chat-sync` does.
pub struct CountingSink<'a> {
    inner: &'a mut dyn EventSink,
    pub tool_calls: u32,
    pub warnings: u32,
    pub hitl_triggered: bool,
}

impl<'a> CountingSink<'a> {
    pub fn new(inner: &'a mut dyn EventSink) -> Self {
        CountingSink { inner, tool_calls: 0, warnings: 0, hitl_triggered: false }
    }
}

impl<'a> EventSink for CountingSink<'a> {
    fn forward(&mut self, event: &ReactEvent) -> bool {
        match event {
            ReactEvent::ToolCall { .. } => self.tool_calls += 1,
            ReactEvent::ToolWarning { .. } => self.warnings += 1,
            ReactEvent::Hitl(_) => self.hitl_triggered = true,
            _ => {}
        }
        self.inner.forward(event)
    }
}

/// Buffers a loop run into the single JSON object `chat-sync` returns.
/// Multiple `Text`/`TextDelta` events: last full `Text` wins; deltas
/// accumulate only until the first authoritative `Text` overwrite arrives.
pub struct BufferSink {
    pub outcome: BufferedOutcome,
    delta_buffer: String,
    text_finalized: bool,
    pub hitl: Option<forge_core::react::HitlPause>,
}

impl BufferSink {
    pub fn new() -> Self {
        BufferSink {
            outcome: BufferedOutcome::default(),
            delta_buffer: String::new(),
            text_finalized: false,
            hitl: None,
        }
    }
}

impl Default for BufferSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for BufferSink {
    fn forward(&mut self, event: &ReactEvent) -> bool {
        match event {
            ReactEvent::TextDelta { content } => {
                if !self.text_finalized {
                    self.delta_buffer.push_str(content);
                    self.outcome.message = self.delta_buffer.clone();
                }
            }
            ReactEvent::Text { content } => {
                self.outcome.message = content.clone();
                self.text_finalized = true;
            }
            ReactEvent::ToolCall { id, name, args } => {
                self.outcome.tool_calls.push(ToolCallRecord {
                    id: id.clone(),
                    name: name.clone(),
                    args: args.clone(),
                    status: None,
                    result: Value::Null,
                    error: None,
                });
            }
            ReactEvent::ToolResult { id, status, body, error, .. } => {
                if let Some(record) = self.outcome.tool_calls.iter_mut().find(|r| &r.id == id) {
                    record.status = *status;
                    record.result = body.clone();
                    record.error = error.clone();
                }
            }
            ReactEvent::ToolWarning { tool, message, verifier } => {
                self.outcome.warnings.push(ToolWarningRecord {
                    tool: tool.clone(),
                    message: message.clone(),
                    verifier: verifier.clone(),
                });
            }
            ReactEvent::Hitl(pause) => {
                self.hitl = Some(pause.clone());
            }
            ReactEvent::Error { message } => {
                self.outcome.flags.push(format!("error: {message}"));
            }
            ReactEvent::Done { .. } => {}
        }
        true
    }
}
