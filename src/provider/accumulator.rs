//! Fold a canonical event stream into an in-progress assistant message.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::ProviderErrorKind;
use crate::types::{
    now_millis, AssistantBlock, AssistantMessage, StopReason, ToolCallBlock, Usage,
};

use super::StreamEvent;

/// One content block under construction, keyed by content index.
#[derive(Debug, Clone)]
enum PartialBlock {
    Text(String),
    Thinking(String),
    ToolCall {
        id: String,
        name: String,
        arguments_json: String,
        closed: bool,
    },
}

/// Incrementally reassembles an [`AssistantMessage`] from canonical stream
/// events.
///
/// Blocks are keyed by content index, so interleaved deltas for different
/// indices land in the right block; fragments within one index are applied
/// in arrival order. Tool-call argument JSON is parsed when the block ends.
#[derive(Debug, Clone)]
pub struct MessageAccumulator {
    provider: String,
    model: String,
    blocks: BTreeMap<usize, PartialBlock>,
    usage: Usage,
    stop_reason: Option<StopReason>,
    error_message: Option<String>,
}

impl MessageAccumulator {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            blocks: BTreeMap::new(),
            usage: Usage::default(),
            stop_reason: None,
            error_message: None,
        }
    }

    /// Apply one canonical event.
    pub fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::MessageStart => {}
            StreamEvent::TextStart { content_index } => {
                self.blocks
                    .entry(*content_index)
                    .or_insert_with(|| PartialBlock::Text(String::new()));
            }
            StreamEvent::TextDelta {
                content_index,
                delta,
            } => {
                match self
                    .blocks
                    .entry(*content_index)
                    .or_insert_with(|| PartialBlock::Text(String::new()))
                {
                    PartialBlock::Text(text) => text.push_str(delta),
                    other => {
                        tracing::debug!(content_index, "text delta for non-text block: {other:?}");
                    }
                }
            }
            StreamEvent::TextEnd { .. } => {}
            StreamEvent::ThinkingStart { content_index } => {
                self.blocks
                    .entry(*content_index)
                    .or_insert_with(|| PartialBlock::Thinking(String::new()));
            }
            StreamEvent::ThinkingDelta {
                content_index,
                delta,
            } => {
                match self
                    .blocks
                    .entry(*content_index)
                    .or_insert_with(|| PartialBlock::Thinking(String::new()))
                {
                    PartialBlock::Thinking(thinking) => thinking.push_str(delta),
                    other => {
                        tracing::debug!(
                            content_index,
                            "thinking delta for non-thinking block: {other:?}"
                        );
                    }
                }
            }
            StreamEvent::ThinkingEnd { .. } => {}
            StreamEvent::ToolCallStart {
                content_index,
                id,
                name,
            } => {
                self.blocks.insert(
                    *content_index,
                    PartialBlock::ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        arguments_json: String::new(),
                        closed: false,
                    },
                );
            }
            StreamEvent::ToolCallDelta {
                content_index,
                delta,
            } => {
                if let Some(PartialBlock::ToolCall { arguments_json, .. }) =
                    self.blocks.get_mut(content_index)
                {
                    arguments_json.push_str(delta);
                }
            }
            StreamEvent::ToolCallEnd { content_index } => {
                if let Some(PartialBlock::ToolCall { closed, .. }) =
                    self.blocks.get_mut(content_index)
                {
                    *closed = true;
                }
            }
            StreamEvent::Usage { usage } => {
                self.usage = *usage;
            }
            StreamEvent::Done { reason } => {
                self.stop_reason = Some(*reason);
            }
            StreamEvent::Error { kind, message } => {
                self.stop_reason = Some(StopReason::Error);
                self.error_message = Some(format!("{kind}: {message}"));
            }
        }
    }

    /// Mark the message as failed without a vendor error event (transport
    /// failures surfaced as stream errors).
    pub fn mark_error(&mut self, kind: ProviderErrorKind, message: impl Into<String>) {
        self.stop_reason = Some(StopReason::Error);
        self.error_message = Some(format!("{kind}: {}", message.into()));
    }

    /// Mark the message as aborted by the embedder.
    pub fn mark_aborted(&mut self) {
        self.stop_reason = Some(StopReason::Aborted);
    }

    /// Whether any content has arrived yet.
    pub fn has_content(&self) -> bool {
        !self.blocks.is_empty()
    }

    /// Point-in-time snapshot of the in-progress message.
    pub fn snapshot(&self) -> AssistantMessage {
        self.build(self.stop_reason.unwrap_or(StopReason::Stop))
    }

    /// Final message. Defaults the stop reason from content when the stream
    /// ended without a `done` event.
    pub fn finish(self) -> AssistantMessage {
        let reason = self.stop_reason.unwrap_or_else(|| {
            if self
                .blocks
                .values()
                .any(|block| matches!(block, PartialBlock::ToolCall { .. }))
            {
                StopReason::ToolUse
            } else {
                StopReason::Stop
            }
        });
        self.build(reason)
    }

    fn build(&self, stop_reason: StopReason) -> AssistantMessage {
        let content = self
            .blocks
            .values()
            .map(|block| match block {
                PartialBlock::Text(text) => AssistantBlock::Text { text: text.clone() },
                PartialBlock::Thinking(thinking) => AssistantBlock::Thinking {
                    thinking: thinking.clone(),
                    signature: None,
                },
                PartialBlock::ToolCall {
                    id,
                    name,
                    arguments_json,
                    closed,
                } => AssistantBlock::ToolCall(ToolCallBlock {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: parse_arguments(arguments_json, *closed),
                }),
            })
            .collect();

        AssistantMessage {
            content,
            provider: self.provider.clone(),
            model: self.model.clone(),
            usage: self.usage,
            stop_reason,
            error_message: self.error_message.clone(),
            timestamp: now_millis(),
        }
    }
}

/// Parse accumulated argument JSON. Empty input means "no arguments"; a
/// fragment that never became valid JSON is preserved as a string so the
/// raw payload is not lost.
fn parse_arguments(raw: &str, closed: bool) -> Value {
    if raw.trim().is_empty() {
        return if closed {
            Value::Object(serde_json::Map::new())
        } else {
            Value::Null
        };
    }
    serde_json::from_str(raw).unwrap_or_else(|_| {
        if closed {
            Value::String(raw.to_string())
        } else {
            Value::Null
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn acc() -> MessageAccumulator {
        MessageAccumulator::new("stub", "stub-model")
    }

    #[test]
    fn text_deltas_accumulate_in_order() {
        let mut acc = acc();
        acc.apply(&StreamEvent::MessageStart);
        acc.apply(&StreamEvent::TextStart { content_index: 0 });
        acc.apply(&StreamEvent::TextDelta {
            content_index: 0,
            delta: "Hel".into(),
        });
        acc.apply(&StreamEvent::TextDelta {
            content_index: 0,
            delta: "lo".into(),
        });
        acc.apply(&StreamEvent::Done {
            reason: StopReason::Stop,
        });

        let message = acc.finish();
        assert_eq!(message.text(), "Hello");
        assert_eq!(message.stop_reason, StopReason::Stop);
    }

    #[test]
    fn interleaved_content_indices_reassemble_into_ordered_blocks() {
        let mut acc = acc();
        acc.apply(&StreamEvent::ToolCallStart {
            content_index: 1,
            id: "call-a".into(),
            name: "read".into(),
        });
        acc.apply(&StreamEvent::ToolCallStart {
            content_index: 2,
            id: "call-b".into(),
            name: "write".into(),
        });
        // Argument fragments interleave across indices but stay ordered
        // within each index.
        acc.apply(&StreamEvent::ToolCallDelta {
            content_index: 2,
            delta: "{\"path\":".into(),
        });
        acc.apply(&StreamEvent::ToolCallDelta {
            content_index: 1,
            delta: "{\"path\":\"a.txt\"}".into(),
        });
        acc.apply(&StreamEvent::ToolCallDelta {
            content_index: 2,
            delta: "\"b.txt\"}".into(),
        });
        acc.apply(&StreamEvent::ToolCallEnd { content_index: 1 });
        acc.apply(&StreamEvent::ToolCallEnd { content_index: 2 });
        acc.apply(&StreamEvent::Done {
            reason: StopReason::ToolUse,
        });

        let message = acc.finish();
        let calls = message.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call-a");
        assert_eq!(calls[0].arguments, json!({ "path": "a.txt" }));
        assert_eq!(calls[1].id, "call-b");
        assert_eq!(calls[1].arguments, json!({ "path": "b.txt" }));
    }

    #[test]
    fn snapshot_leaves_unparsed_arguments_null() {
        let mut acc = acc();
        acc.apply(&StreamEvent::ToolCallStart {
            content_index: 0,
            id: "call-a".into(),
            name: "bash".into(),
        });
        acc.apply(&StreamEvent::ToolCallDelta {
            content_index: 0,
            delta: "{\"command\":".into(),
        });

        let snapshot = acc.snapshot();
        assert_eq!(snapshot.tool_calls()[0].arguments, Value::Null);
    }

    #[test]
    fn missing_done_event_defaults_stop_reason_from_content() {
        let mut with_tools = acc();
        with_tools.apply(&StreamEvent::ToolCallStart {
            content_index: 0,
            id: "c".into(),
            name: "bash".into(),
        });
        with_tools.apply(&StreamEvent::ToolCallEnd { content_index: 0 });
        assert_eq!(with_tools.finish().stop_reason, StopReason::ToolUse);

        let mut text_only = acc();
        text_only.apply(&StreamEvent::TextDelta {
            content_index: 0,
            delta: "hi".into(),
        });
        assert_eq!(text_only.finish().stop_reason, StopReason::Stop);
    }

    #[test]
    fn error_event_marks_message() {
        let mut acc = acc();
        acc.apply(&StreamEvent::TextDelta {
            content_index: 0,
            delta: "partial".into(),
        });
        acc.apply(&StreamEvent::Error {
            kind: ProviderErrorKind::ServerError,
            message: "upstream 503".into(),
        });

        let message = acc.finish();
        assert_eq!(message.stop_reason, StopReason::Error);
        assert_eq!(
            message.error_message.as_deref(),
            Some("server_error: upstream 503")
        );
        // Partial content survives the error.
        assert_eq!(message.text(), "partial");
    }

    #[test]
    fn usage_event_is_recorded() {
        let mut acc = acc();
        acc.apply(&StreamEvent::Usage {
            usage: Usage {
                input: 100,
                output: 20,
                ..Default::default()
            },
        });
        acc.apply(&StreamEvent::Done {
            reason: StopReason::Stop,
        });
        assert_eq!(acc.finish().usage.input, 100);
    }
}
