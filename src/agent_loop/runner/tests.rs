use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use tokio::sync::Notify;
use tokio::time::timeout;

use super::*;
use crate::agent_loop::types::RunStatus;
use crate::provider::{http, AdapterRegistry, EventStream, ProviderAdapter};
use crate::tools::FnTool;
use crate::types::Usage;

// ---------------------------------------------------------------------------
// Support
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Scenario {
    /// One streamed text message, then done.
    TextOnly,
    /// Call 0: one `bash` tool call. Call 1+: text "done".
    ToolThenText,
    /// Call 0: three tool calls. Call 1+: text "done".
    ThreeToolsThenText,
    /// Call 0: partial text, then a vendor error event.
    ErrorMidStream,
    /// `start_stream` fails with HTTP 500 before any event.
    FailOnOpen,
    /// Call 0: one text delta, then the stream never produces again.
    HangAfterText,
}

fn tool_call_start(index: usize, id: &str, name: &str) -> StreamEvent {
    StreamEvent::ToolCallStart {
        content_index: index,
        id: id.into(),
        name: name.into(),
    }
}

fn events_for(scenario: Scenario, call: usize) -> Vec<StreamEvent> {
    match scenario {
        Scenario::TextOnly => vec![
            StreamEvent::MessageStart,
            StreamEvent::TextStart { content_index: 0 },
            StreamEvent::TextDelta {
                content_index: 0,
                delta: "Hel".into(),
            },
            StreamEvent::TextDelta {
                content_index: 0,
                delta: "lo".into(),
            },
            StreamEvent::TextEnd { content_index: 0 },
            StreamEvent::Usage {
                usage: Usage {
                    input: 12,
                    output: 2,
                    ..Default::default()
                },
            },
            StreamEvent::Done {
                reason: StopReason::Stop,
            },
        ],
        Scenario::ToolThenText if call == 0 => vec![
            StreamEvent::MessageStart,
            tool_call_start(0, "call-1", "bash"),
            StreamEvent::ToolCallDelta {
                content_index: 0,
                delta: "{\"command\":\"ls\"}".into(),
            },
            StreamEvent::ToolCallEnd { content_index: 0 },
            StreamEvent::Done {
                reason: StopReason::ToolUse,
            },
        ],
        Scenario::ThreeToolsThenText if call == 0 => vec![
            StreamEvent::MessageStart,
            tool_call_start(0, "call-1", "bash"),
            StreamEvent::ToolCallDelta {
                content_index: 0,
                delta: "{\"command\":\"a\"}".into(),
            },
            tool_call_start(1, "call-2", "bash"),
            StreamEvent::ToolCallDelta {
                content_index: 1,
                delta: "{\"command\":\"b\"}".into(),
            },
            tool_call_start(2, "call-3", "bash"),
            StreamEvent::ToolCallDelta {
                content_index: 2,
                delta: "{\"command\":\"c\"}".into(),
            },
            StreamEvent::ToolCallEnd { content_index: 0 },
            StreamEvent::ToolCallEnd { content_index: 1 },
            StreamEvent::ToolCallEnd { content_index: 2 },
            StreamEvent::Done {
                reason: StopReason::ToolUse,
            },
        ],
        Scenario::ErrorMidStream => vec![
            StreamEvent::MessageStart,
            StreamEvent::TextDelta {
                content_index: 0,
                delta: "par".into(),
            },
            StreamEvent::Error {
                kind: crate::error::ProviderErrorKind::ServerError,
                message: "upstream 503".into(),
            },
        ],
        Scenario::HangAfterText => vec![
            StreamEvent::MessageStart,
            StreamEvent::TextDelta {
                content_index: 0,
                delta: "stuck".into(),
            },
        ],
        // Follow-up round trips for tool scenarios.
        Scenario::ToolThenText | Scenario::ThreeToolsThenText => vec![
            StreamEvent::MessageStart,
            StreamEvent::TextDelta {
                content_index: 0,
                delta: "done".into(),
            },
            StreamEvent::Done {
                reason: StopReason::Stop,
            },
        ],
        Scenario::FailOnOpen => Vec::new(),
    }
}

struct ScriptedAdapter {
    scenario: Scenario,
    calls: AtomicUsize,
    requests: Arc<Mutex<Vec<ProviderRequest>>>,
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn provider_name(&self) -> &str {
        "stub"
    }

    async fn start_stream(
        &self,
        request: ProviderRequest,
        _cancel: CancellationToken,
    ) -> Result<EventStream> {
        self.requests.lock().expect("request lock").push(request);
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if matches!(self.scenario, Scenario::FailOnOpen) {
            return Err(http::status_to_error(500, "boom"));
        }
        let events: Vec<Result<StreamEvent>> = events_for(self.scenario, call)
            .into_iter()
            .map(Ok)
            .collect();
        if matches!(self.scenario, Scenario::HangAfterText) {
            Ok(Box::pin(stream::iter(events).chain(stream::pending())))
        } else {
            Ok(Box::pin(stream::iter(events)))
        }
    }
}

fn test_runner(scenario: Scenario) -> (LoopRunner, Arc<Mutex<Vec<ProviderRequest>>>) {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(ScriptedAdapter {
        scenario,
        calls: AtomicUsize::new(0),
        requests: requests.clone(),
    }));
    (LoopRunner::new(Arc::new(registry)), requests)
}

fn test_model() -> ModelConfig {
    ModelConfig::new("stub", "stub-model")
}

fn capture_events() -> (EventSink, Arc<Mutex<Vec<AgentEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink_events = events.clone();
    let sink: EventSink = Arc::new(move |event| {
        if let Ok(mut guard) = sink_events.lock() {
            guard.push(event);
        }
    });
    (sink, events)
}

/// Persist hook recording `role:text` lines, standing in for the session
/// tree in loop-level tests.
fn persist_recorder() -> (PersistMessageFn, Arc<Mutex<Vec<String>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink_log = log.clone();
    let persist: PersistMessageFn = Arc::new(move |message: &AgentMessage| {
        sink_log
            .lock()
            .expect("persist lock")
            .push(format!("{}:{}", message.role(), message.text()));
        Ok(format!("id-{}", sink_log.lock().expect("persist lock").len()))
    });
    (persist, log)
}

fn queue_fn(queue: Arc<Mutex<Vec<AgentMessage>>>) -> MessageBatchFn {
    Arc::new(move || {
        let queue = queue.clone();
        Box::pin(async move { std::mem::take(&mut *queue.lock().expect("queue lock")) })
    })
}

fn echo_tool(name: &str) -> Arc<dyn Tool> {
    Arc::new(FnTool::new(
        name,
        "echo the command back",
        serde_json::json!({
            "type": "object",
            "properties": { "command": { "type": "string" } },
            "required": ["command"],
        }),
        |_call_id, args, _cancel| async move {
            let command = args
                .get("command")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Ok(ToolOutput::text(format!("ran {command}")))
        },
    ))
}

fn failing_tool(name: &str) -> Arc<dyn Tool> {
    Arc::new(FnTool::new(
        name,
        "always fails",
        FnTool::empty_parameters(),
        |_call_id, _args, _cancel| async move {
            Err(CanopyError::tool("bash", "command exited with status 1"))
        },
    ))
}

fn kinds(events: &[AgentEvent]) -> Vec<&'static str> {
    events.iter().map(AgentEvent::kind).collect()
}

async fn wait(handle: RunHandle) -> RunResult {
    timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("run wait timeout")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn text_run_emits_the_lifecycle_contract_in_order() {
    let (runner, _requests) = test_runner(Scenario::TextOnly);
    let (sink, events) = capture_events();
    let request = RunRequest::new(test_model(), Vec::new())
        .with_prompt(AgentMessage::user("hi"))
        .with_event_sink(sink);

    let result = wait(runner.start(request)).await;
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.messages.len(), 2); // user + assistant

    let events = events.lock().expect("event lock");
    let kinds = kinds(&events);
    assert_eq!(
        kinds,
        vec![
            "agent_start",
            "turn_start",
            "message_start", // user prompt
            "message_end",
            "message_start", // assistant
            "message_update", // text_start
            "message_update",
            "message_update",
            "message_update", // text_end
            "message_end",
            "turn_end",
            "agent_end",
        ]
    );

    let last = events.last().expect("agent_end");
    match last {
        AgentEvent::AgentEnd { messages } => {
            assert_eq!(messages.len(), 2);
            assert_eq!(messages[1].text(), "Hello");
        }
        other => panic!("expected agent_end, got {other:?}"),
    }
}

#[tokio::test]
async fn tool_roundtrip_appends_results_in_call_order() {
    let (runner, requests) = test_runner(Scenario::ToolThenText);
    let (sink, events) = capture_events();
    let (persist, log) = persist_recorder();
    let request = RunRequest::new(test_model(), Vec::new())
        .with_prompt(AgentMessage::user("list files"))
        .with_tools(vec![echo_tool("bash")])
        .with_event_sink(sink)
        .with_persist_message(persist);

    let result = wait(runner.start(request)).await;
    assert_eq!(result.status, RunStatus::Completed);

    // Tree order: user, assistant (with tool call), tool result, final
    // assistant, each appended after its parent.
    let log = log.lock().expect("log lock");
    assert_eq!(
        *log,
        vec![
            "user:list files",
            "assistant:",
            "toolResult:ran ls",
            "assistant:done",
        ]
    );

    let events = events.lock().expect("event lock");
    let kinds = kinds(&events);
    // One turn spanning two round-trips: no second turn_start.
    assert_eq!(kinds.iter().filter(|k| **k == "turn_start").count(), 1);
    assert_eq!(kinds.iter().filter(|k| **k == "turn_end").count(), 1);
    let start_pos = kinds
        .iter()
        .position(|k| *k == "tool_execution_start")
        .expect("tool_execution_start");
    let end_pos = kinds
        .iter()
        .position(|k| *k == "tool_execution_end")
        .expect("tool_execution_end");
    assert!(start_pos < end_pos);

    // The second adapter call saw the tool result in context.
    let requests = requests.lock().expect("request lock");
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].messages.len(), 3);
    assert_eq!(requests[1].messages[2].role(), "toolResult");
}

#[tokio::test]
async fn steering_truncates_the_batch_and_starts_a_new_turn() {
    let (runner, requests) = test_runner(Scenario::ThreeToolsThenText);
    let (sink, events) = capture_events();
    let (persist, log) = persist_recorder();

    // Steering arrives at the checkpoint after the first execution.
    let steering_queue = Arc::new(Mutex::new(Vec::new()));
    let tick = Arc::new(AtomicUsize::new(0));
    let steering: SteeringMessagesFn = {
        let queue = steering_queue.clone();
        let tick = tick.clone();
        Arc::new(move || {
            let queue = queue.clone();
            let n = tick.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move {
                // Tick 1 is the pre-adapter checkpoint; tick 2 is the
                // checkpoint after the first tool execution.
                if n == 2 {
                    queue.lock().expect("queue lock").push(AgentMessage::user("B"));
                }
                std::mem::take(&mut *queue.lock().expect("queue lock"))
            })
        })
    };

    let request = RunRequest::new(test_model(), Vec::new())
        .with_prompt(AgentMessage::user("A"))
        .with_tools(vec![echo_tool("bash")])
        .with_event_sink(sink)
        .with_persist_message(persist)
        .with_steering_messages(steering);

    let result = wait(runner.start(request)).await;
    assert_eq!(result.status, RunStatus::Completed);

    // Exactly 1 real result, 2 error placeholders, then the steering
    // message, then the new assistant response.
    let log = log.lock().expect("log lock");
    assert_eq!(
        *log,
        vec![
            "user:A",
            "assistant:",
            "toolResult:ran a",
            "toolResult:Skipped due to steering message",
            "toolResult:Skipped due to steering message",
            "user:B",
            "assistant:done",
        ]
    );

    let events = events.lock().expect("event lock");
    let kinds = kinds(&events);
    // The steering injection begins a second turn without ending the run.
    assert_eq!(kinds.iter().filter(|k| **k == "turn_start").count(), 2);
    assert_eq!(kinds.iter().filter(|k| **k == "turn_end").count(), 2);
    assert_eq!(kinds.iter().filter(|k| **k == "agent_end").count(), 1);
    assert_eq!(kinds.last(), Some(&"agent_end"));

    // Skipped calls still see their tool lifecycle events.
    assert_eq!(
        kinds
            .iter()
            .filter(|k| **k == "tool_execution_start")
            .count(),
        3
    );

    // Round trip after steering carries the truncated batch + "B".
    let requests = requests.lock().expect("request lock");
    assert_eq!(requests.len(), 2);
    let last_context = &requests[1].messages;
    assert_eq!(last_context.last().expect("steering message").text(), "B");
}

#[tokio::test]
async fn follow_up_starts_a_new_turn_before_agent_end() {
    let (runner, requests) = test_runner(Scenario::TextOnly);
    let (sink, events) = capture_events();

    let follow_up_queue = Arc::new(Mutex::new(vec![AgentMessage::user("and then?")]));
    let request = RunRequest::new(test_model(), Vec::new())
        .with_prompt(AgentMessage::user("hi"))
        .with_event_sink(sink)
        .with_follow_up_messages(queue_fn(follow_up_queue.clone()));

    let result = wait(runner.start(request)).await;
    assert_eq!(result.status, RunStatus::Completed);
    assert!(follow_up_queue.lock().expect("queue lock").is_empty());

    let events = events.lock().expect("event lock");
    let kinds = kinds(&events);
    assert_eq!(kinds.iter().filter(|k| **k == "turn_start").count(), 2);
    assert_eq!(kinds.iter().filter(|k| **k == "agent_end").count(), 1);
    assert_eq!(kinds.last(), Some(&"agent_end"));
    assert_eq!(requests.lock().expect("request lock").len(), 2);
}

#[tokio::test]
async fn provider_error_marks_the_message_and_ends_the_run_without_retry() {
    let (runner, requests) = test_runner(Scenario::ErrorMidStream);
    let (sink, events) = capture_events();
    let request = RunRequest::new(test_model(), Vec::new())
        .with_prompt(AgentMessage::user("hi"))
        .with_event_sink(sink);

    let result = wait(runner.start(request)).await;
    assert_eq!(result.status, RunStatus::Failed);
    assert!(result
        .error
        .as_deref()
        .expect("error")
        .contains("upstream 503"));

    // No loop-level retry: the adapter was called exactly once.
    assert_eq!(requests.lock().expect("request lock").len(), 1);

    let events = events.lock().expect("event lock");
    let error_message_end = events.iter().any(|event| {
        matches!(
            event,
            AgentEvent::MessageEnd { message: AgentMessage::Assistant(assistant) }
                if assistant.stop_reason == StopReason::Error
                    && assistant.error_message.as_deref() == Some("server_error: upstream 503")
        )
    });
    assert!(error_message_end, "expected error-marked message_end");
    let kinds = kinds(&events);
    assert_eq!(
        &kinds[kinds.len() - 2..],
        &["turn_end", "agent_end"],
        "error path still closes the turn and the run"
    );
}

#[tokio::test]
async fn open_failure_maps_to_canonical_kind_and_fails_the_run() {
    let (runner, _requests) = test_runner(Scenario::FailOnOpen);
    let request =
        RunRequest::new(test_model(), Vec::new()).with_prompt(AgentMessage::user("hi"));

    let result = wait(runner.start(request)).await;
    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.error.expect("error").contains("server_error"));
}

#[tokio::test]
async fn tool_failure_is_surfaced_to_the_model_not_the_run() {
    let (runner, _requests) = test_runner(Scenario::ToolThenText);
    let (persist, log) = persist_recorder();
    let request = RunRequest::new(test_model(), Vec::new())
        .with_prompt(AgentMessage::user("go"))
        .with_tools(vec![failing_tool("bash")])
        .with_persist_message(persist);

    let result = wait(runner.start(request)).await;
    assert_eq!(result.status, RunStatus::Completed);

    let log = log.lock().expect("log lock");
    assert!(log
        .iter()
        .any(|line| line.starts_with("toolResult:") && line.contains("status 1")));
}

#[tokio::test]
async fn unknown_tool_becomes_an_error_result() {
    let (runner, _requests) = test_runner(Scenario::ToolThenText);
    let (persist, log) = persist_recorder();
    let request = RunRequest::new(test_model(), Vec::new())
        .with_prompt(AgentMessage::user("go"))
        .with_persist_message(persist); // no tools registered

    let result = wait(runner.start(request)).await;
    assert_eq!(result.status, RunStatus::Completed);
    let log = log.lock().expect("log lock");
    assert!(log
        .iter()
        .any(|line| line.contains("Tool 'bash' not found")));
}

#[tokio::test]
async fn argument_validation_failure_skips_the_invocation() {
    let (runner, _requests) = test_runner(Scenario::ToolThenText);
    let (persist, log) = persist_recorder();
    let invoked = Arc::new(AtomicUsize::new(0));
    let invoked_clone = invoked.clone();
    let strict_tool: Arc<dyn Tool> = Arc::new(FnTool::new(
        "bash",
        "requires a numeric command",
        serde_json::json!({
            "type": "object",
            "properties": { "command": { "type": "integer" } },
            "required": ["command"],
        }),
        move |_call_id, _args, _cancel| {
            invoked_clone.fetch_add(1, Ordering::SeqCst);
            async move { Ok(ToolOutput::text("unreachable")) }
        },
    ));

    let request = RunRequest::new(test_model(), Vec::new())
        .with_prompt(AgentMessage::user("go"))
        .with_tools(vec![strict_tool])
        .with_persist_message(persist);

    let result = wait(runner.start(request)).await;
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    let log = log.lock().expect("log lock");
    assert!(log
        .iter()
        .any(|line| line.contains("Argument validation failed")));
}

#[tokio::test]
async fn abort_mid_tool_settles_without_starting_remaining_calls() {
    let (runner, _requests) = test_runner(Scenario::ThreeToolsThenText);
    let (sink, events) = capture_events();
    let (persist, log) = persist_recorder();

    let started = Arc::new(Notify::new());
    let started_signal = started.clone();
    let hanging_tool: Arc<dyn Tool> = Arc::new(FnTool::new(
        "bash",
        "hangs until aborted",
        FnTool::empty_parameters(),
        move |_call_id, _args, _cancel| {
            let started = started_signal.clone();
            async move {
                started.notify_one();
                std::future::pending::<()>().await;
                unreachable!()
            }
        },
    ));

    let request = RunRequest::new(test_model(), Vec::new())
        .with_prompt(AgentMessage::user("go"))
        .with_tools(vec![hanging_tool])
        .with_event_sink(sink)
        .with_persist_message(persist);

    let mut handle = runner.start(request);
    timeout(Duration::from_secs(5), started.notified())
        .await
        .expect("first tool should start");
    assert!(handle.abort());

    let result = wait(handle).await;
    assert_eq!(result.status, RunStatus::Canceled);

    let events = events.lock().expect("event lock");
    let starts: Vec<&AgentEvent> = events
        .iter()
        .filter(|e| matches!(e, AgentEvent::ToolExecutionStart { .. }))
        .collect();
    // Only the in-flight call ever started; calls 2 and 3 see no events.
    assert_eq!(starts.len(), 1);

    // And the tree holds no entry for the never-started calls.
    let log = log.lock().expect("log lock");
    let tool_lines: Vec<&String> = log
        .iter()
        .filter(|line| line.starts_with("toolResult:"))
        .collect();
    assert_eq!(tool_lines.len(), 1);
    assert!(tool_lines[0].contains("canceled"));
    assert_eq!(events.last().map(AgentEvent::kind), Some("agent_end"));
}

#[tokio::test]
async fn abort_mid_stream_preserves_partial_output_as_aborted_message() {
    let (runner, _requests) = test_runner(Scenario::HangAfterText);
    let (sink, events) = capture_events();
    let (persist, log) = persist_recorder();
    let request = RunRequest::new(test_model(), Vec::new())
        .with_prompt(AgentMessage::user("hi"))
        .with_event_sink(sink)
        .with_persist_message(persist);

    let mut handle = runner.start(request);
    // Wait until the first delta is visible to subscribers, then abort.
    timeout(Duration::from_secs(5), async {
        loop {
            if events
                .lock()
                .expect("event lock")
                .iter()
                .any(|e| e.kind() == "message_update")
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stream should produce a delta");
    assert!(handle.abort());

    let result = wait(handle).await;
    assert_eq!(result.status, RunStatus::Canceled);

    let log = log.lock().expect("log lock");
    assert!(log.iter().any(|line| line == "assistant:stuck"));

    let events = events.lock().expect("event lock");
    let aborted_end = events.iter().any(|event| {
        matches!(
            event,
            AgentEvent::MessageEnd { message: AgentMessage::Assistant(a) }
                if a.stop_reason == StopReason::Aborted
        )
    });
    assert!(aborted_end, "expected aborted message_end");
}

#[tokio::test]
async fn persistence_failure_is_fatal() {
    let (runner, requests) = test_runner(Scenario::ToolThenText);
    let failures = Arc::new(AtomicUsize::new(0));
    let failures_clone = failures.clone();
    let persist: PersistMessageFn = Arc::new(move |message: &AgentMessage| {
        if message.role() == "assistant" {
            failures_clone.fetch_add(1, Ordering::SeqCst);
            return Err(CanopyError::persistence(
                "append failed",
                std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            ));
        }
        Ok("id".into())
    });

    let request = RunRequest::new(test_model(), Vec::new())
        .with_prompt(AgentMessage::user("go"))
        .with_tools(vec![echo_tool("bash")])
        .with_persist_message(persist);

    let result = wait(runner.start(request)).await;
    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.error.expect("error").contains("append failed"));
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    // The loop stopped at the first unrecordable message.
    assert_eq!(requests.lock().expect("request lock").len(), 1);
}

#[tokio::test]
async fn credential_resolver_is_invoked_once_per_adapter_call() {
    let (runner, requests) = test_runner(Scenario::ToolThenText);
    let resolutions = Arc::new(AtomicUsize::new(0));
    let resolutions_clone = resolutions.clone();
    let resolver: CredentialResolver = Arc::new(move |_provider: &str| {
        let n = resolutions_clone.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(Some(format!("key-{n}"))) })
    });

    let request = RunRequest::new(test_model(), Vec::new())
        .with_prompt(AgentMessage::user("go"))
        .with_tools(vec![echo_tool("bash")])
        .with_api_key_resolver(resolver);

    let result = wait(runner.start(request)).await;
    assert_eq!(result.status, RunStatus::Completed);

    // Two round-trips → two resolutions, each key used verbatim.
    assert_eq!(resolutions.load(Ordering::SeqCst), 2);
    let requests = requests.lock().expect("request lock");
    assert_eq!(requests[0].api_key.as_deref(), Some("key-0"));
    assert_eq!(requests[1].api_key.as_deref(), Some("key-1"));
}

#[tokio::test]
async fn unregistered_provider_fails_before_any_turn() {
    let registry = Arc::new(AdapterRegistry::new());
    let runner = LoopRunner::new(registry);
    let (sink, events) = capture_events();
    let request = RunRequest::new(test_model(), Vec::new())
        .with_prompt(AgentMessage::user("hi"))
        .with_event_sink(sink);

    let result = wait(runner.start(request)).await;
    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.error.expect("error").contains("no adapter registered"));

    let events = events.lock().expect("event lock");
    assert_eq!(kinds(&events), vec!["agent_start", "agent_end"]);
}

#[tokio::test]
async fn transform_context_shapes_the_adapter_call_only() {
    let (runner, requests) = test_runner(Scenario::TextOnly);
    let transform: TransformContextFn = Arc::new(|messages: Vec<AgentMessage>| {
        Box::pin(async move {
            messages
                .into_iter()
                .filter(|m| !m.text().contains("secret"))
                .collect()
        })
    });

    let request = RunRequest::new(
        test_model(),
        vec![AgentMessage::user("secret scratchpad note")],
    )
    .with_prompt(AgentMessage::user("hi"))
    .with_transform_context(transform);

    let result = wait(runner.start(request)).await;
    assert_eq!(result.status, RunStatus::Completed);

    let requests = requests.lock().expect("request lock");
    assert_eq!(requests[0].messages.len(), 1);
    assert_eq!(requests[0].messages[0].text(), "hi");
    // The run's own record still contains everything.
    assert_eq!(result.messages.len(), 2);
}
