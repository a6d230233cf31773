//! Runner interfaces and the loop engine.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{CanopyError, ProviderErrorKind, Result};
use crate::provider::{
    AdapterRegistry, CredentialResolver, GenerationSettings, MessageAccumulator, ProviderAdapter,
    ProviderRequest, StreamEvent, ToolDefinition,
};
use crate::tools::{validate_arguments, Tool, ToolOutput, ToolUpdateFn};
use crate::types::{
    now_millis, AgentMessage, AssistantMessage, ModelConfig, StopReason, ToolCallBlock,
    ToolResultMessage, UserBlock,
};

use super::events::AgentEvent;
use super::types::RunResult;

/// Callback used for streaming lifecycle events.
pub type EventSink = Arc<dyn Fn(AgentEvent) + Send + Sync>;

/// Async callback to retrieve queued messages between loop phases.
pub type MessageBatchFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Vec<AgentMessage>> + Send>> + Send + Sync>;

/// Callback draining the steering mailbox (checked before each adapter call
/// and after each tool execution).
pub type SteeringMessagesFn = MessageBatchFn;

/// Callback draining the follow-up mailbox (checked when a turn would
/// otherwise end the run).
pub type FollowUpMessagesFn = MessageBatchFn;

/// Hook to transform the projected context before each adapter call. Pure
/// with respect to stored entries — only the projection changes.
pub type TransformContextFn = Arc<
    dyn Fn(Vec<AgentMessage>) -> Pin<Box<dyn Future<Output = Vec<AgentMessage>> + Send>>
        + Send
        + Sync,
>;

/// Hook appending a completed message to durable storage, returning the new
/// entry id. A failure here is fatal: the loop must not keep operating on
/// state it could not record.
pub type PersistMessageFn = Arc<dyn Fn(&AgentMessage) -> Result<String> + Send + Sync>;

/// Request payload to start a run.
#[derive(Clone)]
pub struct RunRequest {
    pub model: ModelConfig,
    pub system_prompt: Option<String>,
    /// Reconstructed context the run starts from (excludes `prompts`).
    pub context: Vec<AgentMessage>,
    /// New input messages for this run.
    pub prompts: Vec<AgentMessage>,
    pub tools: Vec<Arc<dyn Tool>>,
    pub settings: GenerationSettings,
    /// Session id for provider-side prompt caching.
    pub session_id: Option<String>,
    /// Credential resolver, invoked once per adapter call.
    pub get_api_key: Option<CredentialResolver>,
    pub get_steering_messages: Option<SteeringMessagesFn>,
    pub get_follow_up_messages: Option<FollowUpMessagesFn>,
    pub transform_context: Option<TransformContextFn>,
    pub event_sink: Option<EventSink>,
    pub persist_message: Option<PersistMessageFn>,
}

impl RunRequest {
    pub fn new(model: ModelConfig, context: Vec<AgentMessage>) -> Self {
        Self {
            model,
            system_prompt: None,
            context,
            prompts: Vec::new(),
            tools: Vec::new(),
            settings: GenerationSettings::default(),
            session_id: None,
            get_api_key: None,
            get_steering_messages: None,
            get_follow_up_messages: None,
            transform_context: None,
            event_sink: None,
            persist_message: None,
        }
    }

    pub fn with_prompt(mut self, message: AgentMessage) -> Self {
        self.prompts.push(message);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<Arc<dyn Tool>>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_api_key_resolver(mut self, resolver: CredentialResolver) -> Self {
        self.get_api_key = Some(resolver);
        self
    }

    pub fn with_steering_messages(mut self, f: SteeringMessagesFn) -> Self {
        self.get_steering_messages = Some(f);
        self
    }

    pub fn with_follow_up_messages(mut self, f: FollowUpMessagesFn) -> Self {
        self.get_follow_up_messages = Some(f);
        self
    }

    pub fn with_transform_context(mut self, f: TransformContextFn) -> Self {
        self.transform_context = Some(f);
        self
    }

    pub fn with_event_sink(mut self, sink: EventSink) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn with_persist_message(mut self, f: PersistMessageFn) -> Self {
        self.persist_message = Some(f);
        self
    }
}

/// Handle for an in-flight run.
#[derive(Debug)]
pub struct RunHandle {
    abort_tx: Option<oneshot::Sender<()>>,
    result_rx: oneshot::Receiver<RunResult>,
}

impl RunHandle {
    fn new() -> (Self, oneshot::Receiver<()>, oneshot::Sender<RunResult>) {
        let (abort_tx, abort_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();
        (
            Self {
                abort_tx: Some(abort_tx),
                result_rx,
            },
            abort_rx,
            result_tx,
        )
    }

    /// Request cooperative cancellation. Returns `false` when the run
    /// already finished or abort was already requested.
    pub fn abort(&mut self) -> bool {
        if let Some(tx) = self.abort_tx.take() {
            return tx.send(()).is_ok();
        }
        false
    }

    /// Detach the abort sender so another owner can trigger cancellation.
    pub fn take_abort_sender(&mut self) -> Option<oneshot::Sender<()>> {
        self.abort_tx.take()
    }

    /// Wait for the run to settle.
    pub async fn wait(self) -> RunResult {
        self.result_rx
            .await
            .unwrap_or_else(|_| RunResult::canceled(Vec::new()))
    }
}

/// The default turn-state-machine runner.
pub struct LoopRunner {
    adapters: Arc<AdapterRegistry>,
}

impl LoopRunner {
    pub fn new(adapters: Arc<AdapterRegistry>) -> Self {
        Self { adapters }
    }

    /// Start a run. The returned handle resolves when the loop settles; the
    /// event sequence streams through the request's sink meanwhile.
    pub fn start(&self, request: RunRequest) -> RunHandle {
        let (handle, abort_rx, result_tx) = RunHandle::new();
        let adapters = self.adapters.clone();

        tokio::spawn(async move {
            tracing::debug!(
                provider = %request.model.provider,
                model = %request.model.model_id,
                "run start"
            );
            let emitter = EventEmitter {
                sink: request.event_sink.clone(),
            };

            let adapter = match adapters.get(&request.model.provider) {
                Ok(adapter) => adapter,
                Err(err) => {
                    emitter.emit(AgentEvent::AgentStart);
                    emitter.emit(AgentEvent::AgentEnd {
                        messages: Vec::new(),
                    });
                    let _ = result_tx.send(RunResult::failed(err.to_string(), Vec::new()));
                    return;
                }
            };

            let result = run_engine(request, adapter, emitter, abort_rx).await;
            let _ = result_tx.send(result);
        });

        handle
    }
}

#[derive(Clone)]
struct EventEmitter {
    sink: Option<EventSink>,
}

impl EventEmitter {
    fn emit(&self, event: AgentEvent) {
        if let Some(sink) = &self.sink {
            (sink)(event);
        }
    }
}

enum StreamOutcome {
    /// Message completed (possibly error-marked).
    Complete(AssistantMessage),
    /// Abort arrived mid-stream; carries the partial message if any content
    /// had been produced.
    Canceled(Option<AgentMessage>),
    Fatal(CanopyError),
}

enum ToolPhaseOutcome {
    /// All calls ran; loop back to the stream phase within the same turn.
    Continue,
    /// Steering arrived mid-batch; remaining calls were recorded as error
    /// placeholders and these messages start the next turn.
    Interrupted(Vec<AgentMessage>),
    Canceled,
    Fatal(CanopyError),
}

async fn run_engine(
    request: RunRequest,
    adapter: Arc<dyn ProviderAdapter>,
    emitter: EventEmitter,
    mut abort_rx: oneshot::Receiver<()>,
) -> RunResult {
    let tool_defs: Vec<ToolDefinition> = request
        .tools
        .iter()
        .map(|tool| ToolDefinition {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters: tool.parameters().clone(),
        })
        .collect();

    let mut messages = request.context.clone();
    let mut new_messages: Vec<AgentMessage> = Vec::new();
    let cancel = CancellationToken::new();

    // Input messages reach the tree before any event is emitted.
    let mut pending_inputs = request.prompts.clone();
    for message in &pending_inputs {
        if let Err(err) = persist_message(&request, message) {
            return RunResult::failed(err.to_string(), Vec::new());
        }
    }

    emitter.emit(AgentEvent::AgentStart);

    'outer: loop {
        emitter.emit(AgentEvent::TurnStart);
        for message in pending_inputs.drain(..) {
            emitter.emit(AgentEvent::MessageStart {
                message: message.clone(),
            });
            emitter.emit(AgentEvent::MessageEnd {
                message: message.clone(),
            });
            messages.push(message.clone());
            new_messages.push(message);
        }

        let mut turn_results: Vec<ToolResultMessage> = Vec::new();
        let mut turn_message: Option<AgentMessage> = None;

        'inner: loop {
            // Steering checkpoint: immediately before the adapter call.
            // Messages found here extend the current turn.
            let steering = drain(&request.get_steering_messages).await;
            for message in steering {
                if let Err(err) = persist_message(&request, &message) {
                    return fatal(&emitter, err, new_messages);
                }
                emitter.emit(AgentEvent::MessageStart {
                    message: message.clone(),
                });
                emitter.emit(AgentEvent::MessageEnd {
                    message: message.clone(),
                });
                messages.push(message.clone());
                new_messages.push(message);
            }

            let assistant = match run_stream_phase(
                &request,
                adapter.as_ref(),
                &tool_defs,
                &emitter,
                &mut messages,
                &mut new_messages,
                &mut abort_rx,
                &cancel,
            )
            .await
            {
                StreamOutcome::Complete(message) => message,
                StreamOutcome::Canceled(last) => {
                    emitter.emit(AgentEvent::TurnEnd {
                        message: last.or(turn_message),
                        tool_results: turn_results,
                    });
                    emitter.emit(AgentEvent::AgentEnd {
                        messages: new_messages.clone(),
                    });
                    tracing::debug!("run canceled");
                    return RunResult::canceled(new_messages);
                }
                StreamOutcome::Fatal(err) => return fatal(&emitter, err, new_messages),
            };
            turn_message = Some(AgentMessage::Assistant(assistant.clone()));

            if assistant.stop_reason == StopReason::Error {
                // Provider/transport failure: the turn ends with the
                // error-marked message and the run settles without retry.
                let reason = assistant
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "provider error".to_string());
                emitter.emit(AgentEvent::TurnEnd {
                    message: turn_message,
                    tool_results: turn_results,
                });
                emitter.emit(AgentEvent::AgentEnd {
                    messages: new_messages.clone(),
                });
                tracing::debug!(error = %reason, "run failed");
                return RunResult::failed(reason, new_messages);
            }

            let tool_calls: Vec<ToolCallBlock> =
                assistant.tool_calls().into_iter().cloned().collect();
            if tool_calls.is_empty() {
                break 'inner;
            }

            match run_tool_phase(
                &request,
                &emitter,
                &mut messages,
                &mut new_messages,
                &mut abort_rx,
                &cancel,
                &tool_calls,
                &mut turn_results,
            )
            .await
            {
                // One turn spans multiple tool round-trips: no new
                // turn_start on the way back to the stream phase.
                ToolPhaseOutcome::Continue => continue 'inner,
                ToolPhaseOutcome::Interrupted(steering) => {
                    emitter.emit(AgentEvent::TurnEnd {
                        message: turn_message,
                        tool_results: turn_results,
                    });
                    pending_inputs = steering;
                    continue 'outer;
                }
                ToolPhaseOutcome::Canceled => {
                    emitter.emit(AgentEvent::TurnEnd {
                        message: turn_message,
                        tool_results: turn_results,
                    });
                    emitter.emit(AgentEvent::AgentEnd {
                        messages: new_messages.clone(),
                    });
                    tracing::debug!("run canceled during tool execution");
                    return RunResult::canceled(new_messages);
                }
                ToolPhaseOutcome::Fatal(err) => return fatal(&emitter, err, new_messages),
            }
        }

        emitter.emit(AgentEvent::TurnEnd {
            message: turn_message,
            tool_results: turn_results,
        });

        // Settle: the run ends only when both mailboxes are empty.
        let steering = drain(&request.get_steering_messages).await;
        if !steering.is_empty() {
            pending_inputs = steering;
            for message in &pending_inputs {
                if let Err(err) = persist_message(&request, message) {
                    return fatal(&emitter, err, new_messages);
                }
            }
            continue 'outer;
        }
        let follow_ups = drain(&request.get_follow_up_messages).await;
        if !follow_ups.is_empty() {
            pending_inputs = follow_ups;
            for message in &pending_inputs {
                if let Err(err) = persist_message(&request, message) {
                    return fatal(&emitter, err, new_messages);
                }
            }
            continue 'outer;
        }

        emitter.emit(AgentEvent::AgentEnd {
            messages: new_messages.clone(),
        });
        tracing::debug!(messages = new_messages.len(), "run completed");
        return RunResult::completed(new_messages);
    }
}

async fn drain(source: &Option<MessageBatchFn>) -> Vec<AgentMessage> {
    match source {
        Some(get) => get().await,
        None => Vec::new(),
    }
}

fn persist_message(request: &RunRequest, message: &AgentMessage) -> Result<String> {
    match &request.persist_message {
        Some(persist) => persist(message),
        None => Ok(String::new()),
    }
}

fn fatal(emitter: &EventEmitter, err: CanopyError, new_messages: Vec<AgentMessage>) -> RunResult {
    tracing::error!(error = %err, "run failed fatally");
    emitter.emit(AgentEvent::AgentEnd {
        messages: new_messages.clone(),
    });
    RunResult::failed(err.to_string(), new_messages)
}

#[allow(clippy::too_many_arguments)]
async fn run_stream_phase(
    request: &RunRequest,
    adapter: &dyn ProviderAdapter,
    tool_defs: &[ToolDefinition],
    emitter: &EventEmitter,
    messages: &mut Vec<AgentMessage>,
    new_messages: &mut Vec<AgentMessage>,
    abort_rx: &mut oneshot::Receiver<()>,
    cancel: &CancellationToken,
) -> StreamOutcome {
    let mut acc = MessageAccumulator::new(
        request.model.provider.clone(),
        request.model.model_id.clone(),
    );

    // Credential resolution happens once per adapter call; keys are never
    // cached by the loop or the adapter.
    let api_key = match &request.get_api_key {
        Some(get_key) => match get_key(&request.model.provider).await {
            Ok(key) => key,
            Err(err) => {
                acc.mark_error(ProviderErrorKind::Auth, err.to_string());
                return complete_stream_message(
                    request,
                    emitter,
                    messages,
                    new_messages,
                    acc.finish(),
                    false,
                );
            }
        },
        None => None,
    };

    let mut context = messages.clone();
    if let Some(transform) = &request.transform_context {
        context = transform(context).await;
    }

    let provider_request = ProviderRequest {
        model: request.model.clone(),
        system_prompt: request.system_prompt.clone(),
        messages: context,
        tools: tool_defs.to_vec(),
        settings: request.settings.clone(),
        api_key,
        session_id: request.session_id.clone(),
    };

    let call_cancel = cancel.child_token();
    let mut stream = tokio::select! {
        _ = &mut *abort_rx => {
            cancel.cancel();
            return StreamOutcome::Canceled(None);
        }
        opened = adapter.start_stream(provider_request, call_cancel.clone()) => match opened {
            Ok(stream) => stream,
            Err(err) => {
                let Some(kind) = err.provider_kind() else {
                    return StreamOutcome::Fatal(err);
                };
                acc.mark_error(kind, err.to_string());
                return complete_stream_message(
                    request, emitter, messages, new_messages, acc.finish(), false,
                );
            }
        }
    };

    let mut message_open = false;
    loop {
        let next = tokio::select! {
            _ = &mut *abort_rx => {
                cancel.cancel();
                acc.mark_aborted();
                if !acc.has_content() && !message_open {
                    return StreamOutcome::Canceled(None);
                }
                return match complete_stream_message(
                    request, emitter, messages, new_messages, acc.finish(), message_open,
                ) {
                    StreamOutcome::Complete(message) => {
                        StreamOutcome::Canceled(Some(AgentMessage::Assistant(message)))
                    }
                    other => other,
                };
            }
            next = stream.next() => next,
        };

        match next {
            None => break,
            Some(Ok(event)) => {
                acc.apply(&event);
                match &event {
                    StreamEvent::Done { .. } | StreamEvent::Error { .. } => break,
                    StreamEvent::MessageStart | StreamEvent::Usage { .. } => {
                        open_message(emitter, &acc, &mut message_open);
                    }
                    _ => {
                        open_message(emitter, &acc, &mut message_open);
                        emitter.emit(AgentEvent::MessageUpdate {
                            message: AgentMessage::Assistant(acc.snapshot()),
                            event,
                        });
                    }
                }
            }
            Some(Err(err)) => {
                let Some(kind) = err.provider_kind() else {
                    // Unclassified errors default to terminal/fatal with the
                    // original cause preserved.
                    return StreamOutcome::Fatal(err);
                };
                acc.mark_error(kind, err.to_string());
                break;
            }
        }
    }

    let message = acc.finish();
    if message.stop_reason == StopReason::Aborted {
        if !message_open && message.content.is_empty() {
            return StreamOutcome::Canceled(None);
        }
        return match complete_stream_message(
            request,
            emitter,
            messages,
            new_messages,
            message,
            message_open,
        ) {
            StreamOutcome::Complete(message) => {
                StreamOutcome::Canceled(Some(AgentMessage::Assistant(message)))
            }
            other => other,
        };
    }
    complete_stream_message(request, emitter, messages, new_messages, message, message_open)
}

fn open_message(emitter: &EventEmitter, acc: &MessageAccumulator, message_open: &mut bool) {
    if !*message_open {
        emitter.emit(AgentEvent::MessageStart {
            message: AgentMessage::Assistant(acc.snapshot()),
        });
        *message_open = true;
    }
}

/// Persist and announce a completed assistant message.
fn complete_stream_message(
    request: &RunRequest,
    emitter: &EventEmitter,
    messages: &mut Vec<AgentMessage>,
    new_messages: &mut Vec<AgentMessage>,
    message: AssistantMessage,
    message_open: bool,
) -> StreamOutcome {
    let agent_message = AgentMessage::Assistant(message.clone());
    if let Err(err) = persist_message(request, &agent_message) {
        return StreamOutcome::Fatal(err);
    }
    if !message_open {
        emitter.emit(AgentEvent::MessageStart {
            message: agent_message.clone(),
        });
    }
    emitter.emit(AgentEvent::MessageEnd {
        message: agent_message.clone(),
    });
    messages.push(agent_message.clone());
    new_messages.push(agent_message);
    StreamOutcome::Complete(message)
}

#[allow(clippy::too_many_arguments)]
async fn run_tool_phase(
    request: &RunRequest,
    emitter: &EventEmitter,
    messages: &mut Vec<AgentMessage>,
    new_messages: &mut Vec<AgentMessage>,
    abort_rx: &mut oneshot::Receiver<()>,
    cancel: &CancellationToken,
    tool_calls: &[ToolCallBlock],
    turn_results: &mut Vec<ToolResultMessage>,
) -> ToolPhaseOutcome {
    for (call_index, call) in tool_calls.iter().enumerate() {
        emitter.emit(AgentEvent::ToolExecutionStart {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.arguments.clone(),
        });

        let (result, aborted) = tokio::select! {
            _ = &mut *abort_rx => {
                cancel.cancel();
                (canceled_tool_result(call), true)
            }
            result = execute_tool_call(request, emitter, cancel, call) => (result, false),
        };

        emitter.emit(AgentEvent::ToolExecutionEnd {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            result: result.clone(),
            is_error: result.is_error,
        });
        if let Err(err) = append_tool_result(request, emitter, messages, new_messages, &result) {
            return ToolPhaseOutcome::Fatal(err);
        }
        turn_results.push(result);

        if aborted {
            // Calls that never started get no events and no tree entries.
            return ToolPhaseOutcome::Canceled;
        }

        // Steering checkpoint: immediately after each individual execution,
        // never only after the whole batch.
        let steering = drain(&request.get_steering_messages).await;
        if !steering.is_empty() {
            for remaining in &tool_calls[call_index + 1..] {
                let skipped = skipped_tool_result(remaining);
                emitter.emit(AgentEvent::ToolExecutionStart {
                    tool_call_id: remaining.id.clone(),
                    tool_name: remaining.name.clone(),
                    args: remaining.arguments.clone(),
                });
                emitter.emit(AgentEvent::ToolExecutionEnd {
                    tool_call_id: remaining.id.clone(),
                    tool_name: remaining.name.clone(),
                    result: skipped.clone(),
                    is_error: true,
                });
                if let Err(err) =
                    append_tool_result(request, emitter, messages, new_messages, &skipped)
                {
                    return ToolPhaseOutcome::Fatal(err);
                }
                turn_results.push(skipped);
            }
            for message in &steering {
                if let Err(err) = persist_message(request, message) {
                    return ToolPhaseOutcome::Fatal(err);
                }
            }
            return ToolPhaseOutcome::Interrupted(steering);
        }
    }

    ToolPhaseOutcome::Continue
}

/// Execute one call against the registered tools. Validation failures and
/// unknown tools become error-flagged results without an invocation.
async fn execute_tool_call(
    request: &RunRequest,
    emitter: &EventEmitter,
    cancel: &CancellationToken,
    call: &ToolCallBlock,
) -> ToolResultMessage {
    let Some(tool) = request.tools.iter().find(|tool| tool.name() == call.name) else {
        return error_tool_result(call, format!("Tool '{}' not found", call.name));
    };

    if let Err(violation) = validate_arguments(&call.arguments, tool.parameters()) {
        return error_tool_result(call, format!("Argument validation failed: {violation}"));
    }

    let update_emitter = emitter.clone();
    let update_call = call.clone();
    let on_update: ToolUpdateFn = Arc::new(move |partial: ToolOutput| {
        update_emitter.emit(AgentEvent::ToolExecutionUpdate {
            tool_call_id: update_call.id.clone(),
            tool_name: update_call.name.clone(),
            args: update_call.arguments.clone(),
            partial,
        });
    });

    match tool
        .execute(&call.id, &call.arguments, cancel.child_token(), Some(on_update))
        .await
    {
        Ok(output) => ToolResultMessage {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            content: output.content,
            details: output.details,
            is_error: false,
            timestamp: now_millis(),
        },
        Err(CanopyError::Canceled) => canceled_tool_result(call),
        Err(err) => error_tool_result(call, err.to_string()),
    }
}

fn error_tool_result(call: &ToolCallBlock, message: String) -> ToolResultMessage {
    ToolResultMessage {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        content: vec![UserBlock::Text { text: message }],
        details: None,
        is_error: true,
        timestamp: now_millis(),
    }
}

fn canceled_tool_result(call: &ToolCallBlock) -> ToolResultMessage {
    error_tool_result(call, "Tool execution canceled".to_string())
}

/// Synthetic failure recorded for a call that never started because a
/// steering message truncated the batch.
fn skipped_tool_result(call: &ToolCallBlock) -> ToolResultMessage {
    error_tool_result(call, "Skipped due to steering message".to_string())
}

fn append_tool_result(
    request: &RunRequest,
    emitter: &EventEmitter,
    messages: &mut Vec<AgentMessage>,
    new_messages: &mut Vec<AgentMessage>,
    result: &ToolResultMessage,
) -> Result<()> {
    let message = AgentMessage::ToolResult(result.clone());
    persist_message(request, &message)?;
    emitter.emit(AgentEvent::MessageStart {
        message: message.clone(),
    });
    emitter.emit(AgentEvent::MessageEnd {
        message: message.clone(),
    });
    messages.push(message.clone());
    new_messages.push(message);
    Ok(())
}

#[cfg(test)]
mod tests;
