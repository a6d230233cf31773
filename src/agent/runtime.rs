//! The embeddable agent: one conversation, one run at a time.
//!
//! [`Agent`] owns the session tree, the steering/follow-up mailboxes, the
//! mutable model configuration, and the event bus. An external `send` while
//! a run is active is rejected — concurrent influence on an active run goes
//! through [`Agent::steer`] / [`Agent::follow_up`], which are safe to call
//! from any task.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::{oneshot, Notify};
use tokio_stream::wrappers::BroadcastStream;

use crate::agent_loop::{
    AgentEvent, FollowUpMessagesFn, LoopRunner, PersistMessageFn, RunRequest, RunResult,
    RunStatus, SteeringMessagesFn, TransformContextFn,
};
use crate::bus::EventBus;
use crate::error::{CanopyError, Result};
use crate::provider::{AdapterRegistry, CredentialResolver, GenerationSettings};
use crate::session::SessionManager;
use crate::tools::Tool;
use crate::types::{AgentMessage, ModelConfig, ThinkingLevel};

/// Externally observable run state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    /// No run in progress; ready to accept prompts.
    Idle,
    /// A run is actively executing.
    Running,
    /// An abort was requested; waiting for the run to wind down.
    Aborting,
}

/// Queue drain behavior for the steering/follow-up mailboxes.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum QueueDrainMode {
    /// Drain every queued message at once.
    All,
    /// Drain at most one message per checkpoint.
    OneAtATime,
}

fn drain_queue(queue: &mut Vec<AgentMessage>, mode: QueueDrainMode) -> Vec<AgentMessage> {
    match mode {
        QueueDrainMode::All => std::mem::take(queue),
        QueueDrainMode::OneAtATime => {
            if queue.is_empty() {
                Vec::new()
            } else {
                vec![queue.remove(0)]
            }
        }
    }
}

/// Point-in-time snapshot of agent observable state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentStateSnapshot {
    pub state: AgentState,
    pub model: ModelConfig,
    pub steering_mode: QueueDrainMode,
    pub follow_up_mode: QueueDrainMode,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_file: Option<String>,
    pub message_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Configuration for creating an [`Agent`].
pub struct AgentConfig {
    pub model: ModelConfig,
    /// System prompt sent with every adapter call.
    pub system_prompt: Option<String>,
    pub tools: Vec<Arc<dyn Tool>>,
    pub settings: GenerationSettings,
    pub steering_mode: QueueDrainMode,
    pub follow_up_mode: QueueDrainMode,
    /// Credential resolver, invoked once per adapter call.
    pub get_api_key: Option<CredentialResolver>,
    /// Pure projection transform applied before each adapter call.
    pub transform_context: Option<TransformContextFn>,
    /// Event-bus capacity (events retained per slow subscriber).
    pub bus_capacity: usize,
}

impl AgentConfig {
    pub fn new(model: ModelConfig) -> Self {
        Self {
            model,
            system_prompt: None,
            tools: Vec::new(),
            settings: GenerationSettings::default(),
            steering_mode: QueueDrainMode::OneAtATime,
            follow_up_mode: QueueDrainMode::OneAtATime,
            get_api_key: None,
            transform_context: None,
            bus_capacity: 1024,
        }
    }
}

/// One agent instance: session tree + loop + mailboxes + event bus.
///
/// All methods take `&self`; the instance is shared behind `Arc` between
/// the embedding application's tasks. Independent instances share nothing
/// and run fully in parallel.
pub struct Agent {
    runner: LoopRunner,
    bus: EventBus,
    state: Arc<Mutex<AgentState>>,
    model: Arc<Mutex<ModelConfig>>,
    system_prompt: Arc<Mutex<Option<String>>>,
    tools: Arc<Mutex<Vec<Arc<dyn Tool>>>>,
    settings: GenerationSettings,
    steering_mode: Arc<Mutex<QueueDrainMode>>,
    follow_up_mode: Arc<Mutex<QueueDrainMode>>,
    steering_queue: Arc<Mutex<Vec<AgentMessage>>>,
    follow_up_queue: Arc<Mutex<Vec<AgentMessage>>>,
    session: Arc<Mutex<SessionManager>>,
    get_api_key: Option<CredentialResolver>,
    transform_context: Option<TransformContextFn>,
    active_abort: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    idle_notify: Arc<Notify>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl Agent {
    /// Create an agent over a session. Use [`SessionManager::in_memory`]
    /// for ephemeral conversations.
    pub fn new(
        adapters: Arc<AdapterRegistry>,
        session: SessionManager,
        config: AgentConfig,
    ) -> Self {
        Self {
            runner: LoopRunner::new(adapters),
            bus: EventBus::new(config.bus_capacity),
            state: Arc::new(Mutex::new(AgentState::Idle)),
            model: Arc::new(Mutex::new(config.model)),
            system_prompt: Arc::new(Mutex::new(config.system_prompt)),
            tools: Arc::new(Mutex::new(config.tools)),
            settings: config.settings,
            steering_mode: Arc::new(Mutex::new(config.steering_mode)),
            follow_up_mode: Arc::new(Mutex::new(config.follow_up_mode)),
            steering_queue: Arc::new(Mutex::new(Vec::new())),
            follow_up_queue: Arc::new(Mutex::new(Vec::new())),
            session: Arc::new(Mutex::new(session)),
            get_api_key: config.get_api_key,
            transform_context: config.transform_context,
            active_abort: Arc::new(Mutex::new(None)),
            idle_notify: Arc::new(Notify::new()),
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    // -- Observation --

    pub fn state(&self) -> AgentState {
        *self.state.lock().expect("state lock")
    }

    /// Subscribe to the canonical event sequence. Every subscriber observes
    /// the same ordering.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AgentEvent> {
        self.bus.subscribe()
    }

    /// Subscribe as a `Stream`.
    pub fn subscribe_stream(&self) -> BroadcastStream<AgentEvent> {
        self.bus.subscribe_stream()
    }

    /// Current conversation as seen by the next adapter call (without the
    /// projection transform).
    pub fn messages(&self) -> Vec<AgentMessage> {
        self.session
            .lock()
            .expect("session lock")
            .build_context(None)
            .messages
    }

    /// Direct access to the session tree (branching, labels, listing).
    pub fn session(&self) -> MutexGuard<'_, SessionManager> {
        self.session.lock().expect("session lock")
    }

    pub fn model(&self) -> ModelConfig {
        self.model.lock().expect("model lock").clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("last_error lock").clone()
    }

    pub fn snapshot(&self) -> AgentStateSnapshot {
        let session = self.session.lock().expect("session lock");
        AgentStateSnapshot {
            state: self.state(),
            model: self.model(),
            steering_mode: *self.steering_mode.lock().expect("mode lock"),
            follow_up_mode: *self.follow_up_mode.lock().expect("mode lock"),
            session_id: session.session_id().to_string(),
            session_file: session.session_file().map(|p| p.display().to_string()),
            message_count: session.build_context(None).messages.len(),
            last_error: self.last_error(),
        }
    }

    /// Wait until the agent is idle.
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.idle_notify.notified();
            if self.state() == AgentState::Idle {
                return;
            }
            notified.await;
        }
    }

    // -- Mailboxes (safe from any concurrent context) --

    /// Queue a steering message. It interrupts the active turn at the next
    /// checkpoint; queued while idle, it is picked up by the next run.
    pub fn steer(&self, text: impl Into<String>) {
        self.steer_message(AgentMessage::user(text));
    }

    pub fn steer_message(&self, message: AgentMessage) {
        self.steering_queue
            .lock()
            .expect("steering queue lock")
            .push(message);
    }

    /// Queue a follow-up message. It starts a new turn once the current run
    /// would otherwise settle.
    pub fn follow_up(&self, text: impl Into<String>) {
        self.follow_up_message(AgentMessage::user(text));
    }

    pub fn follow_up_message(&self, message: AgentMessage) {
        self.follow_up_queue
            .lock()
            .expect("follow-up queue lock")
            .push(message);
    }

    pub fn clear_steering_queue(&self) {
        self.steering_queue
            .lock()
            .expect("steering queue lock")
            .clear();
    }

    pub fn clear_follow_up_queue(&self) {
        self.follow_up_queue
            .lock()
            .expect("follow-up queue lock")
            .clear();
    }

    pub fn has_queued_messages(&self) -> bool {
        !self
            .steering_queue
            .lock()
            .expect("steering queue lock")
            .is_empty()
            || !self
                .follow_up_queue
                .lock()
                .expect("follow-up queue lock")
                .is_empty()
    }

    // -- Runtime mutators (idle only) --

    /// Switch provider/model. Recorded in the session tree.
    pub fn set_model(
        &self,
        provider: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Result<()> {
        self.ensure_idle()?;
        let provider = provider.into();
        let model_id = model_id.into();
        {
            let mut model = self.model.lock().expect("model lock");
            model.provider = provider.clone();
            model.model_id = model_id.clone();
        }
        self.session
            .lock()
            .expect("session lock")
            .append_model_change(provider, model_id)?;
        Ok(())
    }

    /// Change the reasoning effort. Recorded in the session tree.
    pub fn set_thinking_level(&self, level: ThinkingLevel) -> Result<()> {
        self.ensure_idle()?;
        self.model.lock().expect("model lock").thinking_level = level;
        self.session
            .lock()
            .expect("session lock")
            .append_thinking_level_change(level)?;
        Ok(())
    }

    pub fn set_steering_mode(&self, mode: QueueDrainMode) {
        *self.steering_mode.lock().expect("mode lock") = mode;
    }

    pub fn set_follow_up_mode(&self, mode: QueueDrainMode) {
        *self.follow_up_mode.lock().expect("mode lock") = mode;
    }

    pub fn set_system_prompt(&self, prompt: Option<String>) -> Result<()> {
        self.ensure_idle()?;
        *self.system_prompt.lock().expect("system prompt lock") = prompt;
        Ok(())
    }

    pub fn set_tools(&self, tools: Vec<Arc<dyn Tool>>) -> Result<()> {
        self.ensure_idle()?;
        *self.tools.lock().expect("tools lock") = tools;
        Ok(())
    }

    // -- Run control --

    /// Send a user message and drive the loop until it settles.
    ///
    /// Rejected with [`CanopyError::InvalidState`] while a run is active —
    /// use [`Agent::steer`] / [`Agent::follow_up`] to influence an active
    /// run.
    pub async fn send(&self, text: impl Into<String>) -> Result<RunResult> {
        self.send_message(AgentMessage::user(text)).await
    }

    pub async fn send_message(&self, message: AgentMessage) -> Result<RunResult> {
        self.transition_to_running()?;
        self.run(vec![message]).await
    }

    /// Abort the active run. The loop settles with a cancellation marker;
    /// no further tool executions or adapter calls start.
    pub fn abort(&self) -> bool {
        {
            let mut state = self.state.lock().expect("state lock");
            if *state != AgentState::Running {
                return false;
            }
            *state = AgentState::Aborting;
        }
        let sender = self.active_abort.lock().expect("abort lock").take();
        match sender {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Abort any active run, then start a fresh session and clear both
    /// mailboxes.
    pub async fn reset(&self) {
        self.abort();
        self.wait_for_idle().await;

        self.clear_steering_queue();
        self.clear_follow_up_queue();
        self.session.lock().expect("session lock").new_session();
        *self.last_error.lock().expect("last_error lock") = None;
    }

    // -- Internals --

    fn ensure_idle(&self) -> Result<()> {
        if self.state() != AgentState::Idle {
            return Err(CanopyError::InvalidState(
                "agent is busy; wait for the active run to settle".into(),
            ));
        }
        Ok(())
    }

    fn transition_to_running(&self) -> Result<()> {
        let mut state = self.state.lock().expect("state lock");
        if *state != AgentState::Idle {
            return Err(CanopyError::InvalidState(
                "agent is already processing; use steer() or follow_up() to queue messages".into(),
            ));
        }
        *state = AgentState::Running;
        Ok(())
    }

    fn restore_idle(&self) {
        *self.state.lock().expect("state lock") = AgentState::Idle;
        self.idle_notify.notify_waiters();
    }

    fn steering_fn(&self) -> SteeringMessagesFn {
        let queue = self.steering_queue.clone();
        let mode = self.steering_mode.clone();
        Arc::new(move || {
            let mode = *mode.lock().expect("mode lock");
            let mut queue = queue.lock().expect("steering queue lock");
            let batch = drain_queue(&mut queue, mode);
            Box::pin(async move { batch })
        })
    }

    fn follow_up_fn(&self) -> FollowUpMessagesFn {
        let queue = self.follow_up_queue.clone();
        let mode = self.follow_up_mode.clone();
        Arc::new(move || {
            let mode = *mode.lock().expect("mode lock");
            let mut queue = queue.lock().expect("follow-up queue lock");
            let batch = drain_queue(&mut queue, mode);
            Box::pin(async move { batch })
        })
    }

    fn persist_fn(&self) -> PersistMessageFn {
        let session = self.session.clone();
        Arc::new(move |message: &AgentMessage| {
            let mut session = session.lock().map_err(|_| CanopyError::Persistence {
                message: "session lock poisoned".into(),
                source: None,
            })?;
            session.append_message(message.clone())
        })
    }

    async fn run(&self, prompts: Vec<AgentMessage>) -> Result<RunResult> {
        let (context, session_id) = {
            let session = self.session.lock().expect("session lock");
            (
                session.build_context(None).messages,
                session.session_id().to_string(),
            )
        };

        let mut request = RunRequest::new(self.model(), context)
            .with_session_id(session_id)
            .with_tools(self.tools.lock().expect("tools lock").clone())
            .with_event_sink(self.bus.sink())
            .with_persist_message(self.persist_fn())
            .with_steering_messages(self.steering_fn())
            .with_follow_up_messages(self.follow_up_fn());
        request.prompts = prompts;
        request.settings = self.settings.clone();
        if let Some(prompt) = self.system_prompt.lock().expect("system prompt lock").clone() {
            request = request.with_system_prompt(prompt);
        }
        if let Some(resolver) = &self.get_api_key {
            request = request.with_api_key_resolver(resolver.clone());
        }
        if let Some(transform) = &self.transform_context {
            request = request.with_transform_context(transform.clone());
        }

        let mut handle = self.runner.start(request);
        *self.active_abort.lock().expect("abort lock") = handle.take_abort_sender();

        let result = handle.wait().await;

        self.active_abort.lock().expect("abort lock").take();
        *self.last_error.lock().expect("last_error lock") = match result.status {
            RunStatus::Failed => result.error.clone(),
            _ => None,
        };
        self.restore_idle();

        Ok(result)
    }
}
