use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use murmur_config::AgentConfig;
use murmur_fabric::{
    Broker, Delivery, ErrorRateLimiter, FabricError, Notification, NotificationType, MAX_RETRIES,
};
use murmur_llm::{LanguageModel, LlmError};
use murmur_memory::{MemoryCreator, MemoryRetriever};
use murmur_store::{
    AgentStatus, GatewayEgress, MessageRole, ProcessingState, StateStore, StoreError,
    StoredMessage, ToolsPosition,
};
use murmur_tools::{SleepRegistry, ToolChannel, ToolRegistry, FAST_MODE_TOOLS};

use crate::context::{
    inject_pending_images, ContextBuilder, ContextMessage, ImageAttachment, ParseError,
    ToolCallRequest,
};
use crate::convert::to_llm_messages;
use crate::session::CallSession;

/// A non-idle processing state older than this is stale and force-reset.
const STALE_STATE_TIMEOUT_SECONDS: i64 = 300;

/// Failure classification for one processing cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Fabric(#[from] FabricError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("{0}")]
    Other(String),
}

impl CycleError {
    pub fn is_transient(&self) -> bool {
        match self {
            CycleError::Llm(err) => err.is_transient(),
            CycleError::Store(err) => err.is_transient(),
            CycleError::Fabric(err) => err.is_transient(),
            CycleError::Parse(_) => false,
            // Wrapped foreign errors only have their message to go on.
            CycleError::Other(message) => is_transient_message(message),
        }
    }
}

/// Keyword fallback for errors that cross the boundary untyped.
pub fn is_transient_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    ["timeout", "connection", "network", "temporary", "unavailable", "rate limit"]
        .iter()
        .any(|keyword| lowered.contains(keyword))
}

/// What a successful cycle hands back to the tick for post-ack work.
struct CycleOutput {
    creator_messages: Option<Vec<StoredMessage>>,
}

/// The perceive→think→act loop for one agent.
///
/// Single-tasked: one cycle at a time, guarded by a non-blocking processing
/// lock on top of the store-visible processing state. Tools and the sleep
/// timer publish back onto the same queue and are consumed on later ticks.
pub struct Agent {
    config: AgentConfig,
    description: String,
    queue: String,
    broker: Arc<Broker>,
    store: Arc<dyn StateStore>,
    egress: Arc<dyn GatewayEgress>,
    llm: Arc<dyn LanguageModel>,
    tools: ToolRegistry,
    sleep_registry: Arc<SleepRegistry>,
    creator: Option<MemoryCreator>,
    retriever: Option<MemoryRetriever>,
    context: ContextBuilder,
    session: CallSession,
    pending_images: Vec<ImageAttachment>,
    processing_lock: Arc<tokio::sync::Mutex<()>>,
    error_limiter: ErrorRateLimiter,
    halted: bool,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AgentConfig,
        description: &str,
        broker: Arc<Broker>,
        store: Arc<dyn StateStore>,
        egress: Arc<dyn GatewayEgress>,
        llm: Arc<dyn LanguageModel>,
        tools: ToolRegistry,
        sleep_registry: Arc<SleepRegistry>,
        creator: Option<MemoryCreator>,
        retriever: Option<MemoryRetriever>,
    ) -> Self {
        let queue = config.queue_name();
        let context = ContextBuilder::new(config.max_conversation_messages);
        Self {
            config,
            description: description.to_string(),
            queue,
            broker,
            store,
            egress,
            llm,
            tools,
            sleep_registry,
            creator,
            retriever,
            context,
            session: CallSession::default(),
            pending_images: Vec::new(),
            processing_lock: Arc::new(tokio::sync::Mutex::new(())),
            error_limiter: ErrorRateLimiter::new(),
            halted: false,
        }
    }

    pub fn session(&self) -> &CallSession {
        &self.session
    }

    /// Main polling loop. Returns when the shutdown signal fires or the
    /// agent's status goes `off`.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(agent = %self.config.agent_display_name, queue = %self.queue, "starting agent");
        self.store.set_agent_status(AgentStatus::Active).await?;
        self.store
            .set_processing_state(ProcessingState::Idle)
            .await?;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.check_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_ok() && *shutdown.borrow() {
                        info!("shutdown signal received");
                        break;
                    }
                    continue;
                }
            }

            self.tick().await;
            if self.halted {
                break;
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Graceful teardown: status off, processing state idle, timers gone.
    pub async fn stop(&mut self) {
        info!(agent = %self.config.agent_display_name, "stopping agent");
        if let Err(err) = self.store.set_agent_status(AgentStatus::Off).await {
            warn!(error = %err, "failed to set off status during stop");
        }
        if let Err(err) = self.store.set_processing_state(ProcessingState::Idle).await {
            warn!(error = %err, "failed to reset processing state during stop");
        }
        self.sleep_registry.cancel(&self.config.agent_name);
        info!("agent stopped");
    }

    /// One poll iteration: the tick either does nothing or runs exactly one
    /// cycle. Public so harnesses can drive the loop deterministically.
    pub async fn tick(&mut self) {
        // Non-blocking: a contended lock means a cycle is already running.
        let lock = self.processing_lock.clone();
        let Ok(_guard) = lock.try_lock() else {
            debug!("processing lock contended, skipping tick");
            return;
        };

        let status = match self.store.agent_status().await {
            Ok(status) => status,
            Err(err) => {
                warn!(error = %err, "failed to read agent status");
                return;
            }
        };

        match status {
            AgentStatus::Off => {
                info!("agent status is off, halting loop");
                self.halted = true;
            }
            AgentStatus::Sleeping => {
                let deliveries = match self.broker.drain(&self.queue) {
                    Ok(deliveries) => deliveries,
                    Err(err) => {
                        warn!(error = %err, "drain failed while sleeping");
                        return;
                    }
                };
                if deliveries.is_empty() {
                    return;
                }

                info!(count = deliveries.len(), "waking due to notification");
                if let Some(sleep_id) = self.sleep_registry.cancel(&self.config.agent_name) {
                    info!(%sleep_id, "cancelled sleep timer");
                }
                if let Err(err) = self.store.set_agent_status(AgentStatus::Active).await {
                    warn!(error = %err, "failed to set active status on wake");
                }
                self.process_batch(deliveries).await;
            }
            AgentStatus::Active => {
                let state = match self.store.processing_state().await {
                    Ok(state) => state,
                    Err(err) => {
                        warn!(error = %err, "failed to read processing state");
                        return;
                    }
                };
                let state = if state != ProcessingState::Idle {
                    self.recover_stale_state(state).await
                } else {
                    state
                };
                if state != ProcessingState::Idle {
                    return;
                }

                let deliveries = match self.broker.drain(&self.queue) {
                    Ok(deliveries) => deliveries,
                    Err(err) => {
                        warn!(error = %err, "drain failed");
                        return;
                    }
                };
                if deliveries.is_empty() {
                    return;
                }
                self.process_batch(deliveries).await;
            }
        }
    }

    /// If the non-idle state has not been touched for longer than the stale
    /// threshold, force it back to idle so the agent can make progress.
    async fn recover_stale_state(&self, current: ProcessingState) -> ProcessingState {
        let state = match self.store.agent_state().await {
            Ok(state) => state,
            Err(err) => {
                warn!(error = %err, "could not read agent state for stale check");
                return current;
            }
        };
        let age_seconds = (Utc::now() - state.last_updated).num_seconds();
        if age_seconds > STALE_STATE_TIMEOUT_SECONDS {
            warn!(
                ?current,
                age_seconds, "stale processing state detected, force-resetting to idle"
            );
            if let Err(err) = self.store.set_processing_state(ProcessingState::Idle).await {
                warn!(error = %err, "stale reset failed");
                return current;
            }
            ProcessingState::Idle
        } else {
            debug!(?current, age_seconds, "non-idle state is not stale");
            current
        }
    }

    async fn process_batch(&mut self, deliveries: Vec<Delivery>) {
        let notifications: Vec<Notification> =
            deliveries.iter().map(|d| d.notification.clone()).collect();
        info!(count = notifications.len(), "processing notification batch");

        match self.cycle(&notifications).await {
            Ok(output) => {
                self.dispose(&deliveries, None);
                if let (Some(creator), Some(messages)) = (&self.creator, output.creator_messages) {
                    creator.run(&messages).await;
                }
            }
            Err(err) => {
                error!(error = %err, transient = err.is_transient(), "cycle failed");
                self.dispose(&deliveries, Some(&err));
                if let Err(reset_err) =
                    self.store.set_processing_state(ProcessingState::Idle).await
                {
                    warn!(error = %reset_err, "failed to restore idle after cycle error");
                }
            }
        }
    }

    /// One perceive→think→act pass over a drained batch.
    async fn cycle(&mut self, notifications: &[Notification]) -> Result<CycleOutput, CycleError> {
        self.store
            .set_processing_state(ProcessingState::Thinking)
            .await?;

        let history = self
            .store
            .message_history(self.config.message_history_retrieval_limit, 0)
            .await?;
        let agent_state = self.store.agent_state().await?;
        let turn_number = agent_state.total_messages;

        self.session.update_from(notifications);

        let prompt = self.live_system_prompt().await;

        // First-ever turn: the system message leads the transcript.
        if history.is_empty() {
            self.store
                .append_message(MessageRole::System, json!({ "text": prompt }), vec![])
                .await?;
        }

        let notifications_json = ContextBuilder::format_notifications(notifications);
        self.store
            .append_message(
                MessageRole::User,
                json!({ "notifications": notifications_json }),
                vec![],
            )
            .await?;

        // Subconscious read path, before context assembly.
        let mut retrieved = Vec::new();
        if let Some(retriever) = &self.retriever {
            if retriever.should_run(turn_number) {
                debug!(turn_number, "running memory retriever");
                let mut module_messages = user_assistant_only(&history);
                module_messages.push(StoredMessage {
                    role: MessageRole::User,
                    content: json!({ "notifications": notifications_json }),
                    documents: vec![],
                    timestamp: Utc::now(),
                });
                retrieved = retriever.run(&module_messages).await;
                if !retrieved.is_empty() {
                    info!(count = retrieved.len(), "retriever surfaced memories");
                }
            }
        }

        self.extract_images_from_tool_results(notifications);
        self.forward_browser_screenshots(notifications).await;

        let (mut conversation, prompt_changed) =
            self.context
                .build_conversation(&prompt, &history, notifications, &[]);
        if prompt_changed {
            // Mirror the freshly resolved prompt into the transcript's system
            // row so the stored conversation matches what the model saw.
            if let Err(err) = self.store.update_system_prompt(&prompt).await {
                warn!(error = %err, "failed to mirror system prompt to transcript");
            }
        }

        if !retrieved.is_empty() {
            let formatted: Vec<Value> = retrieved
                .iter()
                .map(|memory| {
                    json!({
                        "content": memory.content,
                        "datetime": memory.created_at,
                        "importance": memory.importance,
                    })
                })
                .collect();
            let memory_message = ContextBuilder::build_memories_message(&formatted);
            if let Err(err) = self
                .store
                .append_message(MessageRole::User, memory_message.content.clone(), vec![])
                .await
            {
                warn!(error = %err, "failed to store proactive memories message");
            }
            conversation.push(memory_message);
        }

        inject_pending_images(&mut conversation, &self.pending_images);

        let llm_messages = to_llm_messages(&conversation);
        let response = match self
            .llm
            .generate_json(&llm_messages, self.session.fast_mode)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                self.pending_images.clear();
                let _ = self.store.set_processing_state(ProcessingState::Idle).await;
                return Err(err.into());
            }
        };
        self.pending_images.clear();

        let parsed = match ContextBuilder::parse_llm_response(&response) {
            Ok(parsed) => parsed,
            Err(err) => {
                error!(error = %err, "invalid llm response");
                let mut marker_content = serde_json::Map::new();
                marker_content.insert("raw_response".to_string(), Value::String(response.clone()));
                marker_content.insert(
                    err.transcript_marker().to_string(),
                    Value::String(err.to_string()),
                );
                marker_content.insert("tool_calls".to_string(), Value::Array(vec![]));
                if let Err(store_err) = self
                    .store
                    .append_message(MessageRole::Assistant, Value::Object(marker_content), vec![])
                    .await
                {
                    warn!(error = %store_err, "failed to store failed assistant turn");
                }
                let error_type = match &err {
                    ParseError::EmptyToolCalls => "empty_tool_calls",
                    _ => "llm_parse_error",
                };
                self.emit_error_notification(error_type, &err.to_string());
                let _ = self.store.set_processing_state(ProcessingState::Idle).await;
                return Err(err.into());
            }
        };

        if let Err(err) = self
            .store
            .append_message(
                MessageRole::Assistant,
                ContextBuilder::build_assistant_message(
                    &parsed.thought,
                    &parsed.tool_calls,
                    parsed.action_status.as_deref(),
                ),
                vec![],
            )
            .await
        {
            error!(error = %err, "failed to append assistant message");
        }

        // The primary agent surfaces its one-line action status to the user.
        if let Some(action_status) = &parsed.action_status {
            if self.config.agent_name == "primary_agent" {
                if let Some(session_id) = self.session.last_session_id.clone() {
                    if let Err(err) =
                        self.egress.post_action_status(&session_id, action_status).await
                    {
                        warn!(error = %err, "action status push failed");
                    }
                }
            }
        }

        info!(count = parsed.tool_calls.len(), "executing tools");
        if let Err(err) = self
            .store
            .set_processing_state(ProcessingState::ExecutingTools)
            .await
        {
            warn!(error = %err, "failed to set executing_tools state");
        }

        for call in parsed.tool_calls {
            self.dispatch_tool(call).await;
        }

        self.store
            .set_processing_state(ProcessingState::Idle)
            .await?;
        debug!("cycle complete, back to idle");

        let creator_messages = match &self.creator {
            Some(creator) if creator.should_run(turn_number) => {
                Some(user_assistant_only(&history))
            }
            _ => None,
        };
        Ok(CycleOutput { creator_messages })
    }

    /// Resolve the live system prompt: database first, file fallback, static
    /// description as a last resort. The `{tools}` section reflects current
    /// availability and fast mode.
    async fn live_system_prompt(&self) -> String {
        let context = self.session.tool_context();
        let tools_section = self
            .tools
            .render_tools_section(&context, self.session.fast_mode);

        match self.store.full_prompt_content().await {
            Ok(Some(full)) if !full.full_content.trim().is_empty() => match full.tools_position {
                ToolsPosition::Start => {
                    format!("## Available Tools\n\n{tools_section}\n\n{}", full.full_content)
                }
                ToolsPosition::End => {
                    format!("{}\n\n## Available Tools\n\n{tools_section}", full.full_content)
                }
                ToolsPosition::None => full.full_content,
            },
            Ok(_) => self.prompt_from_file(&tools_section),
            Err(err) => {
                debug!(error = %err, "database prompt fetch failed, using file fallback");
                self.prompt_from_file(&tools_section)
            }
        }
    }

    fn prompt_from_file(&self, tools_section: &str) -> String {
        match std::fs::read_to_string(&self.config.system_prompt_path) {
            Ok(template) => template.replace("{tools}", tools_section),
            Err(err) => {
                warn!(
                    error = %err,
                    path = %self.config.system_prompt_path.display(),
                    "system prompt file unavailable, using static description"
                );
                self.description.clone()
            }
        }
    }

    /// Queue base64 payloads from `view_image` tool results for the next
    /// LLM call.
    fn extract_images_from_tool_results(&mut self, notifications: &[Notification]) {
        for notification in notifications {
            if notification.notification_type != NotificationType::ToolResult {
                continue;
            }
            let result = &notification.payload["result"];
            if result["_view_image"] != Value::Bool(true) {
                continue;
            }
            let image = &result["_image_data"];
            if let Some(base64_data) = image["base64_data"].as_str() {
                info!(
                    attachment_id = image["attachment_id"].as_str(),
                    "queued image for visual context"
                );
                self.pending_images.push(ImageAttachment {
                    attachment_id: image["attachment_id"].as_str().map(String::from),
                    content_type: image["content_type"]
                        .as_str()
                        .unwrap_or("image/png")
                        .to_string(),
                    base64_data: base64_data.to_string(),
                });
            }
        }
    }

    /// Forward captured browser screenshots to the frontend. Best-effort;
    /// never blocks the cycle on failure.
    async fn forward_browser_screenshots(&self, notifications: &[Notification]) {
        for notification in notifications {
            if notification.notification_type != NotificationType::ToolResult {
                continue;
            }
            let result = &notification.payload["result"];
            let Some(screenshot) = result["screenshot"].as_str() else {
                continue;
            };
            let current_url = result["current_url"].as_str().or(result["url"].as_str());
            let task = result["task"].as_str();
            if let Err(err) = self
                .egress
                .post_browser_screenshot(
                    self.session.last_session_id.as_deref(),
                    screenshot,
                    current_url,
                    task,
                )
                .await
            {
                warn!(error = %err, "browser screenshot forward failed");
            }
        }
    }

    /// Resolve and run one tool call. Per-tool failures become structured
    /// failure tool-results; they never abort the cycle.
    async fn dispatch_tool(&self, call: ToolCallRequest) {
        let channel = ToolChannel::new(&self.config.agent_name, self.broker.clone());
        let context = self.session.tool_context();

        let Some(tool) = self.tools.get(&call.tool_name) else {
            warn!(tool = %call.tool_name, "unknown tool requested");
            channel.publish_failure(
                &call.tool_name,
                &format!(
                    "Tool '{}' not found. Available tools: {:?}",
                    call.tool_name,
                    self.tools.names()
                ),
            );
            return;
        };

        if !tool.is_available(&context) {
            warn!(
                tool = %call.tool_name,
                is_on_call = context.is_on_call(),
                "tool not available in current context"
            );
            let guidance = if context.is_on_call() {
                "Use speak/hang_up tools during calls."
            } else {
                "Use send_user_message when not on a call."
            };
            channel.publish_failure(
                &call.tool_name,
                &format!(
                    "Tool '{}' is not available in the current context. {guidance}",
                    call.tool_name
                ),
            );
            return;
        }

        // Fast mode: skip silently rather than failing, so a chatty model
        // cannot feed itself an endless stream of failure notifications.
        if self.session.fast_mode && !FAST_MODE_TOOLS.contains(&call.tool_name.as_str()) {
            warn!(tool = %call.tool_name, "tool silently skipped in fast mode");
            return;
        }

        if let Err(validation_error) = tool.validate(&call.arguments) {
            channel.publish_failure(
                &call.tool_name,
                &format!("Invalid tool arguments: {validation_error}"),
            );
            return;
        }

        let mut arguments = call.arguments;
        if let Some(session_id) = &self.session.last_session_id {
            arguments.insert("session_id".to_string(), Value::String(session_id.clone()));
        }
        if let Some(call_id) = &self.session.last_call_id {
            arguments.insert("call_id".to_string(), Value::String(call_id.clone()));
        }
        if self.session.fast_mode {
            arguments.insert("fast_mode".to_string(), Value::Bool(true));
        }

        debug!(tool = %call.tool_name, "executing tool");
        if let Err(err) = tool.execute(arguments).await {
            error!(tool = %call.tool_name, error = %err, "tool execution failed");
            channel.publish_failure(&call.tool_name, &format!("Tool execution error: {err}"));
        }
    }

    /// Terminal disposition for a processed batch, per the retry policy:
    /// success → ack; transient with retries left → requeue; anything else →
    /// ack (drop) plus an audit error notification.
    fn dispose(&self, deliveries: &[Delivery], outcome: Option<&CycleError>) {
        for delivery in deliveries {
            let id = &delivery.notification.notification_id;
            match outcome {
                None => {
                    if let Err(err) = self.broker.ack(delivery.tag) {
                        error!(error = %err, id, "ack failed");
                    } else {
                        debug!(id, "acknowledged");
                    }
                }
                Some(err) if err.is_transient() && delivery.retry_count < MAX_RETRIES => {
                    if let Err(nack_err) = self.broker.nack(delivery.tag, true) {
                        error!(error = %nack_err, id, "requeue failed");
                    } else {
                        warn!(
                            id,
                            retry = delivery.retry_count + 1,
                            max = MAX_RETRIES,
                            "requeued after transient error"
                        );
                    }
                }
                Some(err) => {
                    if let Err(ack_err) = self.broker.ack(delivery.tag) {
                        error!(error = %ack_err, id, "drop-ack failed");
                    }
                    if delivery.retry_count >= MAX_RETRIES {
                        error!(id, "dead letter: retry ceiling exceeded");
                    } else {
                        error!(id, error = %err, "dead letter: permanent error");
                    }
                    self.emit_error_notification(
                        "notification_processing_failed",
                        &format!("Failed to process notification {id}: {err}"),
                    );
                }
            }
        }
    }

    /// Enqueue an `error_message` audit notification, circuit-breaker
    /// limited to break error feedback loops.
    fn emit_error_notification(&self, error_type: &str, message: &str) {
        if !self.error_limiter.allow() {
            return;
        }
        let notification = Notification::error(&self.config.agent_name, error_type, message);
        if let Err(err) = self.broker.publish(&self.queue, &notification) {
            // Deliberately no recursion into error handling here.
            error!(error = %err, "failed to publish error notification");
        }
    }
}

fn user_assistant_only(history: &[StoredMessage]) -> Vec<StoredMessage> {
    history
        .iter()
        .filter(|m| matches!(m.role, MessageRole::User | MessageRole::Assistant))
        .cloned()
        .collect()
}
