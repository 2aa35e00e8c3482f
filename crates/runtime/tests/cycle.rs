//! End-to-end cycle tests: a real broker and memory store on temp files, the
//! in-process state store, and a scripted language model.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use murmur_config::{AgentConfig, MemoryModuleConfig};
use murmur_fabric::{Broker, Notification, NotificationType};
use murmur_llm::{LanguageModel, LlmError, LlmMessage, Part};
use murmur_memory::{
    HashEmbedder, MemoryRecord, MemoryRetriever, MemoryScope, MemorySource, MemoryStore,
    MemoryType, EMBEDDING_DIM,
};
use murmur_runtime::Agent;
use murmur_store::{
    GatewayEgress, MemoryStateStore, MessageRole, ProcessingState, StateStore,
};
use murmur_tools::{
    HangUpTool, SendUserMessageTool, ShutdownTool, SleepRegistry, SleepTool, SpeakTool,
    ToolChannel, ToolRegistry,
};

struct ScriptedModel {
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    calls: Mutex<Vec<Vec<LlmMessage>>>,
}

impl ScriptedModel {
    fn new(responses: Vec<Result<String, LlmError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn system_text_of_call(&self, index: usize) -> String {
        let calls = self.calls.lock();
        match &calls[index][0].parts[0] {
            Part::Text(text) => text.clone(),
            _ => panic!("first part of first message should be text"),
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate_json(
        &self,
        messages: &[LlmMessage],
        _fast_mode: bool,
    ) -> Result<String, LlmError> {
        self.calls.lock().push(messages.to_vec());
        self.responses
            .lock()
            .pop_front()
            .unwrap_or(Err(LlmError::EmptyResponse))
    }
}

fn reply(tool_name: &str, arguments: serde_json::Value) -> Result<String, LlmError> {
    Ok(json!({
        "thought": format!("calling {tool_name}"),
        "tool_calls": [{ "tool_name": tool_name, "arguments": arguments }]
    })
    .to_string())
}

struct Fixture {
    agent: Agent,
    broker: Arc<Broker>,
    store: Arc<MemoryStateStore>,
    model: Arc<ScriptedModel>,
    queue: String,
    _dir: tempfile::TempDir,
}

async fn fixture(agent_name: &str, responses: Vec<Result<String, LlmError>>) -> Fixture {
    fixture_with(agent_name, responses, None).await
}

async fn fixture_with(
    agent_name: &str,
    responses: Vec<Result<String, LlmError>>,
    retriever: Option<MemoryRetriever>,
) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("system_prompt.txt"),
        "You are a test agent.\n\n{tools}\n",
    )
    .unwrap();

    let broker = Arc::new(
        Broker::connect_with(dir.path().join("queues.redb"), 1, Duration::from_millis(1))
            .await
            .unwrap(),
    );
    let store = Arc::new(MemoryStateStore::new());
    let model = ScriptedModel::new(responses);
    let sleep_registry = Arc::new(SleepRegistry::new());

    let state_store: Arc<dyn StateStore> = store.clone();
    let egress: Arc<dyn GatewayEgress> = store.clone();

    let channel = ToolChannel::new(agent_name, broker.clone());
    let mut tools = ToolRegistry::default();
    tools.register(Arc::new(SendUserMessageTool::new(
        channel.clone(),
        egress.clone(),
    )));
    tools.register(Arc::new(SleepTool::new(
        channel.clone(),
        state_store.clone(),
        sleep_registry.clone(),
    )));
    tools.register(Arc::new(ShutdownTool::new(
        channel.clone(),
        state_store.clone(),
    )));
    tools.register(Arc::new(SpeakTool::new(channel.clone())));
    tools.register(Arc::new(HangUpTool::new(channel.clone())));

    let config = AgentConfig {
        agent_name: agent_name.to_string(),
        agent_display_name: "Test Agent".to_string(),
        data_dir: dir.path().to_path_buf(),
        api_gateway_url: "http://localhost:0".to_string(),
        gemini_api_key: "test-key".to_string(),
        system_prompt_path: dir.path().join("system_prompt.txt"),
        internal_key_path: dir.path().join("internal_api_key"),
        check_interval_seconds: 0.01,
        max_conversation_messages: 0,
        message_history_retrieval_limit: 500,
        log_level: "INFO".to_string(),
        log_format: "text".to_string(),
        memory: MemoryModuleConfig::default(),
    };

    let queue = config.queue_name();
    let agent = Agent::new(
        config,
        "A test agent.",
        broker.clone(),
        state_store,
        egress,
        model.clone(),
        tools,
        sleep_registry,
        None,
        retriever,
    );

    Fixture {
        agent,
        broker,
        store,
        model,
        queue,
        _dir: dir,
    }
}

fn publish_user_message(fixture: &Fixture, agent_name: &str, content: &str) {
    let notification = Notification::new(
        NotificationType::UserMessage,
        agent_name,
        "api_gateway",
        json!({ "content": content, "session_id": "s1" }),
    );
    fixture.broker.publish(&fixture.queue, &notification).unwrap();
}

#[tokio::test]
async fn cold_start_single_user_message() {
    let mut fixture = fixture(
        "weather_agent",
        vec![reply("send_user_message", json!({ "message": "hello!" }))],
    )
    .await;
    publish_user_message(&fixture, "weather_agent", "hi");

    fixture.agent.tick().await;

    // Transcript: system, user, assistant.
    let messages = fixture.store.messages();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].role, MessageRole::System);
    assert_eq!(messages[1].role, MessageRole::User);
    assert_eq!(messages[2].role, MessageRole::Assistant);

    // The user row wraps the serialized notification batch.
    let batch_text = messages[1].content["notifications"].as_str().unwrap();
    assert!(batch_text.contains("\"hi\""));

    // The assistant row carries thought + at least one tool call.
    assert!(messages[2].content["thought"].as_str().is_some());
    assert!(!messages[2].content["tool_calls"].as_array().unwrap().is_empty());

    // The inbound message was acked; the only queued item is the tool result.
    let drained = fixture.broker.drain(&fixture.queue).unwrap();
    assert_eq!(drained.len(), 1);
    assert_eq!(
        drained[0].notification.notification_type,
        NotificationType::ToolResult
    );
    for delivery in &drained {
        fixture.broker.nack(delivery.tag, true).unwrap();
    }

    // The tool delivered the message through the egress.
    assert_eq!(fixture.store.user_messages(), vec!["hello!".to_string()]);
    assert_eq!(
        fixture.store.processing_state().await.unwrap(),
        ProcessingState::Idle
    );
}

#[tokio::test]
async fn tool_result_round_trip_grows_transcript_by_two() {
    let mut fixture = fixture(
        "weather_agent",
        vec![
            reply("send_user_message", json!({ "message": "checking..." })),
            reply("send_user_message", json!({ "message": "the answer is 42" })),
        ],
    )
    .await;
    publish_user_message(&fixture, "weather_agent", "hi");
    fixture.agent.tick().await;
    let count_after_first = fixture.store.messages().len();

    // The tool's own result notification rides the queue into the next tick.
    fixture.agent.tick().await;
    let messages = fixture.store.messages();
    assert_eq!(messages.len(), count_after_first + 2);
    assert_eq!(messages[messages.len() - 2].role, MessageRole::User);
    assert_eq!(messages[messages.len() - 1].role, MessageRole::Assistant);
    assert!(messages[messages.len() - 2].content["notifications"]
        .as_str()
        .unwrap()
        .contains("tool_result"));
}

#[tokio::test]
async fn transient_llm_timeout_requeues_then_drops_at_ceiling() {
    let timeout = || Err(LlmError::Timeout(Duration::from_secs(90)));
    let mut fixture = fixture(
        "weather_agent",
        vec![timeout(), timeout(), timeout(), timeout()],
    )
    .await;
    publish_user_message(&fixture, "weather_agent", "hi");

    // Attempts at retry counts 0, 1, 2 requeue; the fourth drops.
    for _ in 0..3 {
        fixture.agent.tick().await;
        assert_eq!(fixture.broker.pending_count(&fixture.queue).unwrap(), 1);
    }
    fixture.agent.tick().await;

    let drained = fixture.broker.drain(&fixture.queue).unwrap();
    assert_eq!(drained.len(), 1, "only the audit error notification remains");
    assert_eq!(
        drained[0].notification.notification_type,
        NotificationType::ErrorMessage
    );
    assert_eq!(
        fixture.store.processing_state().await.unwrap(),
        ProcessingState::Idle
    );
}

#[tokio::test]
async fn transient_failure_then_recovery_processes_normally() {
    let mut fixture = fixture(
        "weather_agent",
        vec![
            Err(LlmError::Timeout(Duration::from_secs(90))),
            reply("send_user_message", json!({ "message": "recovered" })),
        ],
    )
    .await;
    publish_user_message(&fixture, "weather_agent", "hi");

    fixture.agent.tick().await; // times out, requeued with retry 1
    fixture.agent.tick().await; // healthy again

    assert_eq!(fixture.store.user_messages(), vec!["recovered".to_string()]);
    let last = fixture.store.messages().pop().unwrap();
    assert_eq!(last.role, MessageRole::Assistant);
}

#[tokio::test]
async fn empty_tool_calls_is_a_permanent_validation_error() {
    let mut fixture = fixture(
        "weather_agent",
        vec![Ok(json!({ "thought": "nothing to do", "tool_calls": [] }).to_string())],
    )
    .await;
    publish_user_message(&fixture, "weather_agent", "hi");

    fixture.agent.tick().await;

    // The raw response is preserved with a validation marker.
    let messages = fixture.store.messages();
    let assistant = messages.last().unwrap();
    assert_eq!(assistant.role, MessageRole::Assistant);
    assert!(assistant.content["validation_error"].as_str().is_some());
    assert!(assistant.content["raw_response"].as_str().is_some());

    // Dropped (acked) plus audit error notifications; nothing requeued.
    let drained = fixture.broker.drain(&fixture.queue).unwrap();
    assert!(!drained.is_empty());
    assert!(drained
        .iter()
        .all(|d| d.notification.notification_type == NotificationType::ErrorMessage));
    assert_eq!(
        fixture.store.processing_state().await.unwrap(),
        ProcessingState::Idle
    );
}

#[tokio::test]
async fn sleep_is_silent_and_any_notification_wakes() {
    let mut fixture = fixture(
        "night_agent",
        vec![
            reply("sleep", json!({ "duration": 60 })),
            reply("send_user_message", json!({ "message": "good morning" })),
        ],
    )
    .await;
    publish_user_message(&fixture, "night_agent", "sleep until something happens");

    fixture.agent.tick().await;
    assert_eq!(
        fixture.store.agent_status().await.unwrap(),
        murmur_store::AgentStatus::Sleeping
    );
    // Sleep publishes nothing: the queue is empty.
    assert_eq!(fixture.broker.pending_count(&fixture.queue).unwrap(), 0);

    // A sleeping agent with an empty queue stays asleep.
    fixture.agent.tick().await;
    assert_eq!(
        fixture.store.agent_status().await.unwrap(),
        murmur_store::AgentStatus::Sleeping
    );

    // External producer publishes; the next tick wakes and processes it.
    publish_user_message(&fixture, "night_agent", "are you there?");
    fixture.agent.tick().await;

    assert_eq!(
        fixture.store.agent_status().await.unwrap(),
        murmur_store::AgentStatus::Active
    );
    assert_eq!(fixture.store.user_messages(), vec!["good morning".to_string()]);

    // The cancelled timer never emits its wake notification.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let drained = fixture.broker.drain(&fixture.queue).unwrap();
    assert!(drained
        .iter()
        .all(|d| d.notification.notification_type == NotificationType::ToolResult));
}

#[tokio::test]
async fn stale_thinking_state_is_recovered_before_processing() {
    let mut fixture = fixture(
        "weather_agent",
        vec![reply("send_user_message", json!({ "message": "back" }))],
    )
    .await;
    fixture
        .store
        .set_processing_state(ProcessingState::Thinking)
        .await
        .unwrap();
    fixture
        .store
        .set_last_updated(chrono::Utc::now() - chrono::Duration::seconds(301));
    publish_user_message(&fixture, "weather_agent", "hi");

    fixture.agent.tick().await;

    // Recovery happened and the cycle ran in the same tick.
    assert!(!fixture.store.messages().is_empty());
    assert_eq!(
        fixture.store.processing_state().await.unwrap(),
        ProcessingState::Idle
    );
}

#[tokio::test]
async fn fresh_non_idle_state_blocks_the_tick() {
    let mut fixture = fixture("weather_agent", vec![]).await;
    fixture
        .store
        .set_processing_state(ProcessingState::Thinking)
        .await
        .unwrap();
    publish_user_message(&fixture, "weather_agent", "hi");

    fixture.agent.tick().await;

    assert!(fixture.store.messages().is_empty());
    assert_eq!(fixture.broker.pending_count(&fixture.queue).unwrap(), 1);
}

#[tokio::test]
async fn live_prompt_edit_is_mirrored_and_used() {
    let mut fixture = fixture(
        "weather_agent",
        vec![
            reply("send_user_message", json!({ "message": "one" })),
            reply("send_user_message", json!({ "message": "two" })),
        ],
    )
    .await;
    publish_user_message(&fixture, "weather_agent", "hi");
    fixture.agent.tick().await;

    let first_system = fixture.store.messages()[0].content["text"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(first_system.contains("You are a test agent."));

    // Replace the prompt file (keeping {tools}) while the agent idles.
    std::fs::write(
        fixture._dir.path().join("system_prompt.txt"),
        "You are an upgraded agent.\n\n{tools}\n",
    )
    .unwrap();

    publish_user_message(&fixture, "weather_agent", "again");
    fixture.agent.tick().await;

    // Mirrored into the transcript's system row and used for the call.
    let mirrored = fixture.store.messages()[0].content["text"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(mirrored.contains("upgraded"));
    assert!(fixture.model.system_text_of_call(1).contains("upgraded"));
}

#[tokio::test]
async fn fast_mode_restricts_rendered_and_executable_tools() {
    let mut fixture = fixture(
        "voice_agent",
        vec![Ok(json!({
            "thought": "answer on the call",
            "tool_calls": [
                { "tool_name": "sleep", "arguments": { "duration": 60 } },
                { "tool_name": "speak", "arguments": { "text": "spoken" } },
            ]
        })
        .to_string())],
    )
    .await;

    let notification = Notification::new(
        NotificationType::UserMessage,
        "voice_agent",
        "voice_gateway",
        json!({
            "content": "hello",
            "session_id": "s1",
            "voice_metadata": { "call_id": "c1", "is_call_mode": true, "fast_mode": true }
        }),
    );
    fixture.broker.publish(&fixture.queue, &notification).unwrap();

    fixture.agent.tick().await;

    // The rendered tool list is restricted to the voice pair.
    let system_text = fixture.model.system_text_of_call(0);
    assert!(system_text.contains("### speak"));
    assert!(system_text.contains("### hang_up"));
    assert!(!system_text.contains("### send_user_message"));

    // sleep was skipped silently (no failure result, status untouched); only
    // speak produced a result.
    let drained = fixture.broker.drain(&fixture.queue).unwrap();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].notification.payload["tool_name"], "speak");
    assert_eq!(drained[0].notification.payload["status"], "SUCCESS");
    assert_eq!(
        fixture.store.agent_status().await.unwrap(),
        murmur_store::AgentStatus::Active
    );
}

#[tokio::test]
async fn unknown_tool_synthesizes_a_failure_result() {
    let mut fixture = fixture(
        "weather_agent",
        vec![reply("summon_dragons", json!({}))],
    )
    .await;
    publish_user_message(&fixture, "weather_agent", "hi");

    fixture.agent.tick().await;

    let drained = fixture.broker.drain(&fixture.queue).unwrap();
    assert_eq!(drained.len(), 1);
    let payload = &drained[0].notification.payload;
    assert_eq!(payload["tool_name"], "summon_dragons");
    assert_eq!(payload["status"], "FAILURE");
    assert!(payload["error_message"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn call_gated_tool_rejected_off_call() {
    let mut fixture = fixture(
        "weather_agent",
        vec![reply("speak", json!({ "text": "hello?" }))],
    )
    .await;
    publish_user_message(&fixture, "weather_agent", "hi");

    fixture.agent.tick().await;

    let drained = fixture.broker.drain(&fixture.queue).unwrap();
    assert_eq!(drained.len(), 1);
    let payload = &drained[0].notification.payload;
    assert_eq!(payload["status"], "FAILURE");
    assert!(payload["error_message"]
        .as_str()
        .unwrap()
        .contains("not available"));
}

#[tokio::test]
async fn retriever_memories_are_appended_and_injected() {
    // Seed one memory, then script the retriever to find and hand it over.
    let dir = tempfile::tempdir().unwrap();
    let memory_store = Arc::new(MemoryStore::open(dir.path().join("mem.redb")).unwrap());
    let mut unit = vec![0.0f32; EMBEDDING_DIM];
    unit[0] = 1.0;
    let record = MemoryRecord::new(
        "User's favorite drink is green tea",
        MemoryType::UserFact,
        MemoryScope::Shared,
        "weather_agent",
        MemorySource::ProactiveAgent,
    )
    .with_importance(0.9);
    let memory_id = memory_store.create(record, unit).unwrap();

    let retriever_model = ScriptedModel::new(vec![
        Ok(json!({
            "reflection": "search for drink preferences",
            "decision": "GET_MEMORIES",
            "queries": ["favorite drink"]
        })
        .to_string()),
        Ok(json!({
            "reflection": "found it",
            "decision": "GIVE_MEMORIES",
            "memory_ids": [memory_id.to_string()]
        })
        .to_string()),
    ]);
    let retriever = MemoryRetriever::new(
        "weather_agent",
        retriever_model,
        memory_store,
        Arc::new(HashEmbedder),
        true,
        1,
        10,
        3,
    );

    let mut fixture = fixture_with(
        "weather_agent",
        vec![reply("send_user_message", json!({ "message": "green tea it is" }))],
        Some(retriever),
    )
    .await;
    publish_user_message(&fixture, "weather_agent", "what do I like to drink?");

    fixture.agent.tick().await;

    // Transcript: system, user(notifications), user(proactive_memories), assistant.
    let messages = fixture.store.messages();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[2].role, MessageRole::User);
    assert_eq!(messages[2].content["type"], "proactive_memories");
    assert_eq!(
        messages[2].content["memories"][0]["content"],
        "User's favorite drink is green tea"
    );

    // And the same payload went to the model as the final user message.
    let calls = fixture.model.calls.lock();
    let main_call = calls.last().unwrap();
    let last_user_text = match &main_call.last().unwrap().parts[0] {
        Part::Text(text) => text.clone(),
        _ => panic!("expected text"),
    };
    assert!(last_user_text.contains("proactive_memories"));
}

#[tokio::test]
async fn primary_agent_pushes_action_status() {
    let mut fixture = fixture(
        "primary_agent",
        vec![Ok(json!({
            "thought": "let the user know",
            "action_status": "Looking that up...",
            "tool_calls": [{ "tool_name": "send_user_message", "arguments": { "message": "ok" } }]
        })
        .to_string())],
    )
    .await;
    publish_user_message(&fixture, "primary_agent", "hi");

    fixture.agent.tick().await;

    assert_eq!(
        fixture.store.action_statuses(),
        vec![("s1".to_string(), "Looking that up...".to_string())]
    );
}

#[tokio::test]
async fn non_primary_agent_does_not_push_action_status() {
    let mut fixture = fixture(
        "weather_agent",
        vec![Ok(json!({
            "thought": "t",
            "action_status": "Doing things...",
            "tool_calls": [{ "tool_name": "send_user_message", "arguments": { "message": "ok" } }]
        })
        .to_string())],
    )
    .await;
    publish_user_message(&fixture, "weather_agent", "hi");
    fixture.agent.tick().await;
    assert!(fixture.store.action_statuses().is_empty());

    // But the status still lands in the persisted assistant turn.
    let assistant = fixture.store.messages().pop().unwrap();
    assert_eq!(assistant.content["action_status"], "Doing things...");
}

#[tokio::test]
async fn view_image_results_are_queued_and_attached_once() {
    let mut fixture = fixture(
        "weather_agent",
        vec![
            reply("send_user_message", json!({ "message": "looking at it" })),
            reply("send_user_message", json!({ "message": "done" })),
        ],
    )
    .await;

    let image_result = Notification::new(
        NotificationType::ToolResult,
        "weather_agent",
        "tool_view_image",
        json!({
            "tool_name": "view_image",
            "status": "SUCCESS",
            "result": {
                "_view_image": true,
                "_image_data": {
                    "attachment_id": "att1",
                    "content_type": "image/png",
                    "base64_data": "AQID"
                }
            }
        }),
    );
    fixture.broker.publish(&fixture.queue, &image_result).unwrap();
    fixture.agent.tick().await;

    // The image rode along as a binary part of the first call.
    {
        let calls = fixture.model.calls.lock();
        let blob_count = calls[0]
            .iter()
            .flat_map(|m| &m.parts)
            .filter(|p| matches!(p, Part::Blob { .. }))
            .count();
        assert_eq!(blob_count, 1);
    }

    // Pending images clear after the call: the next cycle has no blobs.
    publish_user_message(&fixture, "weather_agent", "thanks");
    fixture.agent.tick().await;
    let calls = fixture.model.calls.lock();
    let blob_count = calls[1]
        .iter()
        .flat_map(|m| &m.parts)
        .filter(|p| matches!(p, Part::Blob { .. }))
        .count();
    assert_eq!(blob_count, 0);
}

#[tokio::test]
async fn browser_screenshots_are_forwarded() {
    let mut fixture = fixture(
        "weather_agent",
        vec![reply("send_user_message", json!({ "message": "browsed" }))],
    )
    .await;

    let screenshot_result = Notification::new(
        NotificationType::ToolResult,
        "weather_agent",
        "tool_browser",
        json!({
            "tool_name": "browse",
            "status": "SUCCESS",
            "result": {
                "screenshot": "c2NyZWVu",
                "current_url": "https://example.com",
                "task": "read the page"
            }
        }),
    );
    fixture
        .broker
        .publish(&fixture.queue, &screenshot_result)
        .unwrap();
    fixture.agent.tick().await;

    assert_eq!(fixture.store.screenshots(), vec!["c2NyZWVu".to_string()]);
}

#[tokio::test]
async fn shutdown_tool_halts_the_loop() {
    let mut fixture = fixture("weather_agent", vec![reply("shutdown", json!({}))]).await;
    publish_user_message(&fixture, "weather_agent", "turn off");

    fixture.agent.tick().await;
    assert_eq!(
        fixture.store.agent_status().await.unwrap(),
        murmur_store::AgentStatus::Off
    );

    // The next tick observes the off status and halts without draining.
    fixture.agent.tick().await;
    assert_eq!(fixture.broker.pending_count(&fixture.queue).unwrap(), 1);
}
