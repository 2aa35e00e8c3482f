use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use murmur_fabric::Notification;
use murmur_store::{AgentStatus, StateStore};

use crate::{require_positive_number, Tool, ToolChannel, ToolInfo, ToolParam};

struct SleepHandle {
    sleep_id: String,
    cancel: watch::Sender<bool>,
    started: Instant,
}

/// Process-local registry of outstanding sleep timers, one per agent at
/// most. Arming a new sleep cancels the prior one; cancellation is
/// cooperative: the timer task observes the signal and exits without
/// emitting its wake notification.
#[derive(Default)]
pub struct SleepRegistry {
    inner: Mutex<HashMap<String, SleepHandle>>,
}

impl SleepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn arm(&self, agent_name: &str, sleep_id: &str, cancel: watch::Sender<bool>) {
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.remove(agent_name) {
            let _ = previous.cancel.send(true);
            debug!(agent = agent_name, previous = %previous.sleep_id, "prior sleep cancelled by new arm");
        }
        inner.insert(
            agent_name.to_string(),
            SleepHandle {
                sleep_id: sleep_id.to_string(),
                cancel,
                started: Instant::now(),
            },
        );
    }

    /// Cancel the agent's outstanding sleep, if any. Returns the cancelled
    /// sleep id.
    pub fn cancel(&self, agent_name: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        let handle = inner.remove(agent_name)?;
        let _ = handle.cancel.send(true);
        debug!(
            agent = agent_name,
            sleep_id = %handle.sleep_id,
            elapsed_secs = handle.started.elapsed().as_secs_f64(),
            "sleep cancelled"
        );
        Some(handle.sleep_id)
    }

    pub fn is_sleeping(&self, agent_name: &str) -> bool {
        self.inner.lock().contains_key(agent_name)
    }

    /// Remove a completed timer, but only if it is still the one that
    /// finished (a newer sleep may have replaced it).
    fn complete(&self, agent_name: &str, sleep_id: &str) {
        let mut inner = self.inner.lock();
        if inner.get(agent_name).is_some_and(|h| h.sleep_id == sleep_id) {
            inner.remove(agent_name);
        }
    }
}

/// Puts the agent to sleep for a duration.
///
/// Deliberately publishes no result notification: a success result on the
/// agent's own queue would wake it immediately. The agent wakes either on
/// timer expiry (one `system_alert` WAKE notification) or on any other
/// inbound notification, which cancels the timer.
pub struct SleepTool {
    channel: ToolChannel,
    store: Arc<dyn StateStore>,
    registry: Arc<SleepRegistry>,
}

impl SleepTool {
    pub fn new(
        channel: ToolChannel,
        store: Arc<dyn StateStore>,
        registry: Arc<SleepRegistry>,
    ) -> Self {
        Self {
            channel,
            store,
            registry,
        }
    }
}

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        "sleep"
    }

    fn info(&self) -> ToolInfo {
        ToolInfo {
            command: "sleep".into(),
            description: "Sleep for a number of seconds. You will wake early if any \
                          notification arrives. Use this when there is nothing to do right now."
                .into(),
            parameters: vec![ToolParam::required(
                "duration",
                "float",
                "How long to sleep, in seconds",
            )],
        }
    }

    fn validate(&self, args: &Map<String, Value>) -> Result<(), String> {
        require_positive_number(args, "duration").map(|_| ())
    }

    async fn execute(&self, args: Map<String, Value>) -> Result<()> {
        let duration_seconds = require_positive_number(&args, "duration")
            .map_err(|e| anyhow::anyhow!(e))?;
        let agent_name = self.channel.agent_name().to_string();
        let sleep_id = format!("sleep_{}", &Uuid::new_v4().simple().to_string()[..8]);

        if let Err(err) = self.store.set_agent_status(AgentStatus::Sleeping).await {
            // Sleep still works without the status write; the loop will just
            // treat inbound notifications as a normal active cycle.
            warn!(error = %err, "failed to set sleeping status");
        }

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        self.registry.arm(&agent_name, &sleep_id, cancel_tx);

        let channel = self.channel.clone();
        let registry = self.registry.clone();
        let id = sleep_id.clone();
        tokio::spawn(async move {
            debug!(sleep_id = %id, duration_seconds, "sleep timer started");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs_f64(duration_seconds)) => {
                    debug!(sleep_id = %id, "sleep completed, emitting wake");
                    channel.publish_notification(&Notification::wake(
                        channel.agent_name(),
                        &id,
                        duration_seconds,
                    ));
                }
                _ = cancel_rx.changed() => {
                    debug!(sleep_id = %id, "sleep cancelled, no wake emitted");
                }
            }
            registry.complete(channel.agent_name(), &id);
        });

        info!(agent = %agent_name, sleep_id = %sleep_id, duration_seconds, "agent entering sleep");
        // No result notification: see the type-level comment.
        Ok(())
    }
}

/// Turns the agent off. Terminal until externally revived.
pub struct ShutdownTool {
    channel: ToolChannel,
    store: Arc<dyn StateStore>,
}

impl ShutdownTool {
    pub fn new(channel: ToolChannel, store: Arc<dyn StateStore>) -> Self {
        Self { channel, store }
    }
}

#[async_trait]
impl Tool for ShutdownTool {
    fn name(&self) -> &str {
        "shutdown"
    }

    fn info(&self) -> ToolInfo {
        ToolInfo {
            command: "shutdown".into(),
            description: "Shut yourself down. You will not process anything further until \
                          an operator turns you back on."
                .into(),
            parameters: vec![],
        }
    }

    async fn execute(&self, _args: Map<String, Value>) -> Result<()> {
        match self.store.set_agent_status(AgentStatus::Off).await {
            Ok(()) => {
                info!(agent = self.channel.agent_name(), "agent shutting down");
                self.channel
                    .publish_success("shutdown", serde_json::json!({ "status": "off" }));
            }
            Err(err) => {
                self.channel
                    .publish_failure("shutdown", &format!("failed to set status: {err}"));
            }
        }
        Ok(())
    }
}
