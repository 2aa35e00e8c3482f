use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::warn;

use murmur_store::GatewayEgress;

use crate::{require_string, Tool, ToolChannel, ToolContext, ToolInfo, ToolParam};

/// Sends a text reply to the user through the gateway's notification path.
///
/// Unavailable during calls; voice turns go through `speak` instead.
pub struct SendUserMessageTool {
    channel: ToolChannel,
    egress: Arc<dyn GatewayEgress>,
}

impl SendUserMessageTool {
    pub fn new(channel: ToolChannel, egress: Arc<dyn GatewayEgress>) -> Self {
        Self { channel, egress }
    }
}

#[async_trait]
impl Tool for SendUserMessageTool {
    fn name(&self) -> &str {
        "send_user_message"
    }

    fn info(&self) -> ToolInfo {
        ToolInfo {
            command: "send_user_message".into(),
            description: "Send a text message to the user. This is your primary way of \
                          replying outside of calls."
                .into(),
            parameters: vec![ToolParam::required(
                "message",
                "str",
                "The message text to deliver",
            )],
        }
    }

    fn validate(&self, args: &Map<String, Value>) -> Result<(), String> {
        require_string(args, "message").map(|_| ())
    }

    fn is_available(&self, context: &ToolContext) -> bool {
        !context.is_on_call()
    }

    async fn execute(&self, args: Map<String, Value>) -> Result<()> {
        let message = match require_string(&args, "message") {
            Ok(message) => message.to_string(),
            Err(error) => {
                self.channel.publish_failure("send_user_message", &error);
                return Ok(());
            }
        };
        let session_id = args.get("session_id").and_then(|v| v.as_str());

        match self.egress.post_user_message(session_id, &message).await {
            Ok(()) => {
                self.channel.publish_success(
                    "send_user_message",
                    serde_json::json!({ "delivered": true, "message": message }),
                );
            }
            Err(err) => {
                warn!(error = %err, "user message delivery failed");
                self.channel
                    .publish_failure("send_user_message", &format!("delivery failed: {err}"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_fabric::{queue_name, Broker};
    use murmur_store::MemoryStateStore;
    use std::time::Duration;

    async fn fixture() -> (Arc<Broker>, Arc<MemoryStateStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(
            Broker::connect_with(dir.path().join("q.redb"), 1, Duration::from_millis(1))
                .await
                .unwrap(),
        );
        (broker, Arc::new(MemoryStateStore::new()), dir)
    }

    #[tokio::test]
    async fn delivers_and_publishes_success() {
        let (broker, store, _dir) = fixture().await;
        let tool =
            SendUserMessageTool::new(ToolChannel::new("a_agent", broker.clone()), store.clone());

        let mut args = Map::new();
        args.insert("message".into(), Value::String("hello there".into()));
        args.insert("session_id".into(), Value::String("s1".into()));
        tool.execute(args).await.unwrap();

        assert_eq!(store.user_messages(), vec!["hello there".to_string()]);
        let drained = broker.drain(&queue_name("a_agent")).unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].notification.payload["status"], "SUCCESS");
    }

    #[tokio::test]
    async fn unavailable_while_on_call() {
        let (broker, store, _dir) = fixture().await;
        let tool = SendUserMessageTool::new(ToolChannel::new("a_agent", broker), store);

        let on_call = ToolContext {
            session_id: Some("s1".into()),
            call_id: Some("c1".into()),
        };
        assert!(!tool.is_available(&on_call));
        assert!(tool.is_available(&ToolContext::default()));
    }
}
