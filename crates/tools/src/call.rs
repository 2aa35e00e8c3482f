use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::info;

use crate::{require_string, Tool, ToolChannel, ToolContext, ToolInfo, ToolParam};

/// Speaks a line to the caller. The voice gateway consumes the published
/// result and performs the actual TTS egress; only the notification contract
/// lives here. Available only during a call, and one of the two tools that
/// survive fast mode.
pub struct SpeakTool {
    channel: ToolChannel,
}

impl SpeakTool {
    pub fn new(channel: ToolChannel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl Tool for SpeakTool {
    fn name(&self) -> &str {
        "speak"
    }

    fn info(&self) -> ToolInfo {
        ToolInfo {
            command: "speak".into(),
            description: "Say something to the caller on the active call.".into(),
            parameters: vec![ToolParam::required("text", "str", "What to say")],
        }
    }

    fn validate(&self, args: &Map<String, Value>) -> Result<(), String> {
        require_string(args, "text").map(|_| ())
    }

    fn is_available(&self, context: &ToolContext) -> bool {
        context.is_on_call()
    }

    async fn execute(&self, args: Map<String, Value>) -> Result<()> {
        let text = match require_string(&args, "text") {
            Ok(text) => text.to_string(),
            Err(error) => {
                self.channel.publish_failure("speak", &error);
                return Ok(());
            }
        };
        let call_id = args.get("call_id").and_then(|v| v.as_str());
        info!(call_id, chars = text.len(), "speak requested");
        self.channel.publish_success(
            "speak",
            serde_json::json!({ "spoken": true, "text": text, "call_id": call_id }),
        );
        Ok(())
    }
}

/// Ends the active call. Call-gated like `speak`.
pub struct HangUpTool {
    channel: ToolChannel,
}

impl HangUpTool {
    pub fn new(channel: ToolChannel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl Tool for HangUpTool {
    fn name(&self) -> &str {
        "hang_up"
    }

    fn info(&self) -> ToolInfo {
        ToolInfo {
            command: "hang_up".into(),
            description: "End the active call.".into(),
            parameters: vec![],
        }
    }

    fn is_available(&self, context: &ToolContext) -> bool {
        context.is_on_call()
    }

    async fn execute(&self, args: Map<String, Value>) -> Result<()> {
        let call_id = args.get("call_id").and_then(|v| v.as_str());
        info!(call_id, "hang up requested");
        self.channel
            .publish_success("hang_up", serde_json::json!({ "ended": true, "call_id": call_id }));
        Ok(())
    }
}
