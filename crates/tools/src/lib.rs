use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, error};

use murmur_fabric::{queue_name, Broker, Notification};

// ── Tool trait and registry ──────────────────────────────────────────────────

/// Tools allowed to render and execute while a low-latency voice call is
/// active.
pub const FAST_MODE_TOOLS: &[&str] = &["speak", "hang_up"];

/// Context used to gate tool availability. Built from the most recent
/// call-bearing notification batch, or carried over from the previous cycle.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub session_id: Option<String>,
    pub call_id: Option<String>,
}

impl ToolContext {
    pub fn is_on_call(&self) -> bool {
        self.call_id.is_some()
    }
}

/// Describes a single parameter that a tool accepts.
#[derive(Debug, Clone)]
pub struct ToolParam {
    pub name: String,
    pub param_type: String,
    pub description: String,
    pub required: bool,
}

impl ToolParam {
    pub fn required(name: &str, param_type: &str, description: &str) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            description: description.into(),
            required: true,
        }
    }

    pub fn optional(name: &str, param_type: &str, description: &str) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            description: description.into(),
            required: false,
        }
    }
}

/// Static metadata rendered into the system prompt.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub command: String,
    pub description: String,
    pub parameters: Vec<ToolParam>,
}

/// Trait implemented by every tool.
///
/// Tools never return values to the loop: `execute` performs its side
/// effects and publishes exactly one result notification onto the agent's
/// queue through its [`ToolChannel`]. The single exception is `sleep`, which
/// publishes nothing (a success result would immediately wake the agent).
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn info(&self) -> ToolInfo;

    fn validate(&self, _args: &Map<String, Value>) -> Result<(), String> {
        Ok(())
    }

    fn is_available(&self, _context: &ToolContext) -> bool {
        true
    }

    async fn execute(&self, args: Map<String, Value>) -> Result<()>;
}

/// A tool's outbound channel: publishes result notifications onto the owning
/// agent's queue. Handed to tools at registration time so they carry no
/// back-pointer to the agent.
#[derive(Clone)]
pub struct ToolChannel {
    agent_name: String,
    broker: Arc<Broker>,
}

impl ToolChannel {
    pub fn new(agent_name: &str, broker: Arc<Broker>) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            broker,
        }
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn publish_success(&self, tool_name: &str, result: Value) {
        self.publish(Notification::tool_result(
            &self.agent_name,
            tool_name,
            "SUCCESS",
            Some(result),
            None,
        ));
    }

    pub fn publish_failure(&self, tool_name: &str, error_message: &str) {
        self.publish(Notification::tool_result(
            &self.agent_name,
            tool_name,
            "FAILURE",
            None,
            Some(error_message.to_string()),
        ));
    }

    /// Publish an arbitrary notification onto the owning agent's queue.
    /// Used by the sleep timer for its wake alert.
    pub fn publish_notification(&self, notification: &Notification) {
        let queue = queue_name(&self.agent_name);
        if let Err(err) = self.broker.publish(&queue, notification) {
            // Result publication is the tool's only voice; losing it is
            // logged loudly but must not take the loop down.
            error!(error = %err, queue, "tool failed to publish notification");
        } else {
            debug!(queue, "tool notification published");
        }
    }

    fn publish(&self, notification: Notification) {
        self.publish_notification(&notification);
    }
}

/// Central registry keyed by tool name. First registration wins on lookup.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        debug!(name = tool.name(), "tool registered");
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    /// Tools that pass `is_available` for this context, further restricted to
    /// [`FAST_MODE_TOOLS`] when fast mode is on.
    pub fn available(&self, context: &ToolContext, fast_mode: bool) -> Vec<Arc<dyn Tool>> {
        self.tools
            .iter()
            .filter(|t| t.is_available(context))
            .filter(|t| !fast_mode || FAST_MODE_TOOLS.contains(&t.name()))
            .cloned()
            .collect()
    }

    /// Render the `{tools}` section of the system prompt.
    pub fn render_tools_section(&self, context: &ToolContext, fast_mode: bool) -> String {
        if self.tools.is_empty() {
            return "No tools are currently registered.".to_string();
        }
        let available = self.available(context, fast_mode);
        if available.is_empty() {
            return "No tools are currently available in this context.".to_string();
        }

        available
            .iter()
            .map(|tool| {
                let info = tool.info();
                let mut text = format!("### {}\n{}", info.command, info.description);
                if info.parameters.is_empty() {
                    text.push_str("\n**Parameters:** None");
                } else {
                    text.push_str("\n**Parameters:**");
                    for param in &info.parameters {
                        let required = if param.required { "Required" } else { "Optional" };
                        text.push_str(&format!(
                            "\n- `{}` ({}): {} [{}]",
                            param.name, param.param_type, param.description, required
                        ));
                    }
                }
                text
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

// ── Argument helpers ─────────────────────────────────────────────────────────

pub fn require_string<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str, String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| format!("missing required string argument '{key}'"))
}

pub fn require_positive_number(args: &Map<String, Value>, key: &str) -> Result<f64, String> {
    let value = args
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| format!("missing required numeric argument '{key}'"))?;
    if value <= 0.0 {
        return Err(format!("argument '{key}' must be positive, got {value}"));
    }
    Ok(value)
}

// ── Standard tools ───────────────────────────────────────────────────────────

mod call;
mod messaging;
mod sleep;
mod system_prompt;

pub use call::{HangUpTool, SpeakTool};
pub use messaging::SendUserMessageTool;
pub use sleep::{ShutdownTool, SleepRegistry, SleepTool};
pub use system_prompt::{EditSystemPromptTool, ReadSystemPromptTool};

// ── Registry tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod registry_tests {
    use super::*;

    struct DummyTool {
        name: String,
        call_only: bool,
    }

    #[async_trait]
    impl Tool for DummyTool {
        fn name(&self) -> &str {
            &self.name
        }

        fn info(&self) -> ToolInfo {
            ToolInfo {
                command: self.name.clone(),
                description: format!("Dummy tool: {}", self.name),
                parameters: vec![ToolParam::required("input", "str", "test param")],
            }
        }

        fn is_available(&self, context: &ToolContext) -> bool {
            !self.call_only || context.is_on_call()
        }

        async fn execute(&self, _args: Map<String, Value>) -> Result<()> {
            Ok(())
        }
    }

    fn dummy(name: &str, call_only: bool) -> Arc<dyn Tool> {
        Arc::new(DummyTool {
            name: name.into(),
            call_only,
        })
    }

    #[test]
    fn empty_registry() {
        let registry = ToolRegistry::default();
        assert!(registry.get("anything").is_none());
        assert_eq!(
            registry.render_tools_section(&ToolContext::default(), false),
            "No tools are currently registered."
        );
    }

    #[test]
    fn register_and_get() {
        let mut registry = ToolRegistry::default();
        registry.register(dummy("alpha", false));
        registry.register(dummy("beta", false));
        assert!(registry.get("alpha").is_some());
        assert!(registry.get("beta").is_some());
        assert!(registry.get("gamma").is_none());
    }

    #[test]
    fn availability_gates_rendering() {
        let mut registry = ToolRegistry::default();
        registry.register(dummy("send_user_message", false));
        registry.register(dummy("speak", true));

        let off_call = registry.render_tools_section(&ToolContext::default(), false);
        assert!(off_call.contains("send_user_message"));
        assert!(!off_call.contains("### speak"));

        let on_call_ctx = ToolContext {
            session_id: Some("s1".into()),
            call_id: Some("c1".into()),
        };
        let on_call = registry.render_tools_section(&on_call_ctx, false);
        assert!(on_call.contains("### speak"));
    }

    #[test]
    fn fast_mode_restricts_to_voice_tools() {
        let mut registry = ToolRegistry::default();
        registry.register(dummy("send_user_message", false));
        registry.register(dummy("speak", false));
        registry.register(dummy("hang_up", false));
        registry.register(dummy("web_search", false));

        let rendered = registry.render_tools_section(&ToolContext::default(), true);
        assert!(rendered.contains("### speak"));
        assert!(rendered.contains("### hang_up"));
        assert!(!rendered.contains("send_user_message"));
        assert!(!rendered.contains("web_search"));

        let available = registry.available(&ToolContext::default(), true);
        assert_eq!(available.len(), 2);
    }

    #[test]
    fn duplicate_name_get_returns_first_registered() {
        let mut registry = ToolRegistry::default();
        registry.register(dummy("dup", false));
        registry.register(dummy("dup", true));
        assert!(registry.get("dup").is_some());
        assert_eq!(registry.names().iter().filter(|n| *n == "dup").count(), 2);
    }

    #[test]
    fn argument_helpers() {
        let mut args = Map::new();
        args.insert("text".into(), Value::String("hello".into()));
        args.insert("duration".into(), serde_json::json!(60));
        args.insert("blank".into(), Value::String("  ".into()));

        assert_eq!(require_string(&args, "text").unwrap(), "hello");
        assert!(require_string(&args, "blank").is_err());
        assert!(require_string(&args, "missing").is_err());
        assert_eq!(require_positive_number(&args, "duration").unwrap(), 60.0);
        args.insert("duration".into(), serde_json::json!(-5));
        assert!(require_positive_number(&args, "duration").is_err());
    }
}
