use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Typed intent of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    UserMessage,
    AgentMessage,
    ToolResult,
    IncomingCall,
    CallAnswered,
    CallTransferred,
    AlarmTriggered,
    TimerExpired,
    SleepTimerExpired,
    ErrorMessage,
    SystemAlert,
}

/// A message exchanged on an agent's queue.
///
/// The payload is opaque JSON; its shape depends on `notification_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub notification_id: String,
    pub timestamp: DateTime<Utc>,
    pub recipient_agent_id: String,
    pub source: String,
    pub notification_type: NotificationType,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Notification {
    pub fn new(
        notification_type: NotificationType,
        recipient_agent_id: impl Into<String>,
        source: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            notification_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            recipient_agent_id: recipient_agent_id.into(),
            source: source.into(),
            notification_type,
            payload,
        }
    }

    /// Result notification published by a tool onto its agent's queue.
    pub fn tool_result(
        agent_name: &str,
        tool_name: &str,
        status: &str,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> Self {
        let mut n = Self::new(
            NotificationType::ToolResult,
            agent_name,
            format!("tool_{tool_name}"),
            serde_json::json!({
                "tool_name": tool_name,
                "status": status,
                "result": result,
                "error_message": error_message,
            }),
        );
        n.notification_id = format!("tool_{tool_name}_{}", Uuid::new_v4().simple());
        n
    }

    /// Audit notification for a permanent processing failure.
    pub fn error(agent_name: &str, error_type: &str, error_message: &str) -> Self {
        let mut n = Self::new(
            NotificationType::ErrorMessage,
            agent_name,
            "system",
            serde_json::json!({
                "error_type": error_type,
                "error_message": error_message,
            }),
        );
        n.notification_id = format!("error_{}", Uuid::new_v4().simple());
        n
    }

    /// Wake notification emitted by an expired sleep timer.
    pub fn wake(agent_name: &str, sleep_id: &str, duration_seconds: f64) -> Self {
        let mut n = Self::new(
            NotificationType::SystemAlert,
            agent_name,
            "system",
            serde_json::json!({
                "alert_type": "WAKE",
                "alert_name": "sleep_wake",
                "message": format!("Sleep completed after {duration_seconds} seconds"),
                "sleep_id": sleep_id,
                "duration": duration_seconds,
            }),
        );
        n.notification_id = format!("wake_{sleep_id}");
        n
    }
}
