use tracing::{debug, info};

use murmur_fabric::{Notification, NotificationType};
use murmur_tools::ToolContext;

/// Sticky session/call context, refreshed from each notification batch.
///
/// `call_id` and `fast_mode` survive across cycles until a non-call user
/// message clears them; `session_id` survives until replaced.
#[derive(Debug, Default, Clone)]
pub struct CallSession {
    pub last_session_id: Option<String>,
    pub last_call_id: Option<String>,
    pub fast_mode: bool,
}

impl CallSession {
    pub fn is_on_call(&self) -> bool {
        self.last_call_id.is_some()
    }

    pub fn tool_context(&self) -> ToolContext {
        ToolContext {
            session_id: self.last_session_id.clone(),
            call_id: self.last_call_id.clone(),
        }
    }

    /// Walk the batch in order and update the sticky fields per notification
    /// type. Returns the session id in effect afterwards.
    pub fn update_from(&mut self, notifications: &[Notification]) -> Option<String> {
        for notification in notifications {
            let payload = &notification.payload;
            match notification.notification_type {
                NotificationType::IncomingCall
                | NotificationType::CallTransferred
                | NotificationType::CallAnswered => {
                    if let Some(call_id) = payload["call_id"].as_str() {
                        info!(call_id, kind = ?notification.notification_type, "call context set");
                        self.last_call_id = Some(call_id.to_string());
                    }
                    if let Some(session_id) = payload["session_id"].as_str() {
                        self.last_session_id = Some(session_id.to_string());
                    }
                }
                NotificationType::ToolResult => {
                    // answer_call success carries the call id in its result.
                    if payload["tool_name"] == "answer_call" && payload["status"] == "SUCCESS" {
                        if let Some(call_id) = payload["result"]["call_id"].as_str() {
                            info!(call_id, "call context set from answer_call");
                            self.last_call_id = Some(call_id.to_string());
                        }
                    }
                }
                NotificationType::UserMessage => {
                    if let Some(session_id) = payload["session_id"].as_str() {
                        self.last_session_id = Some(session_id.to_string());
                    }

                    // Voice transcriptions nest their flags in voice_metadata.
                    let voice = &payload["voice_metadata"];
                    let call_id = payload["call_id"]
                        .as_str()
                        .or_else(|| voice["call_id"].as_str());
                    let is_call_mode = payload["is_call_mode"].as_bool().unwrap_or(false)
                        || voice["is_call_mode"].as_bool().unwrap_or(false);
                    let fast_mode = payload["fast_mode"].as_bool().unwrap_or(false)
                        || voice["fast_mode"].as_bool().unwrap_or(false);

                    if fast_mode != self.fast_mode {
                        info!(fast_mode, "fast mode toggled");
                    }

                    if let Some(call_id) = call_id {
                        self.last_call_id = Some(call_id.to_string());
                        self.fast_mode = fast_mode;
                    } else if !is_call_mode {
                        // A regular text message ends any call context.
                        if self.last_call_id.is_some() {
                            debug!("call context cleared by non-call user message");
                        }
                        self.last_call_id = None;
                        self.fast_mode = false;
                    }
                }
                _ => {}
            }
        }
        self.last_session_id.clone()
    }
}
