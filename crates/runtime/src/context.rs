use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use murmur_fabric::Notification;
use murmur_store::{MessageRole, StoredMessage};

/// Max raw-response bytes embedded in parse errors for diagnosis.
const RAW_ERROR_LIMIT: usize = 2000;

/// One message of the built conversation, pre-conversion to the LLM wire
/// shape. Content is either a JSON string (serialized notifications) or a
/// structured object.
#[derive(Debug, Clone)]
pub struct ContextMessage {
    pub role: MessageRole,
    pub content: Value,
}

/// An image queued for injection into the next LLM call.
#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub attachment_id: Option<String>,
    pub content_type: String,
    pub base64_data: String,
}

/// A validated tool invocation from the model.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub tool_name: String,
    pub arguments: Map<String, Value>,
}

/// Parsed assistant output.
#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub thought: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub action_status: Option<String>,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid JSON from llm: {error}\nRAW LLM RESPONSE (truncated):\n{raw}")]
    InvalidJson { error: String, raw: String },
    #[error("llm response missing required '{field}' field\nRAW LLM RESPONSE (truncated):\n{raw}")]
    MissingField { field: &'static str, raw: String },
    #[error("llm response has wrong shape: {detail}\nRAW LLM RESPONSE (truncated):\n{raw}")]
    WrongShape { detail: String, raw: String },
    #[error("empty tool_calls: every assistant turn must emit at least one tool call")]
    EmptyToolCalls,
}

impl ParseError {
    /// Marker key used when persisting the failed turn to the transcript.
    pub fn transcript_marker(&self) -> &'static str {
        match self {
            ParseError::EmptyToolCalls => "validation_error",
            _ => "parse_error",
        }
    }
}

fn truncate_raw(raw: &str) -> String {
    if raw.len() <= RAW_ERROR_LIMIT {
        raw.to_string()
    } else {
        let cut = raw
            .char_indices()
            .take_while(|(i, _)| *i < RAW_ERROR_LIMIT)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(RAW_ERROR_LIMIT);
        format!("{}... (truncated, {} total chars)", &raw[..cut], raw.len())
    }
}

/// Assembles the LLM input list and parses the LLM output.
///
/// The builder does not resolve the prompt itself (the loop hands it the
/// already-resolved content each cycle) but it owns change detection: the
/// content is hashed, and the first build as well as any hash change reports
/// `changed = true` so the caller can mirror the prompt into the transcript's
/// system message.
pub struct ContextBuilder {
    max_conversation_messages: usize,
    last_prompt_hash: Mutex<Option<String>>,
}

impl ContextBuilder {
    pub fn new(max_conversation_messages: usize) -> Self {
        Self {
            max_conversation_messages,
            last_prompt_hash: Mutex::new(None),
        }
    }

    /// Build the fresh system message. Returns `(message, changed)`.
    pub fn build_system_message(&self, content: &str) -> (ContextMessage, bool) {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        let hash = format!("{:x}", hasher.finalize());

        let mut last = self.last_prompt_hash.lock();
        let changed = match last.as_deref() {
            None => {
                info!(hash = &hash[..8], "system prompt initial sync");
                true
            }
            Some(previous) if previous != hash => {
                info!(from = &previous[..8], to = &hash[..8], "system prompt changed");
                true
            }
            _ => false,
        };
        *last = Some(hash);

        (
            ContextMessage {
                role: MessageRole::System,
                content: Value::String(content.to_string()),
            },
            changed,
        )
    }

    /// Serialize a notification batch to the JSON array string the model
    /// sees.
    pub fn format_notifications(notifications: &[Notification]) -> String {
        let formatted: Vec<Value> = notifications
            .iter()
            .map(|n| {
                json!({
                    "notification_type": n.notification_type,
                    "source": n.source,
                    "payload": n.payload,
                    "timestamp": n.timestamp,
                })
            })
            .collect();
        serde_json::to_string(&formatted).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn build_user_message_from_notifications(notifications: &[Notification]) -> ContextMessage {
        ContextMessage {
            role: MessageRole::User,
            content: Value::String(Self::format_notifications(notifications)),
        }
    }

    /// The `proactive_memories` message appended when the Retriever surfaced
    /// something. `memories` entries are `{content, datetime, importance}`.
    pub fn build_memories_message(memories: &[Value]) -> ContextMessage {
        ContextMessage {
            role: MessageRole::User,
            content: json!({ "type": "proactive_memories", "memories": memories }),
        }
    }

    pub fn build_assistant_message(
        thought: &str,
        tool_calls: &[ToolCallRequest],
        action_status: Option<&str>,
    ) -> Value {
        let calls: Vec<Value> = tool_calls
            .iter()
            .map(|call| json!({ "tool_name": call.tool_name, "arguments": call.arguments }))
            .collect();
        let mut content = json!({ "thought": thought, "tool_calls": calls });
        if let Some(action_status) = action_status {
            content["action_status"] = Value::String(action_status.to_string());
        }
        content
    }

    /// Assemble the full conversation: fresh system message first, stored
    /// history (minus its stale system row), then the new notification batch.
    /// Returns the list plus whether the prompt content changed since the
    /// last build.
    pub fn build_conversation(
        &self,
        system_content: &str,
        existing_messages: &[StoredMessage],
        notifications: &[Notification],
        tool_results: &[Value],
    ) -> (Vec<ContextMessage>, bool) {
        let (system_message, prompt_changed) = self.build_system_message(system_content);
        let mut messages = vec![system_message];

        let history = match existing_messages.first() {
            Some(first) if first.role == MessageRole::System => &existing_messages[1..],
            _ => existing_messages,
        };
        messages.extend(history.iter().map(|m| ContextMessage {
            role: m.role,
            content: m.content.clone(),
        }));

        if !notifications.is_empty() {
            messages.push(Self::build_user_message_from_notifications(notifications));
        }
        if !tool_results.is_empty() {
            let serialized =
                serde_json::to_string(tool_results).unwrap_or_else(|_| "[]".to_string());
            messages.push(ContextMessage {
                role: MessageRole::User,
                content: Value::String(serialized),
            });
        }

        if self.max_conversation_messages > 0 && messages.len() > self.max_conversation_messages {
            debug!(
                from = messages.len(),
                to = self.max_conversation_messages,
                "trimming conversation"
            );
            messages = trim_messages(messages, self.max_conversation_messages);
        }

        (messages, prompt_changed)
    }

    /// Strict parse of the model output.
    pub fn parse_llm_response(response: &str) -> Result<ParsedResponse, ParseError> {
        let cleaned = strip_code_fence(response);
        let mut data: Value =
            serde_json::from_str(cleaned).map_err(|e| ParseError::InvalidJson {
                error: e.to_string(),
                raw: truncate_raw(response),
            })?;

        // Some models wrap the object in a single-element array.
        if let Value::Array(items) = &data {
            if items.len() == 1 && items[0].is_object() {
                data = items[0].clone();
            } else {
                return Err(ParseError::WrongShape {
                    detail: "response must be a JSON object".to_string(),
                    raw: truncate_raw(response),
                });
            }
        }
        let Value::Object(mut object) = data else {
            return Err(ParseError::WrongShape {
                detail: "response must be a JSON object".to_string(),
                raw: truncate_raw(response),
            });
        };

        // Alias kept for older prompt templates.
        if !object.contains_key("thought") {
            if let Some(reasoning) = object.remove("reasoning") {
                object.insert("thought".to_string(), reasoning);
            }
        }

        let thought = object
            .get("thought")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ParseError::MissingField {
                field: "thought",
                raw: truncate_raw(response),
            })?
            .to_string();

        let calls = object
            .get("tool_calls")
            .ok_or_else(|| ParseError::MissingField {
                field: "tool_calls",
                raw: truncate_raw(response),
            })?
            .as_array()
            .ok_or_else(|| ParseError::WrongShape {
                detail: "'tool_calls' must be a list".to_string(),
                raw: truncate_raw(response),
            })?
            .clone();

        if calls.is_empty() {
            return Err(ParseError::EmptyToolCalls);
        }

        let mut tool_calls = Vec::with_capacity(calls.len());
        for (index, call) in calls.iter().enumerate() {
            let object = call.as_object().ok_or_else(|| ParseError::WrongShape {
                detail: format!("tool_calls[{index}] must be an object"),
                raw: truncate_raw(response),
            })?;
            let tool_name = object
                .get("tool_name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ParseError::WrongShape {
                    detail: format!("tool_calls[{index}] missing 'tool_name'"),
                    raw: truncate_raw(response),
                })?
                .to_string();
            let arguments = object
                .get("arguments")
                .and_then(|v| v.as_object())
                .ok_or_else(|| ParseError::WrongShape {
                    detail: format!("tool_calls[{index}] 'arguments' must be an object"),
                    raw: truncate_raw(response),
                })?
                .clone();
            tool_calls.push(ToolCallRequest {
                tool_name,
                arguments,
            });
        }

        let action_status = object
            .get("action_status")
            .and_then(|v| v.as_str())
            .map(String::from);

        Ok(ParsedResponse {
            thought,
            tool_calls,
            action_status,
        })
    }
}

/// Attach queued images to the most recent user message, in place. A string
/// content becomes `{text, images}`; an object grows an `images` list.
pub fn inject_pending_images(messages: &mut [ContextMessage], images: &[ImageAttachment]) {
    if images.is_empty() {
        return;
    }
    let encoded: Vec<Value> = images
        .iter()
        .map(|image| {
            json!({
                "attachment_id": image.attachment_id,
                "content_type": image.content_type,
                "base64_data": image.base64_data,
            })
        })
        .collect();

    for message in messages.iter_mut().rev() {
        if message.role != MessageRole::User {
            continue;
        }
        match &mut message.content {
            Value::String(text) => {
                message.content = json!({ "text": text, "images": encoded });
            }
            Value::Object(object) => {
                if !object.contains_key("text") {
                    let text = object
                        .get("notifications")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    object.insert("text".to_string(), Value::String(text));
                }
                let list = object
                    .entry("images".to_string())
                    .or_insert_with(|| Value::Array(vec![]));
                if let Value::Array(items) = list {
                    items.extend(encoded.iter().cloned());
                }
            }
            _ => {}
        }
        debug!(count = images.len(), "injected pending images into visual context");
        return;
    }
}

/// Front-trim while keeping `messages[0]` (system) and making sure the first
/// non-system message has role `user`.
fn trim_messages(mut messages: Vec<ContextMessage>, max_messages: usize) -> Vec<ContextMessage> {
    if messages.len() <= max_messages {
        return messages;
    }
    let system = messages.remove(0);
    if max_messages <= 1 {
        return vec![system];
    }

    let to_remove = messages.len().saturating_sub(max_messages - 1);
    let mut removed = 0;
    while (removed < to_remove
        || messages.first().map(|m| m.role) != Some(MessageRole::User))
        && !messages.is_empty()
    {
        messages.remove(0);
        removed += 1;
    }

    let mut result = vec![system];
    result.extend(messages);
    result
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }
    let body = match trimmed.find('\n') {
        Some(idx) => &trimmed[idx + 1..],
        None => return trimmed,
    };
    match body.rfind("```") {
        Some(idx) => body[..idx].trim(),
        None => body.trim(),
    }
}
