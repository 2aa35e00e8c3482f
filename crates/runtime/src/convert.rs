//! Conversion from built conversation messages to the LLM wire shape.
//!
//! User messages can carry base64 image blobs buried inside a
//! JSON-stringified notifications payload (or attached structurally by the
//! image-injection step). The text sent to the model must not include those
//! blobs: they are replaced with a metadata note and re-attached as separate
//! binary parts, keeping the token budget bounded.

use base64::Engine;
use serde_json::{json, Value};
use tracing::{debug, warn};

use murmur_llm::{LlmMessage, Part};
use murmur_store::MessageRole;

use crate::context::ContextMessage;

pub fn to_llm_messages(messages: &[ContextMessage]) -> Vec<LlmMessage> {
    messages
        .iter()
        .map(|message| match message.role {
            MessageRole::System => {
                let text = content_text(&message.content);
                LlmMessage::user(format!("System: {text}"))
            }
            MessageRole::User => LlmMessage::user_parts(user_parts(&message.content)),
            MessageRole::Assistant => LlmMessage::model(content_text(&message.content)),
        })
        .collect()
}

fn content_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn user_parts(content: &Value) -> Vec<Part> {
    let mut blobs: Vec<Part> = Vec::new();
    let text = match content {
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(mut batch) if batch.is_array() => {
                blobs.extend(strip_images_from_batch(&mut batch));
                serde_json::to_string(&batch).unwrap_or_else(|_| raw.clone())
            }
            _ => raw.clone(),
        },
        Value::Object(object) => {
            // Structured content: images attached by the injection step, plus
            // a text body that may itself be a stringified notification batch.
            if let Some(Value::Array(images)) = object.get("images") {
                for image in images {
                    if let Some(blob) = decode_image(image) {
                        blobs.push(blob);
                    }
                }
            }

            if let Some(Value::String(raw)) = object.get("notifications") {
                match serde_json::from_str::<Value>(raw) {
                    Ok(mut batch) if batch.is_array() => {
                        blobs.extend(strip_images_from_batch(&mut batch));
                        serde_json::to_string(&batch).unwrap_or_else(|_| raw.clone())
                    }
                    _ => raw.clone(),
                }
            } else if let Some(Value::String(text)) = object.get("text") {
                match serde_json::from_str::<Value>(text) {
                    Ok(mut batch) if batch.is_array() => {
                        blobs.extend(strip_images_from_batch(&mut batch));
                        serde_json::to_string(&batch).unwrap_or_else(|_| text.clone())
                    }
                    _ => text.clone(),
                }
            } else {
                content_text(content)
            }
        }
        other => content_text(other),
    };

    let mut parts = vec![Part::Text(text)];
    if !blobs.is_empty() {
        debug!(count = blobs.len(), "attached image parts for vision");
        parts.extend(blobs);
    }
    parts
}

/// Remove base64 image data from every notification payload in the batch,
/// returning the decoded blobs. Stripped entries keep their metadata plus a
/// note telling the model the bytes travel separately.
fn strip_images_from_batch(batch: &mut Value) -> Vec<Part> {
    let mut blobs = Vec::new();
    let Some(items) = batch.as_array_mut() else {
        return blobs;
    };

    for item in items {
        let Some(payload) = item.get_mut("payload").and_then(|p| p.as_object_mut()) else {
            continue;
        };
        let Some(Value::Array(images)) = payload.get("images") else {
            continue;
        };

        let mut stripped = Vec::with_capacity(images.len());
        for image in images {
            if let Some(blob) = decode_image(image) {
                blobs.push(blob);
            }
            stripped.push(json!({
                "attachment_id": image.get("attachment_id").cloned().unwrap_or(Value::String("unknown".into())),
                "content_type": image.get("content_type").cloned().unwrap_or(Value::String("image/png".into())),
                "_note": "Image data sent separately to vision model",
            }));
        }
        payload.insert("images".to_string(), Value::Array(stripped));
    }
    blobs
}

fn decode_image(image: &Value) -> Option<Part> {
    let data = image.get("base64_data")?.as_str()?;
    let mime_type = image
        .get("content_type")
        .and_then(|v| v.as_str())
        .unwrap_or("image/png")
        .to_string();
    match base64::engine::general_purpose::STANDARD.decode(data) {
        Ok(bytes) => Some(Part::Blob {
            mime_type,
            data: bytes,
        }),
        Err(err) => {
            warn!(error = %err, "failed to decode image payload");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_llm::LlmRole;

    fn message(role: MessageRole, content: Value) -> ContextMessage {
        ContextMessage { role, content }
    }

    #[test]
    fn system_becomes_prefixed_user() {
        let converted = to_llm_messages(&[message(
            MessageRole::System,
            Value::String("You are helpful.".into()),
        )]);
        assert_eq!(converted[0].role, LlmRole::User);
        match &converted[0].parts[0] {
            Part::Text(text) => assert_eq!(text, "System: You are helpful."),
            _ => panic!("expected text part"),
        }
    }

    #[test]
    fn assistant_maps_to_model_role_text_only() {
        let converted = to_llm_messages(&[message(
            MessageRole::Assistant,
            json!({ "thought": "t", "tool_calls": [] }),
        )]);
        assert_eq!(converted[0].role, LlmRole::Model);
        assert_eq!(converted[0].parts.len(), 1);
    }

    #[test]
    fn string_batch_with_images_is_stripped_and_reattached() {
        let batch = json!([{
            "notification_type": "user_message",
            "source": "api_gateway",
            "payload": {
                "content": "look at this",
                "images": [{
                    "attachment_id": "att1",
                    "content_type": "image/jpeg",
                    "base64_data": "AQID"
                }]
            }
        }]);
        let converted = to_llm_messages(&[message(
            MessageRole::User,
            Value::String(batch.to_string()),
        )]);

        let parts = &converted[0].parts;
        assert_eq!(parts.len(), 2);
        match &parts[0] {
            Part::Text(text) => {
                assert!(!text.contains("AQID"), "base64 must be stripped from text");
                assert!(text.contains("sent separately"));
                assert!(text.contains("att1"));
            }
            _ => panic!("expected text part first"),
        }
        match &parts[1] {
            Part::Blob { mime_type, data } => {
                assert_eq!(mime_type, "image/jpeg");
                assert_eq!(data, &vec![1, 2, 3]);
            }
            _ => panic!("expected blob part"),
        }
    }

    #[test]
    fn structured_content_with_injected_images() {
        let content = json!({
            "text": "[]",
            "images": [{ "content_type": "image/png", "base64_data": "AQID" }]
        });
        let converted = to_llm_messages(&[message(MessageRole::User, content)]);
        assert_eq!(converted[0].parts.len(), 2);
        assert!(matches!(&converted[0].parts[1], Part::Blob { .. }));
    }

    #[test]
    fn notifications_wrapper_is_unwrapped_for_the_model() {
        let content = json!({ "notifications": "[{\"notification_type\":\"user_message\",\"payload\":{\"content\":\"hi\"}}]" });
        let converted = to_llm_messages(&[message(MessageRole::User, content)]);
        match &converted[0].parts[0] {
            Part::Text(text) => {
                assert!(text.starts_with('['));
                assert!(text.contains("\"hi\""));
            }
            _ => panic!("expected text part"),
        }
    }

    #[test]
    fn invalid_base64_keeps_metadata_but_skips_blob() {
        let batch = json!([{
            "payload": { "images": [{ "base64_data": "!!!not-base64!!!" }] }
        }]);
        let converted = to_llm_messages(&[message(
            MessageRole::User,
            Value::String(batch.to_string()),
        )]);
        assert_eq!(converted[0].parts.len(), 1);
        match &converted[0].parts[0] {
            Part::Text(text) => assert!(text.contains("sent separately")),
            _ => panic!("expected text part"),
        }
    }
}
