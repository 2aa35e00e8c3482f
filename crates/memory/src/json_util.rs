use murmur_store::StoredMessage;

/// Strip one surrounding markdown code fence, if present.
pub(crate) fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }
    let without_open = match trimmed.find('\n') {
        Some(idx) => &trimmed[idx + 1..],
        None => return trimmed,
    };
    match without_open.rfind("```") {
        Some(idx) => without_open[..idx].trim(),
        None => without_open.trim(),
    }
}

/// Render transcript rows as `ROLE: {content}` blocks for module context.
pub(crate) fn format_messages(messages: &[StoredMessage], last_n: usize) -> String {
    let start = messages.len().saturating_sub(last_n);
    messages[start..]
        .iter()
        .map(|message| {
            let content = serde_json::to_string(&message.content).unwrap_or_default();
            format!("{}: {}", message.role.as_str().to_uppercase(), content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_store::MessageRole;

    #[test]
    fn strips_fenced_json() {
        let fenced = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fences(fenced), "{\"a\": 1}");
        assert_eq!(strip_code_fences("{\"a\": 1}"), "{\"a\": 1}");
    }

    #[test]
    fn formats_last_n_messages() {
        let messages: Vec<StoredMessage> = (0..4)
            .map(|i| StoredMessage {
                role: if i % 2 == 0 {
                    MessageRole::User
                } else {
                    MessageRole::Assistant
                },
                content: serde_json::json!({ "text": i }),
                documents: vec![],
                timestamp: chrono::Utc::now(),
            })
            .collect();
        let rendered = format_messages(&messages, 2);
        assert!(rendered.contains("USER: {\"text\":2}"));
        assert!(rendered.contains("ASSISTANT: {\"text\":3}"));
        assert!(!rendered.contains("{\"text\":0}"));
    }
}
