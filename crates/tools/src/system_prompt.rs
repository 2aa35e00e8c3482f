use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::info;

use crate::{Tool, ToolChannel, ToolInfo, ToolParam};

/// The live-edit placeholder every prompt template must keep. Removing it
/// would cost the agent its entire tool surface, so edits that drop it are
/// rejected outright.
const TOOLS_TOKEN: &str = "{tools}";

/// Reads the agent's raw system prompt template from disk.
pub struct ReadSystemPromptTool {
    channel: ToolChannel,
    prompt_path: PathBuf,
}

impl ReadSystemPromptTool {
    pub fn new(channel: ToolChannel, prompt_path: PathBuf) -> Self {
        Self {
            channel,
            prompt_path,
        }
    }
}

#[async_trait]
impl Tool for ReadSystemPromptTool {
    fn name(&self) -> &str {
        "read_system_prompt"
    }

    fn info(&self) -> ToolInfo {
        ToolInfo {
            command: "read_system_prompt".into(),
            description: "Read your current system prompt template from disk. The {tools} \
                          placeholder is replaced with tool descriptions at runtime."
                .into(),
            parameters: vec![],
        }
    }

    async fn execute(&self, _args: Map<String, Value>) -> Result<()> {
        match std::fs::read_to_string(&self.prompt_path) {
            Ok(content) => {
                self.channel.publish_success(
                    "read_system_prompt",
                    serde_json::json!({
                        "content": content,
                        "path": self.prompt_path.display().to_string(),
                        "size_bytes": content.len(),
                    }),
                );
            }
            Err(err) => {
                self.channel.publish_failure(
                    "read_system_prompt",
                    &format!("could not read {}: {err}", self.prompt_path.display()),
                );
            }
        }
        Ok(())
    }
}

/// Edits the agent's system prompt template. Changes take effect on the next
/// cycle via the context builder's hash check.
pub struct EditSystemPromptTool {
    channel: ToolChannel,
    prompt_path: PathBuf,
}

impl EditSystemPromptTool {
    pub fn new(channel: ToolChannel, prompt_path: PathBuf) -> Self {
        Self {
            channel,
            prompt_path,
        }
    }

    /// Compute the edited template, or an error describing why the edit is
    /// rejected. Pure so it can be tested without touching disk.
    fn apply_edit(
        current: &str,
        new_content: Option<&str>,
        find: Option<&str>,
        replace: Option<&str>,
        append: Option<&str>,
    ) -> Result<(String, &'static str), String> {
        let (final_content, operation) = if let Some(new_content) = new_content {
            (new_content.to_string(), "full_replace")
        } else if let (Some(find), Some(replace)) = (find, replace) {
            if !current.contains(find) {
                let preview: String = find.chars().take(100).collect();
                return Err(format!(
                    "text to find not present in system prompt: '{preview}'"
                ));
            }
            (current.replace(find, replace), "find_replace")
        } else if let Some(append) = append {
            let appended = if current.contains(TOOLS_TOKEN) {
                current.replace(TOOLS_TOKEN, &format!("{append}\n\n{TOOLS_TOKEN}"))
            } else {
                format!("{current}\n\n{append}")
            };
            (appended, "append")
        } else {
            return Err(
                "must provide either 'new_content', 'find'+'replace', or 'append'".to_string(),
            );
        };

        if !final_content.contains(TOOLS_TOKEN) {
            return Err(format!(
                "rejected: the {TOOLS_TOKEN} placeholder is missing from the new content. \
                 It must stay in the prompt or all tools become unreachable."
            ));
        }
        Ok((final_content, operation))
    }
}

#[async_trait]
impl Tool for EditSystemPromptTool {
    fn name(&self) -> &str {
        "edit_system_prompt"
    }

    fn info(&self) -> ToolInfo {
        ToolInfo {
            command: "edit_system_prompt".into(),
            description: "Edit your system prompt. Takes effect on the next turn. You MUST \
                          preserve the {tools} placeholder or the edit is rejected."
                .into(),
            parameters: vec![
                ToolParam::optional("new_content", "str", "Complete replacement content"),
                ToolParam::optional("find", "str", "Text to find (used with 'replace')"),
                ToolParam::optional("replace", "str", "Replacement for the found text"),
                ToolParam::optional("append", "str", "Text to append before {tools}"),
            ],
        }
    }

    fn validate(&self, args: &Map<String, Value>) -> Result<(), String> {
        let has_full = args.get("new_content").is_some_and(|v| v.is_string());
        let has_find_replace = args.get("find").is_some_and(|v| v.is_string())
            && args.get("replace").is_some_and(|v| v.is_string());
        let has_append = args.get("append").is_some_and(|v| v.is_string());
        if has_full || has_find_replace || has_append {
            Ok(())
        } else {
            Err("must provide either 'new_content', 'find'+'replace', or 'append'".to_string())
        }
    }

    async fn execute(&self, args: Map<String, Value>) -> Result<()> {
        let current = match std::fs::read_to_string(&self.prompt_path) {
            Ok(content) => content,
            Err(err) => {
                self.channel.publish_failure(
                    "edit_system_prompt",
                    &format!("could not read {}: {err}", self.prompt_path.display()),
                );
                return Ok(());
            }
        };

        let result = Self::apply_edit(
            &current,
            args.get("new_content").and_then(|v| v.as_str()),
            args.get("find").and_then(|v| v.as_str()),
            args.get("replace").and_then(|v| v.as_str()),
            args.get("append").and_then(|v| v.as_str()),
        );

        match result {
            Ok((final_content, operation)) => {
                if let Err(err) = std::fs::write(&self.prompt_path, &final_content) {
                    self.channel.publish_failure(
                        "edit_system_prompt",
                        &format!("could not write {}: {err}", self.prompt_path.display()),
                    );
                    return Ok(());
                }
                info!(operation, bytes = final_content.len(), "system prompt edited");
                self.channel.publish_success(
                    "edit_system_prompt",
                    serde_json::json!({
                        "operation": operation,
                        "new_size_bytes": final_content.len(),
                        "note": "changes take effect on the next turn",
                    }),
                );
            }
            Err(error) => {
                // Rejected edits leave the file untouched.
                self.channel.publish_failure("edit_system_prompt", &error);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_fabric::{queue_name, Broker};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn edit_dropping_tools_token_is_rejected() {
        let current = "Be helpful.\n\n{tools}\n";
        let err = EditSystemPromptTool::apply_edit(current, Some("Be helpful."), None, None, None)
            .unwrap_err();
        assert!(err.contains("{tools}"));
    }

    #[test]
    fn find_replace_preserving_token_succeeds() {
        let current = "Be helpful.\n\n{tools}\n";
        let (next, op) = EditSystemPromptTool::apply_edit(
            current,
            None,
            Some("helpful"),
            Some("concise"),
            None,
        )
        .unwrap();
        assert_eq!(op, "find_replace");
        assert!(next.contains("Be concise."));
        assert!(next.contains("{tools}"));
    }

    #[test]
    fn append_goes_before_tools_token() {
        let current = "Intro.\n\n{tools}";
        let (next, op) =
            EditSystemPromptTool::apply_edit(current, None, None, None, Some("New rule."))
                .unwrap();
        assert_eq!(op, "append");
        let rule_idx = next.find("New rule.").unwrap();
        let tools_idx = next.find("{tools}").unwrap();
        assert!(rule_idx < tools_idx);
    }

    #[test]
    fn find_replace_with_absent_needle_fails() {
        let current = "Intro. {tools}";
        let err = EditSystemPromptTool::apply_edit(current, None, Some("nope"), Some("x"), None)
            .unwrap_err();
        assert!(err.contains("not present"));
    }

    #[tokio::test]
    async fn rejected_edit_leaves_file_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let prompt_path = dir.path().join("system_prompt.txt");
        std::fs::write(&prompt_path, "Original. {tools}").unwrap();

        let broker = Arc::new(
            Broker::connect_with(dir.path().join("q.redb"), 1, Duration::from_millis(1))
                .await
                .unwrap(),
        );
        let tool = EditSystemPromptTool::new(
            ToolChannel::new("a_agent", broker.clone()),
            prompt_path.clone(),
        );

        let mut args = Map::new();
        args.insert("new_content".into(), Value::String("no placeholder".into()));
        tool.execute(args).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(&prompt_path).unwrap(),
            "Original. {tools}"
        );
        let drained = broker.drain(&queue_name("a_agent")).unwrap();
        assert_eq!(drained[0].notification.payload["status"], "FAILURE");
    }
}
