//! Prompt files and `{placeholder}` templates.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Result, SkeinError};
use crate::types::ChatMessage;

/// Read a prompt file, trimmed. Absent or blank files are errors.
pub fn load_prompt_file(path: &Path) -> Result<String> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| SkeinError::PromptNotFound(format!("{}: {}", path.display(), e)))?;
    let content = data.trim();
    if content.is_empty() {
        return Err(SkeinError::PromptEmpty(path.display().to_string()));
    }
    Ok(content.to_string())
}

/// Replace every `{name}` with its value from `vars`.
///
/// Placeholders without a value are left as-is.
pub fn render(template: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{}}}", name), value);
    }
    out
}

/// A system + user message pair with placeholders.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub system: String,
    pub user: String,
}

impl PromptTemplate {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }

    /// Render into `[system, user]` chat messages.
    pub fn format(&self, vars: &BTreeMap<String, String>) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(render(&self.system, vars)),
            ChatMessage::user(render(&self.user, vars)),
        ]
    }
}
