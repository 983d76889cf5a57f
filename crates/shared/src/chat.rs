//! Chat and message records.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::attachment::Attachment;

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    System,
    Tool,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::System => "system",
            Role::Tool => "tool",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "system" => Ok(Role::System),
            "tool" => Ok(Role::Tool),
            "assistant" => Ok(Role::Assistant),
            other => anyhow::bail!("unknown role: {other}"),
        }
    }
}

/// How a typed message should be sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendMode {
    /// Plain completion
    User,
    /// Add a system message without asking the model
    System,
    /// Tool-augmented completion
    Tool,
}

impl SendMode {
    /// Role of the message the user typed
    pub fn author_role(&self) -> Role {
        match self {
            SendMode::System => Role::System,
            SendMode::User | SendMode::Tool => Role::User,
        }
    }

    /// Whether the send expects an assistant reply
    pub fn expects_reply(&self) -> bool {
        !matches!(self, SendMode::System)
    }
}

/// Generate a message id: a sortable timestamp prefix followed by a v4 uuid.
pub fn generate_message_id() -> String {
    format!(
        "{}{}",
        Local::now().format("%Y%m%d%H%M%S%6f"),
        Uuid::new_v4().simple()
    )
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    /// Model that produced the message (assistant messages only)
    pub model_name: Option<String>,
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: generate_message_id(),
            timestamp: Utc::now(),
            role,
            model_name: None,
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    /// Empty assistant message filled in while the model streams.
    pub fn placeholder(model_name: impl Into<String>) -> Self {
        Self {
            model_name: Some(model_name.into()),
            ..Self::new(Role::Assistant, String::new())
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.role == Role::Assistant && self.model_name.is_some() && self.text.is_empty()
    }
}

/// Chat metadata as listed in the sidebar
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub name: String,
}

impl Chat {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_message_ids_are_unique() {
        let ids: HashSet<String> = (0..10_000).map(|_| generate_message_id()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn test_message_id_has_timestamp_prefix() {
        let id = generate_message_id();
        // 20 timestamp digits + 32 hex chars
        assert_eq!(id.len(), 52);
        assert!(id[..20].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_placeholder_has_model_and_no_text() {
        let bot = Message::placeholder("llama3.2:3b");
        assert_eq!(bot.role, Role::Assistant);
        assert_eq!(bot.model_name.as_deref(), Some("llama3.2:3b"));
        assert!(bot.text.is_empty());
        assert!(bot.is_placeholder());
    }

    #[test]
    fn test_send_mode_roles() {
        assert_eq!(SendMode::User.author_role(), Role::User);
        assert_eq!(SendMode::Tool.author_role(), Role::User);
        assert_eq!(SendMode::System.author_role(), Role::System);
        assert!(!SendMode::System.expects_reply());
    }
}
