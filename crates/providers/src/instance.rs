//! Backend instance contract.

use async_trait::async_trait;
use parking_lot::Mutex;
use shared::{Message, Tool, UiEvent, UiSender};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceKind {
    /// Nothing configured yet
    Empty,
    /// Ollama server reached over HTTP
    Ollama,
    /// Ollama server started and owned by this process
    OllamaManaged,
}

impl InstanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceKind::Empty => "empty",
            InstanceKind::Ollama => "ollama",
            InstanceKind::OllamaManaged => "ollama:managed",
        }
    }

    pub fn is_ollama(&self) -> bool {
        matches!(self, InstanceKind::Ollama | InstanceKind::OllamaManaged)
    }
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "empty" => Ok(InstanceKind::Empty),
            "ollama" => Ok(InstanceKind::Ollama),
            "ollama:managed" => Ok(InstanceKind::OllamaManaged),
            other => anyhow::bail!("unknown instance type: {other}"),
        }
    }
}

/// The assistant message a generation writes into, plus the conversation
/// that precedes it.
#[derive(Clone)]
pub struct GenerationTarget {
    pub chat_id: String,
    pub message: Arc<Mutex<Message>>,
    /// Earlier messages, oldest first, excluding the target itself
    pub history: Vec<Message>,
    events: UiSender,
}

impl GenerationTarget {
    pub fn new(
        chat_id: impl Into<String>,
        message: Message,
        history: Vec<Message>,
        events: UiSender,
    ) -> Self {
        Self {
            chat_id: chat_id.into(),
            message: Arc::new(Mutex::new(message)),
            history,
            events,
        }
    }

    pub fn message_id(&self) -> String {
        self.message.lock().id.clone()
    }

    pub fn snapshot(&self) -> Message {
        self.message.lock().clone()
    }

    /// Append streamed text and publish the delta.
    pub fn append(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let message_id = {
            let mut message = self.message.lock();
            message.text.push_str(text);
            message.id.clone()
        };
        self.events.emit(UiEvent::MessageDelta {
            chat_id: self.chat_id.clone(),
            message_id,
            text: text.to_string(),
        });
    }

    /// Write a backend failure into the message itself.
    pub fn report_error(&self, error: &str) {
        tracing::warn!("Generation failed in chat {}: {}", self.chat_id, error);
        let message = {
            let mut message = self.message.lock();
            if !message.text.is_empty() {
                message.text.push_str("\n\n");
            }
            message.text.push_str(&format!("**Error:** {}", error));
            message.clone()
        };
        self.events.emit(UiEvent::MessageUpdated {
            chat_id: self.chat_id.clone(),
            message,
        });
    }

    pub fn events(&self) -> &UiSender {
        &self.events
    }
}

/// A configured LLM backend. Failures are written into the target message;
/// the calls themselves never fail.
#[async_trait]
pub trait Instance: Send + Sync {
    fn kind(&self) -> InstanceKind;

    /// Stable id persisted as the selected instance
    fn id(&self) -> &str;

    /// Stream a plain completion into `target`.
    async fn generate_message(&self, target: &GenerationTarget, model: &str);

    /// Run a completion that may call `tools` before answering.
    async fn use_tools(&self, target: &GenerationTarget, model: &str, tools: &[Arc<dyn Tool>]);

    /// Release the backend (stop a managed server).
    fn stop(&self);

    fn get_default_model(&self) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{ui_channel, Role};

    #[test]
    fn test_kind_strings() {
        for kind in [
            InstanceKind::Empty,
            InstanceKind::Ollama,
            InstanceKind::OllamaManaged,
        ] {
            assert_eq!(kind.as_str().parse::<InstanceKind>().unwrap(), kind);
        }
        assert!(InstanceKind::OllamaManaged.is_ollama());
        assert!(!InstanceKind::Empty.is_ollama());
    }

    #[test]
    fn test_append_publishes_deltas() {
        let (tx, queue) = ui_channel();
        let target = GenerationTarget::new("chat", Message::placeholder("llama3"), vec![], tx);

        target.append("Hel");
        target.append("");
        target.append("lo");

        assert_eq!(target.snapshot().text, "Hello");
        let deltas: Vec<String> = queue
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                UiEvent::MessageDelta { text, .. } => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["Hel", "lo"]);
    }

    #[test]
    fn test_report_error_keeps_partial_text() {
        let (tx, queue) = ui_channel();
        let target = GenerationTarget::new("chat", Message::placeholder("llama3"), vec![], tx);
        target.append("partial");
        target.report_error("connection reset");

        let message = target.snapshot();
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.text, "partial\n\n**Error:** connection reset");
        assert!(queue
            .drain()
            .iter()
            .any(|e| matches!(e, UiEvent::MessageUpdated { .. })));
    }
}
