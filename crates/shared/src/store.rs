//! Persistence contract for chats, messages, attachments and preferences.

use anyhow::Result;

use crate::chat::{Chat, Message};
use crate::preferences::PreferenceValue;

/// Chat-history database used by the orchestrator and settings bridge.
///
/// Implementations must be callable from worker threads.
pub trait ChatStore: Send + Sync {
    /// All chats, most recently active first
    fn get_chats(&self) -> Result<Vec<Chat>>;

    fn insert_chat(&self, chat: &Chat) -> Result<()>;

    fn rename_chat(&self, chat_id: &str, name: &str) -> Result<()>;

    /// Remove a chat together with its messages and attachments
    fn delete_chat(&self, chat_id: &str) -> Result<()>;

    /// Messages of a chat in timestamp order, attachments included
    fn get_messages(&self, chat_id: &str) -> Result<Vec<Message>>;

    /// Insert the message or overwrite its text and model. Attachments are
    /// only written by [`ChatStore::insert_messages`].
    fn insert_or_update_message(&self, message: &Message, chat_id: &str) -> Result<()>;

    /// Insert new messages with their attachments in one transaction.
    /// Nothing is written when any part fails.
    fn insert_messages(&self, messages: &[&Message], chat_id: &str) -> Result<()>;

    fn delete_message(&self, message_id: &str) -> Result<()>;

    fn get_preference(&self, key: &str) -> Result<Option<PreferenceValue>>;

    fn insert_or_update_preferences(&self, values: &[(&str, PreferenceValue)]) -> Result<()>;
}
