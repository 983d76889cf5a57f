//! Message send pipeline and chat management.
//!
//! A send validates preconditions, persists the user's message with its
//! attachments, then hands an assistant placeholder to the instance on a
//! worker thread. Each chat has one busy flag; only one generation runs per
//! chat at a time.

use anyhow::Result;
use futures::future::{AbortHandle, Abortable};
use parking_lot::{Mutex, RwLock};
use providers::{GenerationTarget, Instance, InstanceKind, ModelRegistry};
use shared::{
    generate_message_id, generate_numbered_name, Chat, ChatStore, Message, SendMode, ToastAction,
    Tool, UiEvent, UiSender,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::attachments::AttachmentStore;
use crate::settings::Settings;

pub const DEFAULT_CHAT_NAME: &str = "New Chat";
pub const QUICK_ASK_CHAT_ID: &str = "quick-ask";
pub const QUICK_ASK_NAME: &str = "Quick Ask";

/// Why a send did nothing
#[derive(Debug, thiserror::Error)]
pub enum SendRejection {
    #[error("message is empty")]
    EmptyText,
    #[error("chat is busy")]
    ChatBusy,
    #[error("no chat is selected")]
    NoChat,
    #[error("no instance is configured")]
    NoInstance,
    #[error("No tools enabled.")]
    NoToolsEnabled,
    #[error("'{0}' does not support tools.")]
    ToolsUnsupported(String),
    #[error("Please select a model before chatting")]
    NoModelSelected,
    #[error("could not save message: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Ids created by a successful send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub chat_id: String,
    pub message_id: String,
    /// Assistant placeholder, absent for system messages
    pub reply_id: Option<String>,
}

/// Busy flag and abort handle of one chat
#[derive(Default)]
struct ChatSlot {
    busy: AtomicBool,
    abort: Mutex<Option<AbortHandle>>,
    /// Set once the chat is deleted; held while a reply is saved
    removed: Mutex<bool>,
}

impl ChatSlot {
    fn try_claim(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.abort.lock().take();
        self.busy.store(false, Ordering::Release);
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn mark_removed(&self) {
        *self.removed.lock() = true;
    }

    fn abort(&self) -> bool {
        match self.abort.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

/// Where a finished reply is saved
#[derive(Clone)]
enum ReplySink {
    Store(Arc<dyn ChatStore>),
    Memory(Arc<Mutex<Vec<Message>>>),
}

impl ReplySink {
    fn save(&self, chat_id: &str, message: &Message) -> Result<()> {
        match self {
            ReplySink::Store(store) => store.insert_or_update_message(message, chat_id),
            ReplySink::Memory(messages) => {
                let mut messages = messages.lock();
                match messages.iter_mut().find(|m| m.id == message.id) {
                    Some(existing) => *existing = message.clone(),
                    None => messages.push(message.clone()),
                }
                Ok(())
            }
        }
    }
}

/// Everything a generation worker needs
struct Job {
    instance: Arc<dyn Instance>,
    target: GenerationTarget,
    model: String,
    tools: Option<Vec<Arc<dyn Tool>>>,
    slot: Arc<ChatSlot>,
    sink: ReplySink,
    events: UiSender,
}

/// Run a generation on its own thread. The busy flag is released before
/// `GenerationFinished` is published.
fn spawn_generation(job: Job) {
    let (abort_handle, abort_reg) = AbortHandle::new_pair();
    *job.slot.abort.lock() = Some(abort_handle);

    std::thread::spawn(move || {
        let Job {
            instance,
            target,
            model,
            tools,
            slot,
            sink,
            events,
        } = job;

        let stopped = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => {
                let result = rt.block_on(Abortable::new(
                    async {
                        match &tools {
                            Some(tools) => instance.use_tools(&target, &model, tools).await,
                            None => instance.generate_message(&target, &model).await,
                        }
                    },
                    abort_reg,
                ));
                result.is_err()
            }
            Err(e) => {
                target.report_error(&format!("Failed to start async runtime: {}", e));
                false
            }
        };

        let message = target.snapshot();
        if stopped {
            tracing::info!("Generation stopped in chat {}", target.chat_id);
        }
        {
            let removed = slot.removed.lock();
            if *removed {
                tracing::debug!("Chat {} was deleted, dropping reply", target.chat_id);
            } else if let Err(e) = sink.save(&target.chat_id, &message) {
                tracing::error!("Failed to save reply {}: {}", message.id, e);
                events.toast("Could not save the response");
            }
        }
        slot.release();

        events.emit(UiEvent::MessageUpdated {
            chat_id: target.chat_id.clone(),
            message: message.clone(),
        });
        events.emit(UiEvent::GenerationFinished {
            chat_id: target.chat_id.clone(),
            message_id: message.id,
            stopped,
        });
    });
}

/// Transient chat behind the quick-ask window
struct QuickChat {
    messages: Arc<Mutex<Vec<Message>>>,
    slot: Arc<ChatSlot>,
}

impl Default for QuickChat {
    fn default() -> Self {
        Self {
            messages: Arc::new(Mutex::new(Vec::new())),
            slot: Arc::new(ChatSlot::default()),
        }
    }
}

pub struct Orchestrator {
    store: Arc<dyn ChatStore>,
    registry: Arc<dyn ModelRegistry>,
    instance: RwLock<Arc<dyn Instance>>,
    attachments: Arc<AttachmentStore>,
    settings: Settings,
    events: UiSender,
    /// Chats, most recently used first
    chats: RwLock<Vec<Chat>>,
    current: RwLock<Option<String>>,
    slots: Mutex<HashMap<String, Arc<ChatSlot>>>,
    quick: Mutex<QuickChat>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ChatStore>,
        registry: Arc<dyn ModelRegistry>,
        instance: Arc<dyn Instance>,
        attachments: Arc<AttachmentStore>,
        events: UiSender,
    ) -> Self {
        Self {
            settings: Settings::new(Arc::clone(&store)),
            store,
            registry,
            instance: RwLock::new(instance),
            attachments,
            events,
            chats: RwLock::new(Vec::new()),
            current: RwLock::new(None),
            slots: Mutex::new(HashMap::new()),
            quick: Mutex::new(QuickChat::default()),
        }
    }

    pub fn instance(&self) -> Arc<dyn Instance> {
        Arc::clone(&self.instance.read())
    }

    /// Replace the active backend. The previous one is stopped.
    pub fn set_instance(&self, instance: Arc<dyn Instance>) -> Result<()> {
        let previous = std::mem::replace(&mut *self.instance.write(), Arc::clone(&instance));
        previous.stop();
        if instance.kind() != InstanceKind::Empty {
            self.settings.set_selected_instance(instance.id())?;
        }
        tracing::info!("Active instance is now {} ({})", instance.id(), instance.kind());
        Ok(())
    }

    pub fn attachments(&self) -> &Arc<AttachmentStore> {
        &self.attachments
    }

    fn slot(&self, chat_id: &str) -> Arc<ChatSlot> {
        Arc::clone(self.slots.lock().entry(chat_id.to_string()).or_default())
    }

    pub fn is_busy(&self, chat_id: &str) -> bool {
        self.slots
            .lock()
            .get(chat_id)
            .is_some_and(|slot| slot.is_busy())
    }

    /// Whether any chat still has a generation running.
    pub fn has_busy_chats(&self) -> bool {
        self.slots.lock().values().any(|slot| slot.is_busy()) || self.quick.lock().slot.is_busy()
    }

    pub fn current_chat_id(&self) -> Option<String> {
        self.current.read().clone()
    }

    pub fn chats(&self) -> Vec<Chat> {
        self.chats.read().clone()
    }

    fn chat_names(&self) -> Vec<String> {
        self.chats.read().iter().map(|c| c.name.clone()).collect()
    }

    /// Send the composer text. Rejections have no side effects beyond a
    /// user-facing event.
    pub fn send(&self, mode: SendMode, raw_text: &str) -> Result<SendReceipt, SendRejection> {
        if raw_text.is_empty() {
            return Err(SendRejection::EmptyText);
        }
        let chat_id = self.current_chat_id().ok_or(SendRejection::NoChat)?;
        let slot = self.slot(&chat_id);
        if slot.is_busy() {
            return Err(SendRejection::ChatBusy);
        }

        let instance = self.instance();
        if instance.kind() == InstanceKind::Empty {
            self.events.emit(UiEvent::OpenInstanceManager);
            return Err(SendRejection::NoInstance);
        }

        let tools = self.tools_for(mode)?;
        let model = self.registry.selected_model();
        if mode == SendMode::Tool && instance.kind().is_ollama() {
            if let Some(model) = model.as_ref().filter(|m| !m.tools) {
                let display = model.display_name();
                self.events.toast_with_action(
                    format!("'{}' does not support tools.", display),
                    ToastAction::OpenModelManager,
                );
                return Err(SendRejection::ToolsUnsupported(display));
            }
        }
        let Some(model) = model else {
            self.events.toast("Please select a model before chatting");
            return Err(SendRejection::NoModelSelected);
        };

        if !slot.try_claim() {
            return Err(SendRejection::ChatBusy);
        }

        match self.dispatch(mode, raw_text, &chat_id, &slot, instance, &model.name, tools) {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                tracing::error!("Send failed in chat {}: {}", chat_id, e);
                slot.release();
                self.events.toast("Could not save the message");
                Err(SendRejection::Storage(e))
            }
        }
    }

    /// Enabled tools for a tool send, `None` otherwise.
    fn tools_for(&self, mode: SendMode) -> Result<Option<Vec<Arc<dyn Tool>>>, SendRejection> {
        if mode != SendMode::Tool {
            return Ok(None);
        }
        let tools = self.registry.enabled_tools();
        if tools.is_empty() {
            self.events
                .toast_with_action("No tools enabled.", ToastAction::OpenToolManager);
            return Err(SendRejection::NoToolsEnabled);
        }
        Ok(Some(tools))
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        mode: SendMode,
        raw_text: &str,
        chat_id: &str,
        slot: &Arc<ChatSlot>,
        instance: Arc<dyn Instance>,
        model: &str,
        tools: Option<Vec<Arc<dyn Tool>>>,
    ) -> Result<SendReceipt> {
        let history = self.store.get_messages(chat_id)?;
        let mut message = Message::new(mode.author_role(), raw_text);
        message.attachments = self.attachments.take_all();
        let placeholder = mode.expects_reply().then(|| Message::placeholder(model));

        let saved = {
            let mut batch = vec![&message];
            batch.extend(placeholder.as_ref());
            self.store.insert_messages(&batch, chat_id)
        };
        if let Err(e) = saved {
            self.attachments
                .restore(std::mem::take(&mut message.attachments));
            return Err(e);
        }

        self.move_to_top(chat_id);
        self.events.emit(UiEvent::InputCleared);
        self.events.emit(UiEvent::MessageAdded {
            chat_id: chat_id.to_string(),
            message: message.clone(),
            responding: false,
        });

        let mut receipt = SendReceipt {
            chat_id: chat_id.to_string(),
            message_id: message.id.clone(),
            reply_id: None,
        };

        let Some(placeholder) = placeholder else {
            self.events.emit(UiEvent::ChatContentVisible {
                chat_id: chat_id.to_string(),
            });
            slot.release();
            return Ok(receipt);
        };

        self.events.emit(UiEvent::MessageAdded {
            chat_id: chat_id.to_string(),
            message: placeholder.clone(),
            responding: true,
        });
        receipt.reply_id = Some(placeholder.id.clone());

        let mut history = history;
        history.push(message);
        spawn_generation(Job {
            instance,
            target: GenerationTarget::new(chat_id, placeholder, history, self.events.clone()),
            model: model.to_string(),
            tools,
            slot: Arc::clone(slot),
            sink: ReplySink::Store(Arc::clone(&self.store)),
            events: self.events.clone(),
        });

        Ok(receipt)
    }

    /// Abort the current chat's generation. No-op when idle.
    pub fn stop(&self) -> bool {
        match self.current_chat_id() {
            Some(chat_id) => self.stop_chat(&chat_id),
            None => false,
        }
    }

    pub fn stop_chat(&self, chat_id: &str) -> bool {
        let slot = self.slots.lock().get(chat_id).cloned();
        slot.is_some_and(|slot| slot.abort())
    }

    fn move_to_top(&self, chat_id: &str) {
        let mut chats = self.chats.write();
        if let Some(index) = chats.iter().position(|c| c.id == chat_id) {
            if index > 0 {
                let chat = chats.remove(index);
                chats.insert(0, chat);
            }
        }
        drop(chats);
        self.events.emit(UiEvent::ChatMovedToTop {
            chat_id: chat_id.to_string(),
        });
    }

    /// Load chats from the store and select the remembered one, or the most
    /// recent. An empty history gets a fresh chat.
    pub fn load_history(&self) -> Result<()> {
        let chats = self.store.get_chats()?;
        tracing::debug!("Loading {} chats", chats.len());
        if chats.is_empty() {
            self.new_chat(DEFAULT_CHAT_NAME)?;
            return Ok(());
        }

        let selected = self
            .settings
            .selected_chat()
            .filter(|id| chats.iter().any(|c| &c.id == id))
            .unwrap_or_else(|| chats[0].id.clone());

        *self.chats.write() = chats.clone();
        for chat in chats {
            self.events.emit(UiEvent::ChatAdded { chat });
        }
        self.select_chat(&selected)
    }

    pub fn select_chat(&self, chat_id: &str) -> Result<()> {
        if !self.chats.read().iter().any(|c| c.id == chat_id) {
            anyhow::bail!("unknown chat: {}", chat_id);
        }
        *self.current.write() = Some(chat_id.to_string());
        self.events.emit(UiEvent::ChatSelected {
            chat_id: chat_id.to_string(),
        });
        Ok(())
    }

    /// Create and select a chat. Taken names are numbered.
    pub fn new_chat(&self, name: &str) -> Result<Chat> {
        let chat = Chat::new(generate_numbered_name(name, &self.chat_names()));
        self.store.insert_chat(&chat)?;
        self.chats.write().insert(0, chat.clone());
        self.events.emit(UiEvent::ChatAdded { chat: chat.clone() });
        self.select_chat(&chat.id)?;
        Ok(chat)
    }

    /// Rename a chat, numbering the new name if another chat has it.
    pub fn rename_chat(&self, chat_id: &str, new_name: &str) -> Result<String> {
        let others: Vec<String> = self
            .chats
            .read()
            .iter()
            .filter(|c| c.id != chat_id)
            .map(|c| c.name.clone())
            .collect();
        let name = generate_numbered_name(new_name, &others);

        self.store.rename_chat(chat_id, &name)?;
        if let Some(chat) = self.chats.write().iter_mut().find(|c| c.id == chat_id) {
            chat.name = name.clone();
        }
        self.events.emit(UiEvent::ChatRenamed {
            chat_id: chat_id.to_string(),
            name: name.clone(),
        });
        Ok(name)
    }

    /// Copy a chat with all of its messages into `"<name> copy"`.
    pub fn duplicate_chat(&self, chat_id: &str) -> Result<Chat> {
        let source = self
            .chats
            .read()
            .iter()
            .find(|c| c.id == chat_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown chat: {}", chat_id))?;
        let messages = self.store.get_messages(chat_id)?;
        let name = generate_numbered_name(&format!("{} copy", source.name), &self.chat_names());
        self.copy_into_new_chat(&name, messages)
    }

    fn copy_into_new_chat(&self, name: &str, messages: Vec<Message>) -> Result<Chat> {
        let chat = Chat::new(name);
        self.store.insert_chat(&chat)?;
        let messages: Vec<Message> = messages
            .into_iter()
            .map(|mut message| {
                message.id = generate_message_id();
                message
            })
            .collect();
        let batch: Vec<&Message> = messages.iter().collect();
        if let Err(e) = self.store.insert_messages(&batch, &chat.id) {
            let _ = self.store.delete_chat(&chat.id);
            return Err(e);
        }
        self.chats.write().insert(0, chat.clone());
        self.events.emit(UiEvent::ChatAdded { chat: chat.clone() });
        Ok(chat)
    }

    /// Delete a chat and everything in it. If it was selected, the next chat
    /// is selected, or a new one is created.
    pub fn delete_chat(&self, chat_id: &str) -> Result<()> {
        let slot = self.slots.lock().remove(chat_id);
        if let Some(slot) = slot {
            slot.mark_removed();
            slot.abort();
        }
        self.store.delete_chat(chat_id)?;
        self.chats.write().retain(|c| c.id != chat_id);
        self.events.emit(UiEvent::ChatDeleted {
            chat_id: chat_id.to_string(),
        });

        if self.current_chat_id().as_deref() == Some(chat_id) {
            *self.current.write() = None;
            let next = self.chats.read().first().map(|c| c.id.clone());
            match next {
                Some(next) => self.select_chat(&next)?,
                None => {
                    self.new_chat(DEFAULT_CHAT_NAME)?;
                }
            }
        }
        Ok(())
    }

    pub fn messages(&self, chat_id: &str) -> Result<Vec<Message>> {
        self.store.get_messages(chat_id)
    }

    pub fn delete_message(&self, chat_id: &str, message_id: &str) -> Result<()> {
        self.store.delete_message(message_id)?;
        self.events.emit(UiEvent::MessageDeleted {
            chat_id: chat_id.to_string(),
            message_id: message_id.to_string(),
        });
        Ok(())
    }

    /// Ids of messages whose text matches `term`, case-insensitively. A term
    /// that is not a valid regex is matched literally.
    pub fn search_messages(&self, chat_id: &str, term: &str) -> Result<Vec<String>> {
        let pattern = regex::RegexBuilder::new(term)
            .case_insensitive(true)
            .build()
            .or_else(|_| {
                regex::RegexBuilder::new(&regex::escape(term))
                    .case_insensitive(true)
                    .build()
            })?;
        Ok(self
            .store
            .get_messages(chat_id)?
            .into_iter()
            .filter(|m| !m.text.is_empty() && pattern.is_match(&m.text))
            .map(|m| m.id)
            .collect())
    }

    /// Send into the transient quick-ask chat using the instance's default
    /// model. Nothing is persisted until [`Orchestrator::save_quick_ask`].
    pub fn quick_ask(&self, text: &str, mode: SendMode) -> Result<SendReceipt, SendRejection> {
        if text.is_empty() {
            return Err(SendRejection::EmptyText);
        }
        let instance = self.instance();
        let Some(model) = instance.get_default_model() else {
            self.events.toast("Please select a model before chatting");
            return Err(SendRejection::NoModelSelected);
        };
        let tools = self.tools_for(mode)?;

        let (messages, slot) = {
            let quick = self.quick.lock();
            (Arc::clone(&quick.messages), Arc::clone(&quick.slot))
        };
        if !slot.try_claim() {
            return Err(SendRejection::ChatBusy);
        }

        let message = Message::new(mode.author_role(), text);
        messages.lock().push(message.clone());
        self.events.emit(UiEvent::MessageAdded {
            chat_id: QUICK_ASK_CHAT_ID.to_string(),
            message: message.clone(),
            responding: false,
        });

        let mut receipt = SendReceipt {
            chat_id: QUICK_ASK_CHAT_ID.to_string(),
            message_id: message.id,
            reply_id: None,
        };
        if !mode.expects_reply() {
            slot.release();
            return Ok(receipt);
        }

        let placeholder = Message::placeholder(&model);
        let history = {
            let mut messages = messages.lock();
            let history = messages.clone();
            messages.push(placeholder.clone());
            history
        };
        self.events.emit(UiEvent::MessageAdded {
            chat_id: QUICK_ASK_CHAT_ID.to_string(),
            message: placeholder.clone(),
            responding: true,
        });
        receipt.reply_id = Some(placeholder.id.clone());

        spawn_generation(Job {
            instance,
            target: GenerationTarget::new(QUICK_ASK_CHAT_ID, placeholder, history, self.events.clone()),
            model,
            tools,
            slot,
            sink: ReplySink::Memory(messages),
            events: self.events.clone(),
        });
        Ok(receipt)
    }

    pub fn quick_ask_messages(&self) -> Vec<Message> {
        self.quick.lock().messages.lock().clone()
    }

    /// Persist the quick-ask conversation as a new chat and start a fresh
    /// one. Returns `None` when there is nothing to save.
    pub fn save_quick_ask(&self) -> Result<Option<Chat>> {
        let messages = {
            let mut quick = self.quick.lock();
            if quick.slot.is_busy() {
                anyhow::bail!("quick ask is still responding");
            }
            let messages = quick.messages.lock().clone();
            if messages.is_empty() {
                return Ok(None);
            }
            *quick = QuickChat::default();
            messages
        };

        let name = generate_numbered_name(QUICK_ASK_NAME, &self.chat_names());
        let chat = self.copy_into_new_chat(&name, messages)?;
        self.select_chat(&chat.id)?;
        Ok(Some(chat))
    }

    /// Remember the selected chat, abort running generations and release
    /// the backend.
    pub fn shutdown(&self) -> Result<()> {
        if let Some(chat_id) = self.current_chat_id() {
            self.settings.set_selected_chat(&chat_id)?;
        }
        for slot in self.slots.lock().values() {
            slot.abort();
        }
        self.quick.lock().slot.abort();
        self.instance().stop();
        tracing::info!("Chat core shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_for, ScriptedInstance};
    use providers::{EmptyInstance, ModelCatalog, ModelInfo};
    use services::SqlStore;
    use shared::{ui_channel, AttachmentType, Role, UiQueue};
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        catalog: Arc<ModelCatalog>,
        store: Arc<SqlStore>,
        queue: UiQueue,
    }

    fn harness(instance: Arc<dyn Instance>) -> Harness {
        let (tx, queue) = ui_channel();
        let store = Arc::new(SqlStore::open_in_memory().unwrap());
        let catalog = Arc::new(ModelCatalog::new());
        catalog.set_models(vec![ModelInfo {
            name: "llama3.2:3b".into(),
            vision: false,
            tools: false,
        }]);
        let attachments = Arc::new(AttachmentStore::new(tx.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            catalog.clone(),
            instance,
            attachments,
            tx,
        ));
        orchestrator.load_history().unwrap();
        queue.drain();
        Harness {
            orchestrator,
            catalog,
            store,
            queue,
        }
    }

    fn finished(queue: &UiQueue) -> UiEvent {
        wait_for(queue, |e| matches!(e, UiEvent::GenerationFinished { .. }))
            .expect("generation should finish")
    }

    #[test]
    fn test_empty_text_is_a_no_op() {
        let h = harness(Arc::new(ScriptedInstance::replying("hi")));
        let chat_id = h.orchestrator.current_chat_id().unwrap();

        let err = h.orchestrator.send(SendMode::User, "").unwrap_err();
        assert!(matches!(err, SendRejection::EmptyText));
        assert!(h.queue.drain().is_empty());
        assert!(h.store.get_messages(&chat_id).unwrap().is_empty());
    }

    #[test]
    fn test_send_streams_and_persists_reply() {
        let h = harness(Arc::new(ScriptedInstance::replying("Hello!")));
        let chat_id = h.orchestrator.current_chat_id().unwrap();

        let receipt = h.orchestrator.send(SendMode::User, "Hi").unwrap();
        let reply_id = receipt.reply_id.clone().unwrap();
        match finished(&h.queue) {
            UiEvent::GenerationFinished {
                message_id,
                stopped,
                ..
            } => {
                assert_eq!(message_id, reply_id);
                assert!(!stopped);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let messages = h.store.get_messages(&chat_id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].text, "Hi");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].model_name.as_deref(), Some("llama3.2:3b"));
        assert_eq!(messages[1].text, "Hello!");
        assert!(!h.orchestrator.is_busy(&chat_id));
    }

    #[test]
    fn test_busy_chat_rejects_second_send_until_stopped() {
        let h = harness(Arc::new(ScriptedInstance::hanging()));
        let chat_id = h.orchestrator.current_chat_id().unwrap();

        h.orchestrator.send(SendMode::User, "first").unwrap();
        assert!(h.orchestrator.is_busy(&chat_id));
        let before = h.store.get_messages(&chat_id).unwrap().len();

        let err = h.orchestrator.send(SendMode::User, "second").unwrap_err();
        assert!(matches!(err, SendRejection::ChatBusy));
        assert_eq!(h.store.get_messages(&chat_id).unwrap().len(), before);

        assert!(h.orchestrator.stop());
        match finished(&h.queue) {
            UiEvent::GenerationFinished { stopped, .. } => assert!(stopped),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!h.orchestrator.is_busy(&chat_id));
        assert!(!h.orchestrator.stop());
    }

    #[test]
    fn test_empty_instance_opens_instance_manager() {
        let h = harness(Arc::new(EmptyInstance));
        let err = h.orchestrator.send(SendMode::User, "hi").unwrap_err();
        assert!(matches!(err, SendRejection::NoInstance));
        assert_eq!(h.queue.drain(), vec![UiEvent::OpenInstanceManager]);
    }

    #[test]
    fn test_tool_send_requires_enabled_tools_then_capable_model() {
        let h = harness(Arc::new(ScriptedInstance::replying("hi")));
        let err = h.orchestrator.send(SendMode::Tool, "what time is it").unwrap_err();
        assert!(matches!(err, SendRejection::NoToolsEnabled));

        h.catalog
            .register_tool(Arc::new(crate::tools::CurrentDateTime), true);
        let err = h.orchestrator.send(SendMode::Tool, "what time is it").unwrap_err();
        match err {
            SendRejection::ToolsUnsupported(name) => assert_eq!(name, "Llama3.2 (3B)"),
            other => panic!("unexpected rejection {other:?}"),
        }
        let toasts: Vec<String> = h
            .queue
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                UiEvent::Toast { message, .. } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(
            toasts,
            vec!["No tools enabled.", "'Llama3.2 (3B)' does not support tools."]
        );
    }

    #[test]
    fn test_no_model_selected() {
        let h = harness(Arc::new(ScriptedInstance::replying("hi")));
        h.catalog.set_models(Vec::new());
        let err = h.orchestrator.send(SendMode::User, "hi").unwrap_err();
        assert!(matches!(err, SendRejection::NoModelSelected));
    }

    #[test]
    fn test_system_message_needs_no_reply() {
        let instance = Arc::new(ScriptedInstance::replying("unused"));
        let h = harness(instance.clone());
        let chat_id = h.orchestrator.current_chat_id().unwrap();

        let receipt = h.orchestrator.send(SendMode::System, "Be brief").unwrap();
        assert_eq!(receipt.reply_id, None);
        assert!(!h.orchestrator.is_busy(&chat_id));

        let messages = h.store.get_messages(&chat_id).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::System);
        assert!(h
            .queue
            .drain()
            .contains(&UiEvent::ChatContentVisible { chat_id }));
        assert_eq!(instance.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pending_attachments_bind_to_message() {
        let h = harness(Arc::new(ScriptedInstance::replying("ok")));
        let chat_id = h.orchestrator.current_chat_id().unwrap();
        h.orchestrator.attachments().attach_content(
            "notes.txt",
            None,
            AttachmentType::PlainText,
            "milk".into(),
        );

        h.orchestrator.send(SendMode::User, "read this").unwrap();
        finished(&h.queue);

        assert!(h.orchestrator.attachments().is_empty());
        let messages = h.store.get_messages(&chat_id).unwrap();
        assert_eq!(messages[0].attachments.len(), 1);
        assert_eq!(messages[0].attachments[0].name, "notes.txt");
    }

    fn until_finished(queue: &UiQueue) -> Vec<UiEvent> {
        let mut events = Vec::new();
        while let Some(event) = queue.next_timeout(std::time::Duration::from_secs(5)) {
            let done = matches!(event, UiEvent::GenerationFinished { .. });
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    #[test]
    fn test_failed_save_keeps_pending_attachments() {
        let h = harness(Arc::new(ScriptedInstance::replying("ok")));
        let chat_id = h.orchestrator.current_chat_id().unwrap();
        h.orchestrator.attachments().attach_content(
            "notes.txt",
            None,
            AttachmentType::PlainText,
            "milk".into(),
        );
        h.store.delete_chat(&chat_id).unwrap();
        h.queue.drain();

        let err = h.orchestrator.send(SendMode::User, "read this").unwrap_err();
        assert!(matches!(err, SendRejection::Storage(_)));
        assert_eq!(h.orchestrator.attachments().names(), vec!["notes.txt"]);
        assert!(!h.orchestrator.is_busy(&chat_id));
        assert!(h.store.get_messages(&chat_id).unwrap().is_empty());

        let events = h.queue.drain();
        assert!(!events.contains(&UiEvent::InputCleared));
        assert!(!events
            .iter()
            .any(|e| matches!(e, UiEvent::MessageAdded { .. })));
    }

    #[test]
    fn test_deleting_busy_chat_drops_reply_quietly() {
        let h = harness(Arc::new(ScriptedInstance::hanging()));
        let chat_id = h.orchestrator.current_chat_id().unwrap();
        h.orchestrator.send(SendMode::User, "long answer please").unwrap();
        assert!(h.orchestrator.has_busy_chats());

        h.orchestrator.delete_chat(&chat_id).unwrap();
        let events = until_finished(&h.queue);
        assert!(matches!(
            events.last(),
            Some(UiEvent::GenerationFinished { stopped: true, .. })
        ));
        assert!(!events.iter().any(|e| matches!(e, UiEvent::Toast { .. })));
        assert!(!h.orchestrator.has_busy_chats());
    }

    #[test]
    fn test_has_busy_chats_covers_quick_ask() {
        let h = harness(Arc::new(
            ScriptedInstance::hanging().with_default_model("llama3.2:3b"),
        ));
        assert!(!h.orchestrator.has_busy_chats());

        h.orchestrator.quick_ask("still there?", SendMode::User).unwrap();
        assert!(h.orchestrator.has_busy_chats());

        h.orchestrator.shutdown().unwrap();
        finished(&h.queue);
        assert!(!h.orchestrator.has_busy_chats());
    }

    #[test]
    fn test_chat_management() {
        let h = harness(Arc::new(ScriptedInstance::replying("ok")));
        let first = h.orchestrator.current_chat_id().unwrap();
        assert_eq!(h.orchestrator.chats()[0].name, "New Chat");

        let second = h.orchestrator.new_chat("New Chat").unwrap();
        assert_eq!(second.name, "New Chat 1");
        assert_eq!(h.orchestrator.current_chat_id(), Some(second.id.clone()));

        assert_eq!(h.orchestrator.rename_chat(&second.id, "New Chat").unwrap(), "New Chat 1");
        assert_eq!(h.orchestrator.rename_chat(&second.id, "Plans").unwrap(), "Plans");

        h.orchestrator.select_chat(&first).unwrap();
        h.orchestrator.send(SendMode::User, "hello").unwrap();
        finished(&h.queue);
        let copy = h.orchestrator.duplicate_chat(&first).unwrap();
        assert_eq!(copy.name, "New Chat copy");
        assert_eq!(h.store.get_messages(&copy.id).unwrap().len(), 2);

        h.orchestrator.delete_chat(&first).unwrap();
        assert!(h.store.get_messages(&first).unwrap().is_empty());
        assert!(!h.orchestrator.chats().iter().any(|c| c.id == first));
        assert!(h.orchestrator.current_chat_id().is_some());
    }

    #[test]
    fn test_search_falls_back_to_literal() {
        let h = harness(Arc::new(ScriptedInstance::replying("Price is $5 (approx)")));
        let chat_id = h.orchestrator.current_chat_id().unwrap();
        h.orchestrator.send(SendMode::User, "how much?").unwrap();
        finished(&h.queue);

        assert_eq!(h.orchestrator.search_messages(&chat_id, "PRICE").unwrap().len(), 1);
        assert_eq!(h.orchestrator.search_messages(&chat_id, "(approx").unwrap().len(), 1);
        assert_eq!(h.orchestrator.search_messages(&chat_id, "h.w").unwrap().len(), 1);
        assert!(h.orchestrator.search_messages(&chat_id, "nothing").unwrap().is_empty());
    }

    #[test]
    fn test_shutdown_remembers_selected_chat() {
        let instance = Arc::new(ScriptedInstance::replying("ok"));
        let h = harness(instance.clone());
        let chat = h.orchestrator.new_chat("Later").unwrap();
        h.orchestrator.shutdown().unwrap();

        assert!(instance.stopped.load(Ordering::SeqCst));
        assert_eq!(
            Settings::new(h.store.clone()).selected_chat(),
            Some(chat.id)
        );
    }

    #[test]
    fn test_quick_ask_then_save() {
        let h = harness(Arc::new(
            ScriptedInstance::replying("42").with_default_model("llama3.2:3b"),
        ));
        h.orchestrator.quick_ask("meaning of life?", SendMode::User).unwrap();
        finished(&h.queue);

        let transient = h.orchestrator.quick_ask_messages();
        assert_eq!(transient.len(), 2);
        assert_eq!(transient[1].text, "42");

        let chat = h.orchestrator.save_quick_ask().unwrap().unwrap();
        assert_eq!(chat.name, "Quick Ask");
        assert_eq!(h.store.get_messages(&chat.id).unwrap().len(), 2);
        assert!(h.orchestrator.quick_ask_messages().is_empty());
        assert!(h.orchestrator.save_quick_ask().unwrap().is_none());
    }

    #[test]
    fn test_quick_ask_needs_default_model() {
        let h = harness(Arc::new(ScriptedInstance::replying("x")));
        let err = h.orchestrator.quick_ask("hi", SendMode::User).unwrap_err();
        assert!(matches!(err, SendRejection::NoModelSelected));
    }

    #[test]
    fn test_concurrent_sends_claim_once() {
        let h = harness(Arc::new(ScriptedInstance::hanging()));
        let accepted = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let orchestrator = Arc::clone(&h.orchestrator);
                let accepted = Arc::clone(&accepted);
                std::thread::spawn(move || {
                    if orchestrator.send(SendMode::User, &format!("msg {i}")).is_ok() {
                        accepted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        h.orchestrator.stop();
        assert!(wait_for(&h.queue, |e| matches!(e, UiEvent::GenerationFinished { .. })).is_some());
    }
}
