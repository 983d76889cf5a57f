//! Events published by worker threads for the UI-owning thread.
//!
//! Workers never touch UI state. They send a [`UiEvent`] through a
//! [`UiSender`] and the UI thread drains its [`UiQueue`] each frame.

use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use crate::attachment::AttachmentType;
use crate::chat::{Chat, Message};

/// Optional button shown next to a toast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToastAction {
    OpenToolManager,
    OpenModelManager,
}

/// Speech pipeline state as shown on the microphone button
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpeechState {
    Idle,
    Loading,
    Listening,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UiEvent {
    /// Dismissible notice
    Toast {
        message: String,
        action: Option<ToastAction>,
    },
    /// Blocking error report (device or model failures)
    ErrorDialog { title: String, message: String },
    /// No backend is configured; show instance setup
    OpenInstanceManager,

    ChatAdded { chat: Chat },
    ChatRenamed { chat_id: String, name: String },
    ChatDeleted { chat_id: String },
    ChatSelected { chat_id: String },
    ChatMovedToTop { chat_id: String },
    /// Leave the welcome screen and show the message list
    ChatContentVisible { chat_id: String },

    /// The composer buffer was consumed by a send
    InputCleared,
    /// Enable or disable the composer while a lookup is running
    ComposerSensitive(bool),

    MessageAdded {
        chat_id: String,
        message: Message,
        /// Response controls stay disabled until generation finishes
        responding: bool,
    },
    /// Streamed text appended to an assistant message
    MessageDelta {
        chat_id: String,
        message_id: String,
        text: String,
    },
    MessageUpdated { chat_id: String, message: Message },
    MessageDeleted { chat_id: String, message_id: String },
    GenerationFinished {
        chat_id: String,
        message_id: String,
        stopped: bool,
    },

    AttachmentAdded { name: String, kind: AttachmentType },
    AttachmentRemoved { name: String },
    AttachmentTrayVisible(bool),

    /// Ask the user which caption track to attach
    ChooseTranscript {
        video_id: String,
        title: String,
        author: String,
        url: String,
        tracks: Vec<String>,
    },
    /// Ask before fetching and attaching a web page
    ConfirmWebsite { url: String },

    SpeechStateChanged(SpeechState),
    ConfirmSpeechModelDownload { model: String, size_hint: String },
    SpeechModelProgress {
        model: String,
        downloaded: u64,
        total: Option<u64>,
    },
    /// Insert recognized speech into the composer at `position`
    TranscriptInsert { position: usize, text: String },
    /// Speech auto-send fired
    SendRequested,

    PowersaverBanner(bool),
}

/// Cloneable handle used by workers to publish events
#[derive(Debug, Clone)]
pub struct UiSender {
    tx: Sender<UiEvent>,
}

impl UiSender {
    /// Publish an event. A closed queue means the UI is gone, so the
    /// event is dropped.
    pub fn emit(&self, event: UiEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("ui queue closed, dropping event");
        }
    }

    pub fn toast(&self, message: impl Into<String>) {
        self.emit(UiEvent::Toast {
            message: message.into(),
            action: None,
        });
    }

    pub fn toast_with_action(&self, message: impl Into<String>, action: ToastAction) {
        self.emit(UiEvent::Toast {
            message: message.into(),
            action: Some(action),
        });
    }

    pub fn error_dialog(&self, title: impl Into<String>, message: impl Into<String>) {
        self.emit(UiEvent::ErrorDialog {
            title: title.into(),
            message: message.into(),
        });
    }
}

/// Receiving end, owned by the UI thread
#[derive(Debug)]
pub struct UiQueue {
    rx: Receiver<UiEvent>,
}

impl UiQueue {
    /// Take every event currently queued without blocking.
    pub fn drain(&self) -> Vec<UiEvent> {
        self.rx.try_iter().collect()
    }

    /// Wait up to `timeout` for the next event.
    pub fn next_timeout(&self, timeout: Duration) -> Option<UiEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

/// Create a connected sender/queue pair.
pub fn ui_channel() -> (UiSender, UiQueue) {
    let (tx, rx) = mpsc::channel();
    (UiSender { tx }, UiQueue { rx })
}
