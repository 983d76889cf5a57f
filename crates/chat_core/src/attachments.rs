//! Attachments waiting to be sent with the next message.

use parking_lot::Mutex;
use shared::{generate_numbered_name, Attachment, AttachmentType, UiEvent, UiSender};
use std::path::{Path, PathBuf};

pub struct AttachmentStore {
    pending: Mutex<Vec<Attachment>>,
    events: UiSender,
}

impl AttachmentStore {
    pub fn new(events: UiSender) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Extract `path` and add it under a unique display name. On failure
    /// nothing is added and the user is told.
    pub fn attach(&self, path: &Path, kind: AttachmentType) -> Option<String> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| kind.as_str().to_string());

        match services::extract_content(path, kind) {
            Ok(content) if !content.is_empty() => {
                Some(self.attach_content(&file_name, Some(path.to_path_buf()), kind, content))
            }
            Ok(_) => {
                tracing::warn!("{} has no extractable content", path.display());
                self.events.toast(format!("'{}' is empty", file_name));
                None
            }
            Err(e) => {
                tracing::warn!("Failed to attach {}: {}", path.display(), e);
                let message = match e {
                    services::ExtractError::Image(_) => "Cannot open image".to_string(),
                    other => format!("Cannot attach '{}': {}", file_name, other),
                };
                self.events.toast(message);
                None
            }
        }
    }

    /// Add already extracted content. Returns the display name used.
    pub fn attach_content(
        &self,
        name: &str,
        path: Option<PathBuf>,
        kind: AttachmentType,
        content: String,
    ) -> String {
        let (name, was_empty) = {
            let mut pending = self.pending.lock();
            let taken: Vec<&str> = pending.iter().map(|a| a.name.as_str()).collect();
            let name = generate_numbered_name(name, &taken);
            let was_empty = pending.is_empty();
            pending.push(Attachment::new(name.clone(), kind, content, path));
            (name, was_empty)
        };

        tracing::debug!("Attached {} as {}", name, kind);
        self.events.emit(UiEvent::AttachmentAdded {
            name: name.clone(),
            kind,
        });
        if was_empty {
            self.events.emit(UiEvent::AttachmentTrayVisible(true));
        }
        name
    }

    /// Drop a pending attachment. Returns false if there was none by that name.
    pub fn remove(&self, name: &str) -> bool {
        let now_empty = {
            let mut pending = self.pending.lock();
            let Some(index) = pending.iter().position(|a| a.name == name) else {
                return false;
            };
            pending.remove(index);
            pending.is_empty()
        };

        self.events.emit(UiEvent::AttachmentRemoved {
            name: name.to_string(),
        });
        if now_empty {
            self.events.emit(UiEvent::AttachmentTrayVisible(false));
        }
        true
    }

    /// Drain every pending attachment in insertion order.
    pub fn take_all(&self) -> Vec<Attachment> {
        let taken = std::mem::take(&mut *self.pending.lock());
        if !taken.is_empty() {
            self.events.emit(UiEvent::AttachmentTrayVisible(false));
        }
        taken
    }

    /// Put attachments taken for a failed send back in front of anything
    /// attached since.
    pub fn restore(&self, attachments: Vec<Attachment>) {
        if attachments.is_empty() {
            return;
        }
        let was_empty = {
            let mut pending = self.pending.lock();
            let was_empty = pending.is_empty();
            pending.splice(0..0, attachments);
            was_empty
        };
        if was_empty {
            self.events.emit(UiEvent::AttachmentTrayVisible(true));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// The tray is shown exactly when something is pending.
    pub fn is_visible(&self) -> bool {
        !self.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn names(&self) -> Vec<String> {
        self.pending.lock().iter().map(|a| a.name.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Attachment> {
        self.pending.lock().iter().find(|a| a.name == name).cloned()
    }
}
