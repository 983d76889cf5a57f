pub mod attachment;
pub mod chat;
pub mod events;
pub mod naming;
pub mod preferences;
pub mod store;
pub mod tool;

pub use attachment::{Attachment, AttachmentType};
pub use chat::{generate_message_id, Chat, Message, Role, SendMode};
pub use events::{ui_channel, SpeechState, ToastAction, UiEvent, UiQueue, UiSender};
pub use naming::generate_numbered_name;
pub use preferences::PreferenceValue;
pub use store::ChatStore;
pub use tool::{Tool, ToolDefinition};
