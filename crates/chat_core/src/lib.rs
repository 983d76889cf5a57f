//! Chat core: attachments, message orchestration, input classification,
//! speech input and settings, wired together by explicit injection.

pub mod attachments;
pub mod classifier;
pub mod config;
pub mod export;
pub mod orchestrator;
pub mod settings;
pub mod speech;
pub mod tools;

pub use attachments::AttachmentStore;
pub use classifier::{classify_text, Classifier, MediaFetcher, PastedText, VideoInfo, WebFetcher};
pub use config::CoreConfig;
pub use orchestrator::{Orchestrator, SendReceipt, SendRejection};
pub use settings::Settings;
pub use speech::{ComposerSink, SpeechError, SpeechPipeline, TranscriptSink, WhisperLoader};
