//! LLM backends: the instance contract, the Ollama client and the model
//! catalog.

pub mod catalog;
pub mod empty;
pub mod instance;
pub mod ollama;
pub mod server;

pub use catalog::{display_name, model_name_from_display, ModelCatalog, ModelInfo, ModelRegistry};
pub use empty::EmptyInstance;
pub use instance::{GenerationTarget, Instance, InstanceKind};
pub use ollama::OllamaInstance;
