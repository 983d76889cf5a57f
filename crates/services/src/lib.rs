//! Local services behind the chat core: persistence, content extraction,
//! web and YouTube fetchers, speech recognition.

pub mod extract;
pub mod speech;
pub mod store;
pub mod web;
pub mod youtube;

pub use extract::{extract_content, ExtractError};
pub use store::SqlStore;
