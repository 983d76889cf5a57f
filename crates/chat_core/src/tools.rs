//! Tools offered to models during tool-augmented completion.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Local;
use serde_json::{json, Value};
use shared::Tool;
use std::sync::Arc;

/// Longest page text handed back to the model
const MAX_PAGE_CHARS: usize = 12_000;

/// Every built-in tool, in registration order.
pub fn builtin_tools() -> Vec<Arc<dyn Tool>> {
    vec![Arc::new(CurrentDateTime), Arc::new(FetchWebPage)]
}

/// Reports the local date and time.
pub struct CurrentDateTime;

#[async_trait]
impl Tool for CurrentDateTime {
    fn name(&self) -> &str {
        "get_current_datetime"
    }

    fn description(&self) -> &str {
        "Gets the current date and time of the user"
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {}, "required": [] })
    }

    async fn run(&self, _arguments: Value) -> Result<String> {
        Ok(Local::now().format("%A, %B %d %Y, %H:%M:%S %:z").to_string())
    }
}

/// Fetches a web page and returns its readable text.
pub struct FetchWebPage;

#[async_trait]
impl Tool for FetchWebPage {
    fn name(&self) -> &str {
        "fetch_web_page"
    }

    fn description(&self) -> &str {
        "Downloads a web page and returns its text content"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "Absolute http(s) URL of the page" }
            },
            "required": ["url"]
        })
    }

    async fn run(&self, arguments: Value) -> Result<String> {
        let url = arguments
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("missing 'url' argument"))?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(anyhow!("not a web address: {}", url));
        }

        tracing::info!("Tool fetching {}", url);
        let page = services::web::fetch_page(url).await?;
        let mut text = page.to_markdown();
        if text.chars().count() > MAX_PAGE_CHARS {
            text = text.chars().take(MAX_PAGE_CHARS).collect();
            text.push_str("\n\n[truncated]");
        }
        Ok(text)
    }
}
