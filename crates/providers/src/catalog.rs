//! Installed models, the current selection and the enabled tool set.

use parking_lot::RwLock;
use shared::Tool;
use std::sync::Arc;

use crate::ollama::OllamaInstance;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    /// Backend name, e.g. `llama3.2:3b`
    pub name: String,
    pub vision: bool,
    pub tools: bool,
}

impl ModelInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vision: false,
            tools: false,
        }
    }

    pub fn from_capabilities(name: impl Into<String>, capabilities: &[String]) -> Self {
        Self {
            name: name.into(),
            vision: capabilities.iter().any(|c| c == "vision"),
            tools: capabilities.iter().any(|c| c == "tools"),
        }
    }

    pub fn display_name(&self) -> String {
        display_name(&self.name)
    }
}

/// What the send path needs to know about models and tools.
pub trait ModelRegistry: Send + Sync {
    fn selected_model(&self) -> Option<ModelInfo>;

    fn enabled_tools(&self) -> Vec<Arc<dyn Tool>>;
}

/// In-memory registry filled from the active instance
#[derive(Default)]
pub struct ModelCatalog {
    models: RwLock<Vec<ModelInfo>>,
    selected: RwLock<Option<String>>,
    tools: RwLock<Vec<(Arc<dyn Tool>, bool)>>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_models(&self, models: Vec<ModelInfo>) {
        let mut selected = self.selected.write();
        let still_installed = selected
            .as_ref()
            .is_some_and(|name| models.iter().any(|m| &m.name == name));
        if !still_installed {
            *selected = models.first().map(|m| m.name.clone());
        }
        *self.models.write() = models;
    }

    pub fn models(&self) -> Vec<ModelInfo> {
        self.models.read().clone()
    }

    /// Select an installed model by backend name. Returns false if unknown.
    pub fn select(&self, name: &str) -> bool {
        if self.models.read().iter().any(|m| m.name == name) {
            *self.selected.write() = Some(name.to_string());
            true
        } else {
            false
        }
    }

    pub fn find(&self, name: &str) -> Option<ModelInfo> {
        self.models.read().iter().find(|m| m.name == name).cloned()
    }

    /// Reload the model list from an Ollama instance.
    pub async fn refresh(&self, instance: &OllamaInstance) -> anyhow::Result<()> {
        let models = instance.list_models().await?;
        tracing::info!("Found {} models", models.len());
        self.set_models(models);
        Ok(())
    }

    pub fn register_tool(&self, tool: Arc<dyn Tool>, enabled: bool) {
        let mut tools = self.tools.write();
        tools.retain(|(t, _)| t.name() != tool.name());
        tools.push((tool, enabled));
    }

    /// Enable or disable a registered tool. Returns false if unknown.
    pub fn set_tool_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut tools = self.tools.write();
        match tools.iter_mut().find(|(t, _)| t.name() == name) {
            Some(entry) => {
                entry.1 = enabled;
                true
            }
            None => false,
        }
    }

    /// Registered tool names with their enabled flag.
    pub fn tools(&self) -> Vec<(String, bool)> {
        self.tools
            .read()
            .iter()
            .map(|(t, enabled)| (t.name().to_string(), *enabled))
            .collect()
    }
}

impl ModelRegistry for ModelCatalog {
    fn selected_model(&self) -> Option<ModelInfo> {
        let selected = self.selected.read();
        let name = selected.as_deref()?;
        self.find(name)
    }

    fn enabled_tools(&self) -> Vec<Arc<dyn Tool>> {
        self.tools
            .read()
            .iter()
            .filter(|(_, enabled)| *enabled)
            .map(|(t, _)| Arc::clone(t))
            .collect()
    }
}

/// Capitalize the first letter of every run of letters, lowercase the rest.
fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_alpha = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}

/// Split a backend name into display name and display tag:
/// `llama3.2:3b` → `("Llama3.2", Some("3B"))`.
pub fn display_parts(name: &str) -> (String, Option<String>) {
    let mut parts = name.split(':');
    let base = title_case(&parts.next().unwrap_or_default().replace('-', " "));
    let tag = parts.next().map(|t| title_case(&t.replace('-', " ")));
    (base, tag)
}

/// `llama3.2:3b` → `Llama3.2 (3B)`, `nomic-embed-text` → `Nomic Embed Text`.
pub fn display_name(name: &str) -> String {
    match display_parts(name) {
        (base, Some(tag)) => format!("{} ({})", base, tag),
        (base, None) => base,
    }
}

/// Inverse of [`display_name`]: `Llama3.2 (3B)` → `llama3.2:3b`.
pub fn model_name_from_display(display: &str) -> String {
    let mut parts = display.split(" (");
    let base = parts.next().unwrap_or_default().replace(' ', "-").to_lowercase();
    match parts.next() {
        Some(tag) => {
            let tag = tag.strip_suffix(')').unwrap_or(tag);
            format!("{}:{}", base, tag.replace(' ', "-").to_lowercase())
        }
        None => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Echo(&'static str);

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "echo"
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn run(&self, arguments: serde_json::Value) -> anyhow::Result<String> {
            Ok(arguments.to_string())
        }
    }

    #[test]
    fn test_display_name_conversion() {
        assert_eq!(display_name("llama3.2:3b"), "Llama3.2 (3B)");
        assert_eq!(display_name("nomic-embed-text"), "Nomic Embed Text");
        assert_eq!(display_name("qwen2.5-coder:7b-instruct"), "Qwen2.5 Coder (7B Instruct)");
        assert_eq!(
            display_parts("gemma:2b"),
            ("Gemma".to_string(), Some("2B".to_string()))
        );
    }

    #[test]
    fn test_model_name_from_display() {
        assert_eq!(model_name_from_display("Llama3.2 (3B)"), "llama3.2:3b");
        assert_eq!(model_name_from_display("Nomic Embed Text"), "nomic-embed-text");
        assert_eq!(
            model_name_from_display(&display_name("qwen2.5-coder:7b-instruct")),
            "qwen2.5-coder:7b-instruct"
        );
    }

    #[test]
    fn test_capabilities() {
        let caps = vec!["completion".to_string(), "vision".to_string()];
        let info = ModelInfo::from_capabilities("llava:7b", &caps);
        assert!(info.vision);
        assert!(!info.tools);
    }

    #[test]
    fn test_selection_follows_model_list() {
        let catalog = ModelCatalog::new();
        assert!(catalog.selected_model().is_none());

        catalog.set_models(vec![ModelInfo::new("a:1b"), ModelInfo::new("b:2b")]);
        assert_eq!(catalog.selected_model().unwrap().name, "a:1b");

        assert!(catalog.select("b:2b"));
        assert!(!catalog.select("c:3b"));
        assert_eq!(catalog.selected_model().unwrap().name, "b:2b");

        catalog.set_models(vec![ModelInfo::new("a:1b")]);
        assert_eq!(catalog.selected_model().unwrap().name, "a:1b");
    }

    #[test]
    fn test_enabled_tools() {
        let catalog = ModelCatalog::new();
        catalog.register_tool(Arc::new(Echo("one")), true);
        catalog.register_tool(Arc::new(Echo("two")), false);
        assert_eq!(catalog.enabled_tools().len(), 1);

        assert!(catalog.set_tool_enabled("two", true));
        assert!(!catalog.set_tool_enabled("three", true));
        assert_eq!(catalog.enabled_tools().len(), 2);
        assert_eq!(
            catalog.tools(),
            vec![("one".to_string(), true), ("two".to_string(), true)]
        );
    }
}
