use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::{Message, Tool, ToolDefinition};
use std::env;
use std::path::PathBuf;
use std::process::Child;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use crate::catalog::ModelInfo;
use crate::instance::{GenerationTarget, Instance, InstanceKind};
use crate::server;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";

/// Tool-call rounds allowed before giving up on a reply
const MAX_TOOL_ROUNDS: usize = 5;

static SHARED_HTTP: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(2)
        .build()
        .expect("failed to build HTTP client")
});

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [OllamaMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
}

/// Streaming response: each line is one of these JSON objects.
#[derive(Debug, Deserialize)]
struct OllamaStreamChunk {
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OllamaToolCall {
    function: OllamaFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OllamaFunctionCall {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ShowResponse {
    #[serde(default)]
    capabilities: Vec<String>,
}

impl OllamaMessage {
    /// Text attachments are inlined as fenced blocks ahead of the text;
    /// images travel in `images`.
    fn from_message(message: &Message) -> Self {
        let mut content = String::new();
        let mut images = Vec::new();
        for attachment in &message.attachments {
            if attachment.kind.is_image() {
                images.push(attachment.content.clone());
            } else {
                content.push_str(&format!(
                    "```{}\n{}\n```\n\n",
                    attachment.name, attachment.content
                ));
            }
        }
        content.push_str(&message.text);
        Self {
            role: message.role.as_str().to_string(),
            content,
            images,
            tool_calls: Vec::new(),
        }
    }
}

fn conversation(target: &GenerationTarget) -> Vec<OllamaMessage> {
    target
        .history
        .iter()
        .filter(|m| !m.is_placeholder())
        .map(OllamaMessage::from_message)
        .collect()
}

/// Ollama server, either reached over HTTP or started by this process
pub struct OllamaInstance {
    id: String,
    kind: InstanceKind,
    http: Client,
    base: String,
    default_model: Mutex<Option<String>>,
    server: Mutex<Option<Child>>,
}

impl OllamaInstance {
    pub fn new(id: impl Into<String>, base: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: InstanceKind::Ollama,
            http: SHARED_HTTP.clone(),
            base: base.into().trim_end_matches('/').to_string(),
            default_model: Mutex::new(None),
            server: Mutex::new(None),
        }
    }

    /// Plain instance at `OLLAMA_BASE_URL`, or the local default.
    pub fn from_env() -> Self {
        let base = env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::new("ollama", base)
    }

    /// Instance that owns its server. If nothing answers at `base`, `binary
    /// serve` is started and polled until it does.
    pub fn managed(id: impl Into<String>, base: impl Into<String>, binary: PathBuf) -> Result<Self> {
        let mut instance = Self::new(id, base);
        instance.kind = InstanceKind::OllamaManaged;
        if !server::reachable(&instance.base) {
            let child = server::start(&binary, &instance.base)?;
            *instance.server.lock() = Some(child);
        }
        Ok(instance)
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub fn set_default_model(&self, model: Option<String>) {
        *self.default_model.lock() = model;
    }

    /// Installed models with their capabilities.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let resp = self
            .http
            .get(format!("{}/api/tags", self.base))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(anyhow!("ollama error: {}", resp.status()));
        }
        let tags: TagsResponse = resp.json().await?;

        let mut models = Vec::with_capacity(tags.models.len());
        for tag in tags.models {
            let capabilities = match self.show_capabilities(&tag.name).await {
                Ok(caps) => caps,
                Err(e) => {
                    tracing::warn!("Could not read capabilities of {}: {}", tag.name, e);
                    Vec::new()
                }
            };
            models.push(ModelInfo::from_capabilities(tag.name, &capabilities));
        }
        Ok(models)
    }

    async fn show_capabilities(&self, model: &str) -> Result<Vec<String>> {
        let resp = self
            .http
            .post(format!("{}/api/show", self.base))
            .json(&serde_json::json!({ "model": model }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(anyhow!("ollama error: {}", resp.status()));
        }
        let body: ShowResponse = resp.json().await?;
        Ok(body.capabilities)
    }

    async fn stream_chat(&self, target: &GenerationTarget, model: &str) -> Result<()> {
        let messages = conversation(target);
        let req = OllamaChatRequest {
            model,
            messages: &messages,
            stream: true,
            tools: None,
        };
        let resp = self
            .http
            .post(format!("{}/api/chat", self.base))
            .json(&req)
            .send()
            .await
            .context("could not reach ollama")?;
        if !resp.status().is_success() {
            return Err(anyhow!("ollama error: {}", resp.status()));
        }

        // Ollama streams line-delimited JSON
        let mut stream = resp.bytes_stream();
        let mut buf = String::new();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| anyhow!("stream read error: {}", e))?;
            buf.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = buf.find('\n') {
                let line = buf[..pos].trim().to_string();
                buf = buf[pos + 1..].to_string();
                if line.is_empty() {
                    continue;
                }
                if apply_stream_line(target, &line)? {
                    return Ok(());
                }
            }
        }

        let rest = buf.trim();
        if !rest.is_empty() {
            apply_stream_line(target, rest)?;
        }
        Ok(())
    }

    async fn tool_chat(
        &self,
        target: &GenerationTarget,
        model: &str,
        tools: &[Arc<dyn Tool>],
    ) -> Result<()> {
        let definitions: Vec<ToolDefinition> = tools
            .iter()
            .map(|t| ToolDefinition::from_tool(t.as_ref()))
            .collect();
        let mut messages = conversation(target);

        for _ in 0..MAX_TOOL_ROUNDS {
            let req = OllamaChatRequest {
                model,
                messages: &messages,
                stream: false,
                tools: Some(&definitions),
            };
            let resp = self
                .http
                .post(format!("{}/api/chat", self.base))
                .json(&req)
                .send()
                .await
                .context("could not reach ollama")?;
            if !resp.status().is_success() {
                return Err(anyhow!("ollama error: {}", resp.status()));
            }
            let body: OllamaChatResponse = resp.json().await?;
            let reply = body.message;

            if reply.tool_calls.is_empty() {
                target.append(&reply.content);
                return Ok(());
            }

            let calls = reply.tool_calls.clone();
            messages.push(reply);
            for call in calls {
                let output = run_tool(tools, &call.function).await;
                messages.push(OllamaMessage {
                    role: "tool".to_string(),
                    content: output,
                    ..OllamaMessage::default()
                });
            }
        }

        Err(anyhow!(
            "model kept calling tools after {} rounds",
            MAX_TOOL_ROUNDS
        ))
    }
}

/// Apply one streamed line to the target. Returns true once the stream is done.
fn apply_stream_line(target: &GenerationTarget, line: &str) -> Result<bool> {
    let chunk: OllamaStreamChunk = serde_json::from_str(line)
        .map_err(|e| anyhow!("Failed to parse Ollama stream: {}", e))?;
    if let Some(error) = chunk.error {
        return Err(anyhow!(error));
    }
    if let Some(msg) = &chunk.message {
        target.append(&msg.content);
    }
    Ok(chunk.done)
}

async fn run_tool(tools: &[Arc<dyn Tool>], call: &OllamaFunctionCall) -> String {
    let Some(tool) = tools.iter().find(|t| t.name() == call.name) else {
        tracing::warn!("Model called unknown tool {}", call.name);
        return format!("Unknown tool: {}", call.name);
    };
    tracing::info!("Running tool {}", call.name);
    match tool.run(call.arguments.clone()).await {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!("Tool {} failed: {}", call.name, e);
            format!("Error: {}", e)
        }
    }
}

#[async_trait]
impl Instance for OllamaInstance {
    fn kind(&self) -> InstanceKind {
        self.kind
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn generate_message(&self, target: &GenerationTarget, model: &str) {
        if let Err(e) = self.stream_chat(target, model).await {
            target.report_error(&e.to_string());
        }
    }

    async fn use_tools(&self, target: &GenerationTarget, model: &str, tools: &[Arc<dyn Tool>]) {
        if let Err(e) = self.tool_chat(target, model, tools).await {
            target.report_error(&e.to_string());
        }
    }

    fn stop(&self) {
        if let Some(mut child) = self.server.lock().take() {
            tracing::info!("Stopping managed ollama server");
            if let Err(e) = child.kill().and_then(|_| child.wait().map(|_| ())) {
                tracing::warn!("Failed to stop ollama server: {}", e);
            }
        }
    }

    fn get_default_model(&self) -> Option<String> {
        self.default_model.lock().clone()
    }
}

impl Drop for OllamaInstance {
    fn drop(&mut self) {
        self.stop();
    }
}
