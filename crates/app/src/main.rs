//! Console front end for the chat core.
//!
//! The main thread owns the terminal: it drains the core's event queue and
//! reads commands from a stdin thread. Every collaborator is built here and
//! handed to the core explicitly.

mod commands;

use anyhow::{anyhow, Result};
use chat_core::settings::powersaver_banner;
use chat_core::speech::AudioDevice;
use chat_core::{
    Classifier, ComposerSink, CoreConfig, Orchestrator, SendRejection, Settings, SpeechError,
    SpeechPipeline, VideoInfo, WebFetcher, WhisperLoader,
};
use commands::{Command, ExportFormat, HELP};
use providers::{
    display_name, model_name_from_display, server, EmptyInstance, Instance, InstanceKind,
    ModelCatalog, ModelRegistry, OllamaInstance,
};
use services::speech::CommandMicrophone;
use services::SqlStore;
use shared::{ui_channel, Role, SendMode, SpeechState, ToastAction, UiEvent, UiQueue};
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Question waiting for `/yes`, `/no` or `/track`
enum Pending {
    Website(String),
    Transcript(VideoInfo, Vec<String>),
    SpeechDownload,
    Quit,
}

struct Console {
    catalog: Arc<ModelCatalog>,
    orchestrator: Arc<Orchestrator>,
    classifier: Classifier,
    speech: SpeechPipeline,
    composer: Arc<ComposerSink>,
    pending: Option<Pending>,
    /// Bytes already printed per streaming message
    streamed: HashMap<String, usize>,
}

/// Connect to a running Ollama, start a bundled one, or fall back to the
/// empty instance.
fn connect_instance(base: &str) -> (Arc<dyn Instance>, Option<Arc<OllamaInstance>>) {
    if server::reachable(base) {
        tracing::info!("Using Ollama at {}", base);
        let ollama = Arc::new(OllamaInstance::new("ollama", base));
        return (ollama.clone(), Some(ollama));
    }
    match server::find_ollama_binary() {
        Some(binary) => match OllamaInstance::managed("ollama:managed", base, binary) {
            Ok(ollama) => {
                let ollama = Arc::new(ollama);
                (ollama.clone(), Some(ollama))
            }
            Err(e) => {
                tracing::error!("Failed to start Ollama: {}", e);
                (Arc::new(EmptyInstance), None)
            }
        },
        None => {
            tracing::warn!("No Ollama server at {} and no binary found", base);
            (Arc::new(EmptyInstance), None)
        }
    }
}

/// Linux platform profile, when the firmware exposes one.
fn power_saver_on() -> bool {
    std::fs::read_to_string("/sys/firmware/acpi/platform_profile")
        .map(|profile| profile.trim() == "low-power")
        .unwrap_or(false)
}

fn print_flush(text: &str) {
    print!("{}", text);
    let _ = std::io::stdout().flush();
}

impl Console {
    fn current_chat_name(&self) -> Option<String> {
        let id = self.orchestrator.current_chat_id()?;
        self.orchestrator
            .chats()
            .into_iter()
            .find(|c| c.id == id)
            .map(|c| c.name)
    }

    fn render(&mut self, event: UiEvent) {
        match event {
            UiEvent::Toast { message, action } => {
                let hint = match action {
                    Some(ToastAction::OpenToolManager) => " (see /tools)",
                    Some(ToastAction::OpenModelManager) => " (see /models)",
                    None => "",
                };
                println!("! {}{}", message, hint);
            }
            UiEvent::ErrorDialog { title, message } => println!("!! {}: {}", title, message),
            UiEvent::OpenInstanceManager => println!(
                "! No Ollama instance is available. Start `ollama serve` or set OLLAMA_BASE_URL."
            ),
            UiEvent::ChatSelected { .. } => {
                if let Some(name) = self.current_chat_name() {
                    println!("== {} ==", name);
                }
            }
            UiEvent::ChatRenamed { name, .. } => println!("(renamed to '{}')", name),
            UiEvent::ChatDeleted { .. } => println!("(chat deleted)"),
            UiEvent::MessageAdded {
                chat_id,
                message,
                responding,
            } => {
                let prefix = if chat_id == chat_core::orchestrator::QUICK_ASK_CHAT_ID {
                    "[quick] "
                } else {
                    ""
                };
                if responding {
                    let model = message.model_name.as_deref().map(display_name).unwrap_or_default();
                    self.streamed.insert(message.id.clone(), 0);
                    print_flush(&format!("{}{}: ", prefix, model));
                } else if message.role == Role::System {
                    println!("{}[system] {}", prefix, message.text);
                }
            }
            UiEvent::MessageDelta {
                message_id, text, ..
            } => {
                *self.streamed.entry(message_id).or_default() += text.len();
                print_flush(&text);
            }
            UiEvent::MessageUpdated { message, .. } => {
                if let Some(printed) = self.streamed.get_mut(&message.id) {
                    if let Some(rest) = message.text.get(*printed..) {
                        print_flush(rest);
                    }
                    *printed = message.text.len();
                }
            }
            UiEvent::GenerationFinished {
                message_id,
                stopped,
                ..
            } => {
                self.streamed.remove(&message_id);
                println!("{}", if stopped { " (stopped)" } else { "" });
            }
            UiEvent::MessageDeleted { .. } => println!("(message deleted)"),
            UiEvent::AttachmentAdded { name, kind } => println!("+ {} ({})", name, kind),
            UiEvent::AttachmentRemoved { name } => println!("- {}", name),
            UiEvent::ComposerSensitive(false) => println!("(looking up video...)"),
            UiEvent::ChooseTranscript {
                video_id,
                title,
                author,
                url,
                tracks,
            } => {
                println!("Attach YouTube video '{}'? Pick a transcript:", title);
                for (i, track) in tracks.iter().enumerate() {
                    println!("  {}. {}", i + 1, track);
                }
                println!("(/track <n> or /no)");
                let video = VideoInfo {
                    video_id,
                    title,
                    author,
                    url,
                };
                self.pending = Some(Pending::Transcript(video, tracks));
            }
            UiEvent::ConfirmWebsite { url } => {
                println!("Attach website '{}'? (/yes or /no)", url);
                self.pending = Some(Pending::Website(url));
            }
            UiEvent::SpeechStateChanged(state) => {
                let label = match state {
                    SpeechState::Idle => "off",
                    SpeechState::Loading => "loading",
                    SpeechState::Listening => "listening",
                };
                println!("(microphone {})", label);
            }
            UiEvent::ConfirmSpeechModelDownload { model, size_hint } => {
                println!(
                    "Speech recognition needs the '{}' model ({}). Download it? (/yes or /no)",
                    model, size_hint
                );
                self.pending = Some(Pending::SpeechDownload);
            }
            UiEvent::SpeechModelProgress {
                downloaded, total, ..
            } => {
                if let Some(total) = total.filter(|t| *t > 0) {
                    print_flush(&format!("\rDownloading model: {}%", downloaded * 100 / total));
                    if downloaded >= total {
                        println!();
                    }
                }
            }
            UiEvent::TranscriptInsert { text, .. } => println!("(heard) {}", text.trim()),
            UiEvent::SendRequested => {
                let text = self.composer.text();
                self.composer.set_text("");
                self.send(SendMode::User, text.trim());
            }
            UiEvent::PowersaverBanner(true) => {
                println!("! Power saver is on; responses may be slow.")
            }
            UiEvent::PowersaverBanner(false)
            | UiEvent::ComposerSensitive(true)
            | UiEvent::ChatAdded { .. }
            | UiEvent::ChatMovedToTop { .. }
            | UiEvent::ChatContentVisible { .. }
            | UiEvent::InputCleared
            | UiEvent::AttachmentTrayVisible(_) => {}
        }
    }

    fn send(&self, mode: SendMode, text: &str) {
        match self.orchestrator.send(mode, text) {
            Ok(_) => {}
            Err(SendRejection::ChatBusy) => println!("(still responding, /stop to cancel)"),
            Err(SendRejection::NoChat) => println!("(no chat selected)"),
            Err(e) => tracing::debug!("Send rejected: {}", e),
        }
    }

    /// Returns false when the answer confirms quitting.
    fn answer(&mut self, yes: bool) -> bool {
        match self.pending.take() {
            Some(Pending::Quit) if yes => return false,
            Some(Pending::Website(url)) if yes => {
                self.classifier.attach_website(url);
            }
            Some(Pending::SpeechDownload) if yes => {
                if let Err(e) = self.speech.activate_with_download(self.composer.clone()) {
                    println!("! {}", e);
                }
            }
            Some(_) => {}
            None => println!("(nothing to answer)"),
        }
        true
    }

    fn paste(&self) -> Result<()> {
        let mut clipboard = arboard::Clipboard::new()?;
        if let Ok(text) = clipboard.get_text() {
            let text = text.trim().to_string();
            if !text.is_empty() {
                if self.classifier.paste_text(&text) == chat_core::PastedText::Plain {
                    self.composer.set_text(&text);
                    println!("(clipboard) {}", text);
                }
                return Ok(());
            }
        }
        let data = clipboard.get_image()?;
        let rgba = image::RgbaImage::from_raw(
            data.width as u32,
            data.height as u32,
            data.bytes.into_owned(),
        )
        .ok_or_else(|| anyhow!("clipboard image has an unexpected size"))?;
        self.classifier
            .paste_image(&image::DynamicImage::ImageRgba8(rgba));
        Ok(())
    }

    fn export(&self, format: ExportFormat, path: Option<&Path>) -> Result<()> {
        let chat_id = self
            .orchestrator
            .current_chat_id()
            .ok_or_else(|| anyhow!("no chat selected"))?;
        let chat = self
            .orchestrator
            .chats()
            .into_iter()
            .find(|c| c.id == chat_id)
            .ok_or_else(|| anyhow!("unknown chat"))?;
        let messages = self.orchestrator.messages(&chat_id)?;
        let out = match format {
            ExportFormat::Markdown => chat_core::export::export_markdown(&chat, &messages, false),
            ExportFormat::Obsidian => chat_core::export::export_markdown(&chat, &messages, true),
            ExportFormat::Json => chat_core::export::export_json(&chat, &messages, false)?,
            ExportFormat::JsonFull => chat_core::export::export_json(&chat, &messages, true)?,
        };
        match path {
            Some(path) => {
                std::fs::write(path, out)?;
                println!("(exported to {})", path.display());
            }
            None => println!("{}", out),
        }
        Ok(())
    }

    /// Run one command. Returns false to quit.
    fn handle(&mut self, command: Command) -> Result<bool> {
        match command {
            Command::Send(text) => self.send(SendMode::User, &text),
            Command::System(text) => self.send(SendMode::System, &text),
            Command::Tool(text) => self.send(SendMode::Tool, &text),
            Command::Stop => {
                if !self.orchestrator.stop() {
                    println!("(nothing to stop)");
                }
            }
            Command::NewChat(name) => {
                self.orchestrator
                    .new_chat(name.as_deref().unwrap_or(chat_core::orchestrator::DEFAULT_CHAT_NAME))?;
            }
            Command::Chats => {
                let current = self.orchestrator.current_chat_id();
                for (i, chat) in self.orchestrator.chats().iter().enumerate() {
                    let marker = if Some(&chat.id) == current.as_ref() { '*' } else { ' ' };
                    let busy = if self.orchestrator.is_busy(&chat.id) { " (responding)" } else { "" };
                    println!("{} {}. {}{}", marker, i + 1, chat.name, busy);
                }
            }
            Command::Select(n) => {
                let chat = self
                    .orchestrator
                    .chats()
                    .into_iter()
                    .nth(n.saturating_sub(1))
                    .ok_or_else(|| anyhow!("no chat number {}", n))?;
                self.orchestrator.select_chat(&chat.id)?;
            }
            Command::Rename(name) => {
                if let Some(id) = self.orchestrator.current_chat_id() {
                    self.orchestrator.rename_chat(&id, &name)?;
                }
            }
            Command::Duplicate => {
                if let Some(id) = self.orchestrator.current_chat_id() {
                    let copy = self.orchestrator.duplicate_chat(&id)?;
                    println!("(created '{}')", copy.name);
                }
            }
            Command::Delete => {
                if let Some(id) = self.orchestrator.current_chat_id() {
                    self.orchestrator.delete_chat(&id)?;
                }
            }
            Command::History => {
                if let Some(id) = self.orchestrator.current_chat_id() {
                    for message in self.orchestrator.messages(&id)? {
                        let who = match (&message.role, &message.model_name) {
                            (Role::Assistant, Some(model)) => display_name(model),
                            (role, _) => role.to_string(),
                        };
                        println!("{}: {}", who, message.text);
                        for attachment in &message.attachments {
                            println!("    [{}] {}", attachment.kind, attachment.name);
                        }
                    }
                }
            }
            Command::Search(term) => {
                if let Some(id) = self.orchestrator.current_chat_id() {
                    let hits = self.orchestrator.search_messages(&id, &term)?;
                    let messages = self.orchestrator.messages(&id)?;
                    for message in messages.iter().filter(|m| hits.contains(&m.id)) {
                        let snippet: String = message.text.chars().take(80).collect();
                        println!("  {}: {}", message.role, snippet);
                    }
                    println!("({} matches)", hits.len());
                }
            }
            Command::Attach(path) => {
                match shared::AttachmentType::from_path(&path) {
                    Some(kind) => {
                        self.orchestrator.attachments().attach(&path, kind);
                    }
                    None => println!("! Unsupported file type: {}", path.display()),
                }
            }
            Command::Drop(paths) => {
                self.classifier.drop_files(&paths);
            }
            Command::Detach(name) => {
                if !self.orchestrator.attachments().remove(&name) {
                    println!("(no attachment named '{}')", name);
                }
            }
            Command::Paste => self.paste()?,
            Command::Confirm(yes) => return Ok(self.answer(yes)),
            Command::Track(n) => match self.pending.take() {
                Some(Pending::Transcript(video, tracks)) => match tracks.get(n.saturating_sub(1)) {
                    Some(track) => {
                        self.classifier.attach_youtube(video, track.clone());
                    }
                    None => {
                        println!("(no track number {})", n);
                        self.pending = Some(Pending::Transcript(video, tracks));
                    }
                },
                other => {
                    self.pending = other;
                    println!("(no transcript to choose)");
                }
            },
            Command::Models => {
                let selected = self.catalog.selected_model().map(|m| m.name);
                for model in self.catalog.models() {
                    let marker = if Some(&model.name) == selected.as_ref() { '*' } else { ' ' };
                    let mut caps = Vec::new();
                    if model.vision {
                        caps.push("vision");
                    }
                    if model.tools {
                        caps.push("tools");
                    }
                    println!("{} {} [{}]", marker, model.display_name(), caps.join(", "));
                }
            }
            Command::Model(name) => {
                if !self.catalog.select(&name) && !self.catalog.select(&model_name_from_display(&name)) {
                    println!("(no model named '{}')", name);
                }
            }
            Command::Tools => {
                for (name, enabled) in self.catalog.tools() {
                    println!("  [{}] {}", if enabled { 'x' } else { ' ' }, name);
                }
            }
            Command::EnableTool(name, enabled) => {
                if !self.catalog.set_tool_enabled(&name, enabled) {
                    println!("(no tool named '{}')", name);
                }
            }
            Command::Mic(true) => match self.speech.activate(self.composer.clone()) {
                Ok(()) | Err(SpeechError::ModelNotDownloaded(_)) => {}
                Err(e) => println!("! {}", e),
            },
            Command::Mic(false) => self.speech.deactivate(),
            Command::Export(format, path) => self.export(format, path.as_deref())?,
            Command::Quick(text) => {
                if let Err(e) = self.orchestrator.quick_ask(&text, SendMode::User) {
                    tracing::debug!("Quick ask rejected: {}", e);
                }
            }
            Command::QuickSave => match self.orchestrator.save_quick_ask()? {
                Some(chat) => println!("(saved as '{}')", chat.name),
                None => println!("(nothing to save)"),
            },
            Command::Help => println!("{}", HELP),
            Command::Quit => {
                if !self.orchestrator.has_busy_chats() {
                    return Ok(false);
                }
                println!("A response is still being generated. Quit anyway? (/yes or /no)");
                self.pending = Some(Pending::Quit);
            }
        }
        Ok(true)
    }
}

fn run(queue: UiQueue, mut console: Console) -> Result<()> {
    let (line_tx, line_rx) = mpsc::channel::<String>();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });

    loop {
        for event in queue.drain() {
            console.render(event);
        }
        match line_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(line) => match commands::parse(&line) {
                Some(Ok(command)) => match console.handle(command) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("! {}", e),
                },
                Some(Err(message)) => println!("! {}", message),
                None => {}
            },
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    console.speech.deactivate();
    console.orchestrator.shutdown()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = CoreConfig::from_env();
    config.ensure_dirs()?;
    let store = Arc::new(SqlStore::open(&config.data_dir)?);
    let settings = Settings::new(store.clone());
    let (events, queue) = ui_channel();

    let catalog = Arc::new(ModelCatalog::new());
    for tool in chat_core::tools::builtin_tools() {
        catalog.register_tool(tool, false);
    }
    let attachments = Arc::new(chat_core::AttachmentStore::new(events.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        catalog.clone(),
        Arc::new(EmptyInstance),
        attachments.clone(),
        events.clone(),
    ));
    orchestrator.load_history()?;

    let (instance, ollama) = connect_instance(&config.ollama_base_url);
    if let Some(ollama) = &ollama {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        if let Err(e) = rt.block_on(catalog.refresh(ollama)) {
            tracing::warn!("Failed to list models: {}", e);
        }
        ollama.set_default_model(catalog.selected_model().map(|m| m.name));
    }
    let kind = instance.kind();
    orchestrator.set_instance(instance)?;
    events.emit(UiEvent::PowersaverBanner(powersaver_banner(
        settings.powersaver_warning(),
        power_saver_on(),
        kind,
    )));
    if kind == InstanceKind::Empty {
        events.emit(UiEvent::OpenInstanceManager);
    }

    let classifier = Classifier::new(
        attachments,
        catalog.clone(),
        Arc::new(WebFetcher),
        config.clone(),
        events.clone(),
    );
    let device: Arc<dyn AudioDevice> = Arc::new(CommandMicrophone);
    let speech = SpeechPipeline::new(
        settings,
        device,
        Arc::new(WhisperLoader::new(config.speech_models_dir())),
        events.clone(),
    );

    println!("Corral ready. Type a message or /help.");
    run(
        queue,
        Console {
            catalog,
            orchestrator,
            classifier,
            speech,
            composer: Arc::new(ComposerSink::new(events)),
            pending: None,
            streamed: HashMap::new(),
        },
    )
}
