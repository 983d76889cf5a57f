//! Preference-backed settings.
//!
//! Every read goes to the store. Writers skip the store when the value is
//! unchanged and report whether anything was written.

use anyhow::Result;
use providers::InstanceKind;
use shared::preferences as keys;
use shared::{ChatStore, PreferenceValue};
use std::sync::Arc;

pub const DEFAULT_ZOOM: i64 = 100;
pub const DEFAULT_SPEECH_MODEL: &str = "base";
pub const DEFAULT_BATCH_SECONDS: i64 = 2;
pub const DEFAULT_SILENCE_BATCHES: i64 = 2;

/// Model id from a chooser label: `"Base (~151mb)"` → `"base"`.
pub fn parse_model_label(label: &str) -> String {
    label.split(" (").next().unwrap_or_default().trim().to_lowercase()
}

/// Language code from a chooser label: `"English (en)"` → `"en"`.
pub fn parse_language_label(label: &str) -> String {
    let last = label.rsplit(" (").next().unwrap_or_default();
    last.strip_suffix(')').unwrap_or(last).trim().to_string()
}

/// Power-saver banner is shown only for a server this app manages.
pub fn powersaver_banner(warning_enabled: bool, power_saver_on: bool, kind: InstanceKind) -> bool {
    warning_enabled && power_saver_on && kind == InstanceKind::OllamaManaged
}

#[derive(Clone)]
pub struct Settings {
    store: Arc<dyn ChatStore>,
}

impl Settings {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    fn get(&self, key: &str) -> Option<PreferenceValue> {
        match self.store.get_preference(key) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Failed to read preference {}: {}", key, e);
                None
            }
        }
    }

    fn set(&self, key: &str, value: PreferenceValue, force: bool) -> Result<bool> {
        if !force && self.get(key).as_ref() == Some(&value) {
            return Ok(false);
        }
        tracing::debug!("Preference {} = {:?}", key, value);
        self.store.insert_or_update_preferences(&[(key, value)])?;
        Ok(true)
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(|v| v.as_int()).unwrap_or(default)
    }

    fn get_string(&self, key: &str) -> Option<String> {
        self.get(key)
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.is_empty())
    }

    pub fn zoom(&self) -> i64 {
        self.get_int(keys::ZOOM, DEFAULT_ZOOM)
    }

    /// `force` rewrites the value even when unchanged, for re-applying zoom
    /// at startup.
    pub fn set_zoom(&self, zoom: i64, force: bool) -> Result<bool> {
        self.set(keys::ZOOM, zoom.into(), force)
    }

    pub fn run_on_background(&self) -> bool {
        self.get_bool(keys::RUN_ON_BACKGROUND, false)
    }

    pub fn set_run_on_background(&self, enabled: bool) -> Result<bool> {
        self.set(keys::RUN_ON_BACKGROUND, enabled.into(), false)
    }

    pub fn mic_auto_send(&self) -> bool {
        self.get_bool(keys::MIC_AUTO_SEND, false)
    }

    pub fn set_mic_auto_send(&self, enabled: bool) -> Result<bool> {
        self.set(keys::MIC_AUTO_SEND, enabled.into(), false)
    }

    /// Speech model: preference, then `CORRAL_SPEECH_MODEL`, then `base`.
    pub fn mic_model(&self) -> String {
        self.get_string(keys::MIC_MODEL)
            .or_else(|| std::env::var("CORRAL_SPEECH_MODEL").ok())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_SPEECH_MODEL.to_string())
    }

    pub fn set_mic_model_label(&self, label: &str) -> Result<bool> {
        let model = parse_model_label(label);
        if model.is_empty() {
            return Ok(false);
        }
        self.set(keys::MIC_MODEL, model.into(), false)
    }

    /// Recognition language; `None` lets the recognizer detect it.
    pub fn mic_language(&self) -> Option<String> {
        self.get_string(keys::MIC_LANGUAGE)
    }

    pub fn set_mic_language_label(&self, label: &str) -> Result<bool> {
        let language = parse_language_label(label);
        if language.is_empty() {
            return Ok(false);
        }
        self.set(keys::MIC_LANGUAGE, language.into(), false)
    }

    pub fn mic_batch_seconds(&self) -> u32 {
        self.get_int(keys::MIC_BATCH_SECONDS, DEFAULT_BATCH_SECONDS).clamp(1, 30) as u32
    }

    pub fn set_mic_batch_seconds(&self, seconds: u32) -> Result<bool> {
        self.set(keys::MIC_BATCH_SECONDS, i64::from(seconds).into(), false)
    }

    /// Consecutive empty batches that count as the end of speech.
    pub fn mic_silence_batches(&self) -> u32 {
        self.get_int(keys::MIC_SILENCE_BATCHES, DEFAULT_SILENCE_BATCHES).clamp(1, 100) as u32
    }

    pub fn set_mic_silence_batches(&self, batches: u32) -> Result<bool> {
        self.set(keys::MIC_SILENCE_BATCHES, i64::from(batches).into(), false)
    }

    pub fn tts_voice(&self) -> Option<String> {
        self.get_string(keys::TTS_VOICE)
    }

    pub fn set_tts_voice(&self, voice: &str) -> Result<bool> {
        if voice.is_empty() {
            return Ok(false);
        }
        self.set(keys::TTS_VOICE, voice.into(), false)
    }

    pub fn powersaver_warning(&self) -> bool {
        self.get_bool(keys::POWERSAVER_WARNING, true)
    }

    pub fn set_powersaver_warning(&self, enabled: bool) -> Result<bool> {
        self.set(keys::POWERSAVER_WARNING, enabled.into(), false)
    }

    pub fn last_notice_seen(&self) -> Option<String> {
        self.get_string(keys::LAST_NOTICE_SEEN)
    }

    pub fn set_last_notice_seen(&self, notice: &str) -> Result<bool> {
        self.set(keys::LAST_NOTICE_SEEN, notice.into(), false)
    }

    pub fn skip_welcome_page(&self) -> bool {
        self.get_bool(keys::SKIP_WELCOME_PAGE, false)
    }

    pub fn set_skip_welcome_page(&self, skip: bool) -> Result<bool> {
        self.set(keys::SKIP_WELCOME_PAGE, skip.into(), false)
    }

    pub fn selected_chat(&self) -> Option<String> {
        self.get_string(keys::SELECTED_CHAT)
    }

    pub fn set_selected_chat(&self, chat_id: &str) -> Result<bool> {
        self.set(keys::SELECTED_CHAT, chat_id.into(), false)
    }

    pub fn selected_instance(&self) -> Option<String> {
        self.get_string(keys::SELECTED_INSTANCE)
    }

    pub fn set_selected_instance(&self, instance_id: &str) -> Result<bool> {
        self.set(keys::SELECTED_INSTANCE, instance_id.into(), false)
    }
}
