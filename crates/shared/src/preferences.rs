//! Preference keys and values persisted in the chat database.

use serde::{Deserialize, Serialize};

pub const ZOOM: &str = "zoom";
pub const RUN_ON_BACKGROUND: &str = "run_on_background";
pub const MIC_AUTO_SEND: &str = "mic_auto_send";
pub const MIC_MODEL: &str = "mic_model";
pub const MIC_LANGUAGE: &str = "mic_language";
pub const MIC_BATCH_SECONDS: &str = "mic_batch_seconds";
pub const MIC_SILENCE_BATCHES: &str = "mic_silence_batches";
pub const TTS_VOICE: &str = "tts_voice";
pub const POWERSAVER_WARNING: &str = "powersaver_warning";
pub const LAST_NOTICE_SEEN: &str = "last_notice_seen";
pub const SKIP_WELCOME_PAGE: &str = "skip_welcome_page";
pub const SELECTED_CHAT: &str = "selected_chat";
pub const SELECTED_INSTANCE: &str = "selected_instance";

/// A stored preference value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PreferenceValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl PreferenceValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PreferenceValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PreferenceValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PreferenceValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for PreferenceValue {
    fn from(value: bool) -> Self {
        PreferenceValue::Bool(value)
    }
}

impl From<i64> for PreferenceValue {
    fn from(value: i64) -> Self {
        PreferenceValue::Int(value)
    }
}

impl From<&str> for PreferenceValue {
    fn from(value: &str) -> Self {
        PreferenceValue::Str(value.to_string())
    }
}

impl From<String> for PreferenceValue {
    fn from(value: String) -> Self {
        PreferenceValue::Str(value)
    }
}
