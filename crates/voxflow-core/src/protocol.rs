//! Streaming TTS provider wire frames.
//!
//! Client frames are JSON text messages: one priming frame carrying the voice
//! parameters, then one frame per text unit, then an empty-text frame marking
//! the end of input. Provider frames carry base64 audio, the characters now
//! confirmed as spoken, and a final-response flag, each optional.

use serde::{Deserialize, Serialize};

use crate::config::VoiceSettings;

/// Text of the priming frame. The provider echoes it back as the first
/// confirmed character of every connection.
pub const PRIMING_TEXT: &str = " ";

/// A client -> provider frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ClientFrame {
    /// Sent once right after the connection opens.
    Priming {
        text: String,
        voice_settings: VoiceSettings,
        xi_api_key: String,
    },

    /// Synthesize this text without forcing early generation.
    Text {
        text: String,
        try_trigger_generation: bool,
    },

    /// Empty text: no further input follows.
    EndOfInput { text: String },
}

impl ClientFrame {
    pub fn priming(voice_settings: VoiceSettings, api_key: &str) -> Self {
        Self::Priming {
            text: PRIMING_TEXT.to_string(),
            voice_settings,
            xi_api_key: api_key.to_string(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            try_trigger_generation: false,
        }
    }

    pub fn end_of_input() -> Self {
        Self::EndOfInput {
            text: String::new(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A provider -> client frame. Every field may be absent or null.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderFrame {
    /// Base64-encoded audio payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_alignment: Option<Alignment>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_final: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<serde_json::Value>,
}

/// Character alignment attached to an audio frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alignment {
    #[serde(default)]
    pub chars: Vec<String>,
}

impl ProviderFrame {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Audio payload, treating an empty string the same as absent.
    pub fn audio_payload(&self) -> Option<&str> {
        self.audio.as_deref().filter(|a| !a.is_empty())
    }

    pub fn confirmed_chars(&self) -> &[String] {
        self.normalized_alignment
            .as_ref()
            .map(|a| a.chars.as_slice())
            .unwrap_or_default()
    }

    pub fn is_final(&self) -> bool {
        self.is_final.unwrap_or(false)
    }

    /// Provider-reported failure, if this frame is an error report.
    pub fn provider_error(&self) -> Option<String> {
        self.error.as_ref().map(|error| match &self.message {
            Some(message) => format!("{error}: {message}"),
            None => error.clone(),
        })
    }
}
