//! Data model shared by the pipeline stages.

use serde::{Deserialize, Serialize};

/// Element of every pipeline queue: a real item or the in-band end marker.
///
/// Termination travels through the queue itself so a consumer only stops
/// after draining everything queued ahead of the marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem<T> {
    Item(T),
    End,
}

/// One word plus its single trailing space, the unit handed to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextUnit(String);

impl TextUnit {
    /// Build a unit from a run of non-space characters.
    pub fn from_word(word: &str) -> Self {
        let mut text = String::with_capacity(word.len() + 1);
        text.push_str(word);
        text.push(' ');
        Self(text)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for TextUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decoded audio bytes from one provider frame, passed through opaquely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub data: Vec<u8>,
    /// Provider's final-response flag on the frame that carried this audio.
    pub is_final: bool,
}

impl AudioChunk {
    pub fn new(data: Vec<u8>, is_final: bool) -> Self {
        Self { data, is_final }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Characters submitted to one connection attempt versus characters the
/// provider confirmed as spoken during it.
///
/// `sent` only grows while the attempt runs. `confirmed` holds the provider's
/// alignment glyphs, including the leading artifact from the priming frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CharacterLedger {
    pub sent: Vec<char>,
    pub confirmed: Vec<String>,
}

impl CharacterLedger {
    pub fn record_sent(&mut self, text: &str) {
        self.sent.extend(text.chars());
    }

    pub fn record_confirmed<I>(&mut self, glyphs: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.confirmed.extend(glyphs);
    }
}

/// Lifecycle of one utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Streaming,
    Draining,
    Reconnecting,
    Completed,
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Draining => "draining",
            Self::Reconnecting => "reconnecting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}
