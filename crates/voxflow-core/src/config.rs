//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level voxflow configuration.
///
/// Every section is optional; a missing section falls back to its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback: Option<PlaybackConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

// --- Streaming TTS provider ---

/// Text-to-speech streaming provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Websocket base URL (default: "wss://api.elevenlabs.io").
    #[serde(default = "default_tts_base_url")]
    pub base_url: String,

    #[serde(default = "default_voice_id")]
    pub voice_id: String,

    #[serde(default = "default_tts_model")]
    pub model_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_tts_api_key_env", skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Optional output format query parameter (e.g. "mp3_44100_128").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,

    #[serde(default)]
    pub voice_settings: VoiceSettings,
}

fn default_tts_base_url() -> String {
    "wss://api.elevenlabs.io".into()
}

fn default_voice_id() -> String {
    "HxxnFvSdN4AyRUpj6yh7".into()
}

fn default_tts_model() -> String {
    "eleven_multilingual_v2".into()
}

fn default_tts_api_key_env() -> Option<String> {
    Some("ELEVENLABS_API_KEY".into())
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            base_url: default_tts_base_url(),
            voice_id: default_voice_id(),
            model_id: default_tts_model(),
            api_key: None,
            api_key_env: default_tts_api_key_env(),
            output_format: None,
            voice_settings: VoiceSettings::default(),
        }
    }
}

impl TtsConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }

    /// Streaming-input endpoint for the configured voice and model.
    ///
    /// The credential travels in the priming frame and upgrade headers, never in the URL.
    pub fn stream_url(&self) -> String {
        let mut url = format!(
            "{}/v1/text-to-speech/{}/stream-input?model_id={}",
            self.base_url.trim_end_matches('/'),
            self.voice_id,
            self.model_id
        );
        if let Some(format) = &self.output_format {
            url.push_str("&output_format=");
            url.push_str(format);
        }
        url
    }
}

/// Voice parameters sent once in the priming frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    #[serde(default = "default_stability")]
    pub stability: f64,
    #[serde(default = "default_similarity_boost")]
    pub similarity_boost: f64,
}

fn default_stability() -> f64 {
    0.70
}

fn default_similarity_boost() -> f64 {
    0.75
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: default_stability(),
            similarity_boost: default_similarity_boost(),
        }
    }
}

// --- Audio playback ---

/// External playback process fed raw audio on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Executable name or path (default: "mpv").
    #[serde(default = "default_playback_command")]
    pub command: String,

    #[serde(default = "default_playback_args")]
    pub args: Vec<String>,
}

fn default_playback_command() -> String {
    "mpv".into()
}

fn default_playback_args() -> Vec<String> {
    ["--no-cache", "--no-terminal", "--", "fd://0"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            command: default_playback_command(),
            args: default_playback_args(),
        }
    }
}

// --- Reconnect policy ---

/// Reconnect budget and backoff after the provider drops mid-utterance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum reconnects per utterance (default: 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add up to 25% random jitter to each delay.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_true(),
        }
    }
}

// --- Chat completion (text producer) ---

/// OpenAI-compatible chat completion endpoint used as the text producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default = "default_completion_base_url")]
    pub base_url: String,

    #[serde(default = "default_completion_model")]
    pub model: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(
        default = "default_completion_api_key_env",
        skip_serializing_if = "Option::is_none"
    )]
    pub api_key_env: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Messages kept in the chat history; the oldest are dropped first.
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

fn default_completion_base_url() -> String {
    "https://api.openai.com".into()
}

fn default_completion_model() -> String {
    "gpt-4".into()
}

fn default_completion_api_key_env() -> Option<String> {
    Some("OPENAI_API_KEY".into())
}

fn default_temperature() -> f64 {
    1.0
}

fn default_max_history() -> usize {
    10
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: default_completion_base_url(),
            model: default_completion_model(),
            api_key: None,
            api_key_env: default_completion_api_key_env(),
            temperature: default_temperature(),
            max_history: default_max_history(),
            system: None,
        }
    }
}

impl CompletionConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

// --- Logging ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "voxflow_speech=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return input.to_string();
    };
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::VoxflowError::Io)?;

        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::VoxflowError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn tts(&self) -> TtsConfig {
        self.tts.clone().unwrap_or_default()
    }

    pub fn playback(&self) -> PlaybackConfig {
        self.playback.clone().unwrap_or_default()
    }

    pub fn retry(&self) -> RetryConfig {
        self.retry.clone().unwrap_or_default()
    }

    pub fn completion(&self) -> CompletionConfig {
        self.completion.clone().unwrap_or_default()
    }

    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let tts = self.tts();
        if tts.resolve_api_key().is_none() {
            warnings.push("TTS provider has no API key configured".to_string());
        }
        if tts.voice_id.trim().is_empty() {
            errors.push("tts.voice_id cannot be empty".to_string());
        }
        if !(tts.base_url.starts_with("ws://") || tts.base_url.starts_with("wss://")) {
            errors.push(format!(
                "tts.base_url must be a ws:// or wss:// URL, got '{}'",
                tts.base_url
            ));
        }
        for (name, value) in [
            ("stability", tts.voice_settings.stability),
            ("similarity_boost", tts.voice_settings.similarity_boost),
        ] {
            if !(0.0..=1.0).contains(&value) {
                errors.push(format!("tts.voice_settings.{name} must be within 0..=1"));
            }
        }

        if self.playback().command.trim().is_empty() {
            errors.push("playback.command cannot be empty".to_string());
        }

        let retry = self.retry();
        if retry.max_delay_ms < retry.initial_delay_ms {
            errors.push("retry.max_delay_ms is lower than retry.initial_delay_ms".to_string());
        }
        if retry.backoff_multiplier < 1.0 {
            errors.push("retry.backoff_multiplier must be at least 1.0".to_string());
        }

        if self.completion().resolve_api_key().is_none() {
            warnings.push("Completion provider has no API key configured".to_string());
        }

        (warnings, errors)
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Base directory for voxflow data: `~/.voxflow/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".voxflow")
}

/// Expand a leading `~` in a user-supplied path.
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}
