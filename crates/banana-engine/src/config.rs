use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use banana_contracts::presets::PromptPresets;
use serde::{Deserialize, Serialize};

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_OPENROUTER_API_BASE: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash-image-preview";
pub const DEFAULT_OPENROUTER_MODEL: &str = "google/gemini-2.5-flash-image-preview";

/// Wire dialect spoken to the generation service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    /// Native `generateContent`, also used for Gemini-compatible relays.
    #[default]
    #[serde(rename = "gemini")]
    Gemini,
    /// OpenAI-compatible `chat/completions`.
    #[serde(rename = "openrouter")]
    OpenRouter,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::OpenRouter => "openrouter",
        }
    }

    pub fn default_api_base(self) -> &'static str {
        match self {
            Self::Gemini => DEFAULT_GEMINI_API_BASE,
            Self::OpenRouter => DEFAULT_OPENROUTER_API_BASE,
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::Gemini => DEFAULT_GEMINI_MODEL,
            Self::OpenRouter => DEFAULT_OPENROUTER_MODEL,
        }
    }

    /// Environment variables holding the API key, in lookup order.
    pub fn key_env_vars(self) -> &'static [&'static str] {
        match self {
            Self::Gemini => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
            Self::OpenRouter => &["OPENROUTER_API_KEY"],
        }
    }

    fn base_env_var(self) -> &'static str {
        match self {
            Self::Gemini => "GEMINI_API_BASE",
            Self::OpenRouter => "OPENROUTER_API_BASE",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "gemini" | "google" => Ok(Self::Gemini),
            "openrouter" | "open_router" => Ok(Self::OpenRouter),
            other => Err(format!("unknown provider '{other}' (expected gemini or openrouter)")),
        }
    }
}

/// Engine settings: defaults, then an optional JSON file, then environment
/// overrides, then clamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub provider: Provider,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub request_timeout_s: f64,
    pub overall_timeout_s: f64,
    pub max_retries: u32,
    pub retry_backoff_s: f64,
    pub retry_backoff_max_s: f64,
    pub retry_jitter: f64,
    pub frame_prompts: bool,
    pub conform_output: bool,
    #[serde(skip_serializing_if = "PromptPresets::is_empty")]
    pub presets: PromptPresets,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Gemini,
            api_base: None,
            model: None,
            request_timeout_s: 120.0,
            overall_timeout_s: 300.0,
            max_retries: 3,
            retry_backoff_s: 1.0,
            retry_backoff_max_s: 20.0,
            retry_jitter: 0.25,
            frame_prompts: true,
            conform_output: true,
            presets: PromptPresets::new(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        let parsed: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(parsed.normalized())
    }

    /// Missing files yield the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.is_file() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolves the full stack for a process: file (if any), environment,
    /// clamps.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::load_or_default(path)?,
            None => Self::default(),
        };
        Ok(base.apply_env().normalized())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn apply_env(self) -> Self {
        self.apply_overrides(non_empty_env)
    }

    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(provider) = lookup("BANANA_PROVIDER").and_then(|raw| raw.parse().ok()) {
            self.provider = provider;
        }
        if let Some(base) = lookup(self.provider.base_env_var()) {
            self.api_base = Some(base);
        }
        if let Some(model) = lookup("BANANA_MODEL") {
            self.model = Some(model);
        }
        self.request_timeout_s =
            parse_f64(lookup("BANANA_REQUEST_TIMEOUT"), self.request_timeout_s);
        self.overall_timeout_s =
            parse_f64(lookup("BANANA_OVERALL_TIMEOUT"), self.overall_timeout_s);
        self.retry_backoff_s = parse_f64(lookup("BANANA_RETRY_BACKOFF"), self.retry_backoff_s);
        if let Some(retries) = lookup("BANANA_MAX_RETRIES").and_then(|raw| raw.parse::<u32>().ok())
        {
            self.max_retries = retries;
        }
        self
    }

    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        self.api_base = self
            .api_base
            .map(|base| base.trim().trim_end_matches('/').to_string())
            .filter(|base| !base.is_empty());
        self.model = self
            .model
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty());
        self.request_timeout_s =
            clamp_f64(self.request_timeout_s, defaults.request_timeout_s, 5.0, 600.0);
        self.overall_timeout_s =
            clamp_f64(self.overall_timeout_s, defaults.overall_timeout_s, 10.0, 1800.0);
        self.max_retries = self.max_retries.min(8);
        self.retry_backoff_s =
            clamp_f64(self.retry_backoff_s, defaults.retry_backoff_s, 0.05, 30.0);
        self.retry_backoff_max_s = clamp_f64(
            self.retry_backoff_max_s,
            defaults.retry_backoff_max_s,
            self.retry_backoff_s,
            300.0,
        );
        self.retry_jitter = clamp_f64(self.retry_jitter, defaults.retry_jitter, 0.0, 1.0);
        self
    }

    pub fn api_base(&self) -> &str {
        self.api_base
            .as_deref()
            .unwrap_or_else(|| self.provider.default_api_base())
    }

    pub fn model(&self) -> &str {
        self.model
            .as_deref()
            .unwrap_or_else(|| self.provider.default_model())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_s)
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.overall_timeout_s)
    }
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_f64(raw: Option<String>, current: f64) -> f64 {
    raw.and_then(|text| text.trim().parse::<f64>().ok())
        .unwrap_or(current)
}

fn clamp_f64(value: f64, default: f64, min: f64, max: f64) -> f64 {
    let value = if value.is_finite() { value } else { default };
    value.clamp(min, max.max(min))
}
