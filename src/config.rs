//! Service configuration: defaults, JSON config files, and checkpoint generation settings.

use crate::errors::StreamError;
use crate::inference::sampling::SamplingParams;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Token budget used when a request does not ask for one.
pub const DEFAULT_MAX_NEW_TOKENS: usize = 800;

/// Hard upper bound on new tokens per session.
pub const MAX_NEW_TOKENS_CEILING: usize = 2048;

/// Top-level configuration (file layout of `--config`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub generation: GenerationConfig,
}

impl ServiceConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, StreamError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: ServiceConfig = serde_json::from_str(&raw).map_err(|e| {
            StreamError::Config(format!("{}: {}", path.as_ref().display(), e))
        })?;
        config.generation.validate()?;
        Ok(config)
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allow any origin (the interactive page may be served elsewhere).
    pub cors_permissive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            cors_permissive: true,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Per-session generation limits and decode defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub default_max_new_tokens: usize,
    pub max_new_tokens_ceiling: usize,
    /// Capacity of the worker → relay handoff channel, in fragments.
    pub channel_capacity: usize,
    pub session_timeout_secs: u64,
    /// Decode sessions allowed at once. 1 serializes access to the decode device.
    pub max_concurrent_sessions: usize,
    /// Stop tokens applied to every request. Empty means "use the tokenizer's EOS".
    pub stop_token_ids: Vec<u32>,
    pub pad_token_id: Option<u32>,
    pub sampling: SamplingParams,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            default_max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            max_new_tokens_ceiling: MAX_NEW_TOKENS_CEILING,
            channel_capacity: 4,
            session_timeout_secs: 120,
            max_concurrent_sessions: 1,
            stop_token_ids: Vec::new(),
            pad_token_id: None,
            sampling: SamplingParams::default(),
        }
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.channel_capacity == 0 {
            return Err(StreamError::Config("channel_capacity must be > 0".into()));
        }
        if self.max_new_tokens_ceiling == 0 {
            return Err(StreamError::Config(
                "max_new_tokens_ceiling must be > 0".into(),
            ));
        }
        if self.default_max_new_tokens == 0 {
            return Err(StreamError::Config(
                "default_max_new_tokens must be > 0".into(),
            ));
        }
        if self.session_timeout_secs == 0 {
            return Err(StreamError::Config("session_timeout_secs must be > 0".into()));
        }
        if self.max_concurrent_sessions == 0 {
            return Err(StreamError::Config(
                "max_concurrent_sessions must be > 0".into(),
            ));
        }
        self.sampling.validate()
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// Resolve a request's token budget against the default and the ceiling.
    /// Zero is rejected; anything above the ceiling is clamped.
    pub fn resolve_max_new_tokens(&self, requested: Option<usize>) -> Result<usize, StreamError> {
        match requested {
            None => Ok(self.default_max_new_tokens.min(self.max_new_tokens_ceiling)),
            Some(0) => Err(StreamError::Validation(
                "max_new_tokens must be a positive integer".into(),
            )),
            Some(n) if n > self.max_new_tokens_ceiling => {
                tracing::debug!(
                    requested = n,
                    ceiling = self.max_new_tokens_ceiling,
                    "clamping max_new_tokens"
                );
                Ok(self.max_new_tokens_ceiling)
            }
            Some(n) => Ok(n),
        }
    }

    /// Fill unset stop/pad/budget settings from a checkpoint's `generation_config.json`.
    pub fn apply_checkpoint(&mut self, ckpt: &CheckpointGenerationConfig) {
        if self.stop_token_ids.is_empty() {
            self.stop_token_ids = ckpt.eos_token_ids();
        }
        if self.pad_token_id.is_none() {
            self.pad_token_id = ckpt.pad_token_id();
        }
        if let Some(n) = ckpt.max_new_tokens() {
            self.default_max_new_tokens = n.min(self.max_new_tokens_ceiling);
        }
    }
}

/// The subset of a Hugging Face `generation_config.json` this service reads.
///
/// Fields are kept as raw JSON so that malformed values are logged and skipped
/// instead of failing startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckpointGenerationConfig {
    #[serde(default)]
    eos_token_id: Option<serde_json::Value>,
    #[serde(default)]
    pad_token_id: Option<serde_json::Value>,
    #[serde(default)]
    max_new_tokens: Option<serde_json::Value>,
}

impl CheckpointGenerationConfig {
    /// Read `<dir>/generation_config.json` if present.
    pub fn from_dir(dir: impl AsRef<Path>) -> Option<Self> {
        let path = dir.as_ref().join("generation_config.json");
        let raw = std::fs::read_to_string(&path).ok()?;
        Self::from_json(&raw)
            .map_err(|e| tracing::warn!("ignoring {}: {}", path.display(), e))
            .ok()
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// EOS ids; the field may be a single integer or a list.
    pub fn eos_token_ids(&self) -> Vec<u32> {
        match &self.eos_token_id {
            None | Some(serde_json::Value::Null) => Vec::new(),
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| token_id(v, "eos_token_id"))
                .collect(),
            Some(v) => token_id(v, "eos_token_id").into_iter().collect(),
        }
    }

    pub fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
            .as_ref()
            .filter(|v| !v.is_null())
            .and_then(|v| token_id(v, "pad_token_id"))
    }

    pub fn max_new_tokens(&self) -> Option<usize> {
        let v = self.max_new_tokens.as_ref().filter(|v| !v.is_null())?;
        match v.as_u64() {
            Some(n) if n > 0 => Some(n as usize),
            _ => {
                tracing::warn!("ignoring malformed max_new_tokens: {}", v);
                None
            }
        }
    }
}

fn token_id(v: &serde_json::Value, field: &str) -> Option<u32> {
    match v.as_u64().and_then(|n| u32::try_from(n).ok()) {
        Some(id) => Some(id),
        None => {
            tracing::warn!("ignoring malformed {}: {}", field, v);
            None
        }
    }
}
