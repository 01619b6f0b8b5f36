// Worker tunables with defaults and environment overrides.

use std::str::FromStr;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Maximum number of characters handed to the summarization pipeline
pub const DEFAULT_SUMMARY_MAX_CHARS: usize = 4096;

/// Upper bound on tokens produced by one chat generation
pub const DEFAULT_CHAT_MAX_NEW_TOKENS: usize = 1024;

/// Chat model used when `generate` arrives before any `load`
pub const DEFAULT_CHAT_MODEL_ID: &str = "onnx-community/Llama-3.2-1B-Instruct-q4f16";

/// Weight precision requested together with the default chat model
pub const DEFAULT_CHAT_DTYPE: &str = "q4f16";

pub const ENV_SUMMARY_MAX_CHARS: &str = "MODEL_WORKER_SUMMARY_MAX_CHARS";
pub const ENV_CHAT_MAX_NEW_TOKENS: &str = "MODEL_WORKER_CHAT_MAX_NEW_TOKENS";
pub const ENV_CHAT_MODEL: &str = "MODEL_WORKER_CHAT_MODEL";
pub const ENV_CHAT_DTYPE: &str = "MODEL_WORKER_CHAT_DTYPE";

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub summary_max_chars: usize,
    pub chat_max_new_tokens: usize,
    pub default_chat_model: String,
    pub default_chat_dtype: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            summary_max_chars: DEFAULT_SUMMARY_MAX_CHARS,
            chat_max_new_tokens: DEFAULT_CHAT_MAX_NEW_TOKENS,
            default_chat_model: DEFAULT_CHAT_MODEL_ID.to_string(),
            default_chat_dtype: DEFAULT_CHAT_DTYPE.to_string(),
        }
    }
}

impl WorkerConfig {
    /// Defaults overridden by `MODEL_WORKER_*` environment variables
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key/value source. Values that fail to parse
    /// (or are zero for counts) keep the current setting.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_positive(&lookup, ENV_SUMMARY_MAX_CHARS) {
            self.summary_max_chars = v;
        }
        if let Some(v) = parse_positive(&lookup, ENV_CHAT_MAX_NEW_TOKENS) {
            self.chat_max_new_tokens = v;
        }
        if let Some(model) = non_empty(&lookup, ENV_CHAT_MODEL) {
            self.default_chat_model = model;
        }
        if let Some(dtype) = non_empty(&lookup, ENV_CHAT_DTYPE) {
            self.default_chat_dtype = dtype;
        }
        self
    }
}

fn parse_positive<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Default,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Some(value),
        _ => {
            log::warn!("Ignoring invalid value '{}' for {}", raw, key);
            None
        }
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
