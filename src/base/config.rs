//! Load configuration via `config` crate with env-override support.

use std::{ops::Deref, path::PathBuf, sync::Arc, time::Duration};

use serde::Deserialize;
use serde_with::{DurationMilliSeconds, DurationSeconds, serde_as};

use crate::base::prompts;

use super::types::{Res, Void};

/// Default bot name to listen for.
fn default_bot_name() -> String {
    "Eugen".to_string()
}

/// Default greeting phrases for the ambiguous-greeting heuristic.
fn default_greetings() -> Vec<String> {
    ["hi", "hey", "hello", "hallo", "servus", "moin", "how are you", "wie geht's", "wie gehts", "everything ok", "alles klar"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Default OpenAI-compatible API base.
fn default_api_base() -> String {
    "https://api.perplexity.ai".to_string()
}

/// Default completion model.
fn default_model() -> String {
    "sonar-pro".to_string()
}

/// Default fallback model when the primary one is rejected.
fn default_fallback_model() -> Option<String> {
    Some("sonar".to_string())
}

/// Default max output tokens (chat lines should stay short).
fn default_max_tokens() -> u32 {
    450
}

fn default_temperature() -> f32 {
    0.7
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_transient_attempts() -> u32 {
    2
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_rate_limit_cooldown() -> Duration {
    Duration::from_secs(60)
}

/// USD per 1K tokens used for the rough cost estimate.
fn default_cost_per_1k_tokens() -> f64 {
    0.0003
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/conversations")
}

fn default_max_messages() -> usize {
    25
}

fn default_history_limit() -> usize {
    5
}

fn default_context_retention() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_event_capacity() -> usize {
    256
}

fn default_worker_idle() -> Duration {
    Duration::from_secs(300)
}

/// Configuration for the relay-bot application.
#[derive(Debug, Clone)]
pub struct Config {
    pub inner: Arc<ConfigInner>,
}

impl Deref for Config {
    type Target = ConfigInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl From<ConfigInner> for Config {
    fn from(inner: ConfigInner) -> Self {
        Self { inner: Arc::new(inner) }
    }
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct ConfigInner {
    /// The name the bot answers to (`BOT_NAME`).
    #[serde(default = "default_bot_name")]
    pub bot_name: String,
    /// Extra names the bot answers to (`ALIASES`).
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Also answer to the 4- and 8-character prefixes of the bot name (`DERIVE_NICKNAMES`).
    #[serde(default)]
    pub derive_nicknames: bool,
    /// Treat a bare greeting at message start as addressing the bot (`GREETINGS_ENABLED`).
    #[serde(default)]
    pub greetings_enabled: bool,
    /// Greeting phrases used when `greetings_enabled` is set (`GREETINGS`).
    #[serde(default = "default_greetings")]
    pub greetings: Vec<String>,
    /// Completion service API key (`API_KEY`).
    #[serde(default)]
    pub api_key: String,
    /// Base URL of the OpenAI-compatible completion service (`API_BASE`).
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Model to request (`MODEL`).
    #[serde(default = "default_model")]
    pub model: String,
    /// Model to retry once with when `model` is rejected (`FALLBACK_MODEL`).
    #[serde(default = "default_fallback_model")]
    pub fallback_model: Option<String>,
    /// Max output tokens (`MAX_TOKENS`).
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Sampling temperature (`TEMPERATURE`).
    /// Value between 0 and 2.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Per-attempt request timeout in seconds (`REQUEST_TIMEOUT`).
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Total attempts allowed for transient network failures (`MAX_TRANSIENT_ATTEMPTS`).
    #[serde(default = "default_max_transient_attempts")]
    pub max_transient_attempts: u32,
    /// Base delay for exponential backoff in milliseconds (`RETRY_BACKOFF`).
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: Duration,
    /// Cooldown before the single rate-limit retry, in seconds (`RATE_LIMIT_COOLDOWN`).
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_rate_limit_cooldown")]
    pub rate_limit_cooldown: Duration,
    /// Rough USD price per 1K tokens (`COST_PER_1K_TOKENS`).
    #[serde(default = "default_cost_per_1k_tokens")]
    pub cost_per_1k_tokens: f64,
    /// Directory holding one JSON file per participant (`DATA_DIR`).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Stored entries kept per participant (`MAX_MESSAGES`).
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    /// Entries sent to the model per request (`HISTORY_LIMIT`).
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// How far back history stays relevant, in seconds (`CONTEXT_RETENTION`).
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_context_retention")]
    pub context_retention: Duration,
    /// Optional persona override (`SYSTEM_PROMPT`).
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Buffered pipeline events before the oldest are dropped (`EVENT_CAPACITY`).
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// How long a participant worker idles before retiring, in seconds (`WORKER_IDLE`).
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_worker_idle")]
    pub worker_idle: Duration,
}

impl Default for ConfigInner {
    fn default() -> Self {
        Self {
            bot_name: default_bot_name(),
            aliases: Vec::new(),
            derive_nicknames: false,
            greetings_enabled: false,
            greetings: default_greetings(),
            api_key: String::new(),
            api_base: default_api_base(),
            model: default_model(),
            fallback_model: default_fallback_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            request_timeout: default_request_timeout(),
            max_transient_attempts: default_max_transient_attempts(),
            retry_backoff: default_retry_backoff(),
            rate_limit_cooldown: default_rate_limit_cooldown(),
            cost_per_1k_tokens: default_cost_per_1k_tokens(),
            data_dir: default_data_dir(),
            max_messages: default_max_messages(),
            history_limit: default_history_limit(),
            context_retention: default_context_retention(),
            system_prompt: None,
            event_capacity: default_event_capacity(),
            worker_idle: default_worker_idle(),
        }
    }
}

impl Config {
    pub fn load(explicit_path: Option<&std::path::Path>) -> Res<Self> {
        let mut cfg = config::Config::builder().add_source(
            config::Environment::default()
                .prefix("RELAY_BOT")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("aliases")
                .with_list_parse_key("greetings"),
        );

        if let Some(p) = explicit_path {
            cfg = cfg.add_source(config::File::from(p.to_path_buf()));
        } else if std::path::Path::new(".hidden/config.toml").exists() {
            cfg = cfg.add_source(config::File::with_name(".hidden/config.toml"));
        }

        let result = Config {
            inner: Arc::new(cfg.build()?.try_deserialize()?),
        };

        result.validate()?;

        Ok(result)
    }

    /// Checks the invariants the components rely on.
    pub fn validate(&self) -> Void {
        if self.bot_name.trim().is_empty() {
            return Err(anyhow::anyhow!("Bot name must not be empty."));
        }

        if self.api_key.trim().is_empty() {
            return Err(anyhow::anyhow!("API key must be set (RELAY_BOT_API_KEY)."));
        }

        if self.temperature < 0.0 || self.temperature > 2.0 {
            return Err(anyhow::anyhow!("Temperature must be between 0 and 2."));
        }

        if self.max_tokens < 1 || self.max_tokens > 128000 {
            return Err(anyhow::anyhow!("Max tokens must be between 1 and 128000."));
        }

        if self.max_messages == 0 {
            return Err(anyhow::anyhow!("Max messages must be at least 1."));
        }

        if self.history_limit > self.max_messages {
            return Err(anyhow::anyhow!("History limit ({}) cannot exceed max messages ({}).", self.history_limit, self.max_messages));
        }

        if self.max_transient_attempts < 1 {
            return Err(anyhow::anyhow!("Max transient attempts must be at least 1."));
        }

        if self.event_capacity == 0 {
            return Err(anyhow::anyhow!("Event capacity must be at least 1."));
        }

        Ok(())
    }

    /// The persona sent as the first message of every request.
    pub fn system_prompt(&self) -> String {
        match &self.system_prompt {
            Some(prompt) if !prompt.trim().is_empty() => prompt.clone(),
            _ => prompts::default_system_prompt(&self.bot_name),
        }
    }
}
