//! Embedding-application configuration (spec §6 "Config object").
//!
//! Most options are plain, `serde`-deserializable values an embedder loads
//! from TOML alongside the rest of its own configuration, the same way the
//! teacher's `units`/`targets` configs are nested into its top-level
//! `Config`. The one exception is `console`, a pluggable logger sink that
//! can't come from TOML — it defaults to forwarding into the `log` crate
//! and is swapped out programmatically.

use std::sync::Arc;
use log::Level;
use serde::Deserialize;

//------------ Console ----------------------------------------------------------

/// A logger sink: "any object with info/warn/error/debug/log callables"
/// (spec §6).
pub trait Console: Send + Sync {
    fn log(&self, level: Level, message: &str);

    fn debug(&self, message: &str) {
        self.log(Level::Debug, message)
    }

    fn info(&self, message: &str) {
        self.log(Level::Info, message)
    }

    fn warn(&self, message: &str) {
        self.log(Level::Warn, message)
    }

    fn error(&self, message: &str) {
        self.log(Level::Error, message)
    }
}

/// The default `console`: forwards into whatever `log` backend the
/// embedding application installed (`env_logger`, `stderrlog`, ...).
pub struct LogConsole;

impl Console for LogConsole {
    fn log(&self, level: Level, message: &str) {
        log::log!(level, "{}", message);
    }
}

fn default_console() -> Arc<dyn Console> {
    Arc::new(LogConsole)
}

//------------ Config -------------------------------------------------------------

/// The options spec §6 enumerates, plus the `console` sink.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Logger sink. Not deserializable; defaults to [`LogConsole`].
    #[serde(skip, default = "default_console")]
    pub console: Arc<dyn Console>,

    /// Requests slower than this log at warning level.
    #[serde(default = "default_slow_request_threshold_millis")]
    pub slow_request_threshold_millis: u64,

    /// Property name for the structured error body.
    #[serde(default = "default_error_message_property")]
    pub error_message_property: String,

    /// Decorate the per-request logger with the request id.
    #[serde(default)]
    pub log_request_id: bool,

    /// Default body-read limit in bytes, used when a call to `body()`
    /// doesn't pass its own `max_content_length`.
    #[serde(default = "default_max_content_length")]
    pub max_content_length: u64,

    /// Response header name to echo the request id under, or `None`.
    #[serde(default)]
    pub return_request_id: Option<String>,

    /// Honour `x-forwarded-for` when set.
    #[serde(default)]
    pub trust_forwarded_for: bool,

    /// Honour `x-forwarded-host` when set.
    #[serde(default)]
    pub trust_forwarded_host: bool,

    /// Honour `x-forwarded-proto` when set.
    #[serde(default)]
    pub trust_forwarded_proto: bool,

    /// Honour `x-http-method-override` when set.
    #[serde(default)]
    pub trust_method_override: bool,

    /// Header to adopt the request id from, when present.
    #[serde(default)]
    pub trust_request_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            console: default_console(),
            slow_request_threshold_millis: default_slow_request_threshold_millis(),
            error_message_property: default_error_message_property(),
            log_request_id: false,
            max_content_length: default_max_content_length(),
            return_request_id: None,
            trust_forwarded_for: false,
            trust_forwarded_host: false,
            trust_forwarded_proto: false,
            trust_method_override: false,
            trust_request_id: None,
        }
    }
}

fn default_slow_request_threshold_millis() -> u64 {
    1000
}

fn default_error_message_property() -> String {
    "message".to_string()
}

fn default_max_content_length() -> u64 {
    10 * 1024 * 1024
}
