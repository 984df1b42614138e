//! Configuration for halink tools.
//!
//! TOML profiles merged with `HALINK_*` environment overrides, token
//! resolution (env var, keyring, plaintext), and translation to
//! `halink_core::SessionConfig`. The CLI layers its own flag overrides on
//! top of what this crate produces.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use halink_core::{ReconnectPolicy, SessionConfig};

/// Keyring service name; entries are keyed `<profile>/token`.
const KEYRING_SERVICE: &str = "halink";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("profile '{name}' not found in config")]
    UnknownProfile { name: String },

    #[error("no access token configured for profile '{profile}'")]
    NoCredentials { profile: String },

    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level `config.toml`.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named on the command line.
    pub default_profile: Option<String>,

    /// Session tuning shared by every profile.
    #[serde(default)]
    pub defaults: Defaults,

    /// Named backend profiles.
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Defaults {
    /// Per-call deadline, seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default = "default_timeout")]
    pub connect_timeout: u64,

    #[serde(default = "default_timeout")]
    pub auth_timeout: u64,

    /// Events buffered per consumer before the oldest is dropped.
    #[serde(default = "default_consumer_depth")]
    pub consumer_depth: usize,

    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// Give up after this many reconnect attempts. Unset = never.
    #[serde(default)]
    pub max_retries: Option<u32>,

    #[serde(default = "default_resubscribe_attempts")]
    pub resubscribe_attempts: u32,

    /// Heartbeat period, seconds. Unset = no heartbeat.
    #[serde(default)]
    pub heartbeat_secs: Option<u64>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            connect_timeout: default_timeout(),
            auth_timeout: default_timeout(),
            consumer_depth: default_consumer_depth(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            max_retries: None,
            resubscribe_attempts: default_resubscribe_attempts(),
            heartbeat_secs: None,
        }
    }
}

fn default_timeout() -> u64 {
    10
}
fn default_consumer_depth() -> usize {
    256
}
fn default_reconnect_initial_ms() -> u64 {
    1_000
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}
fn default_resubscribe_attempts() -> u32 {
    3
}

/// A named backend profile.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Profile {
    /// Backend base URL (`http://homeassistant.local:8123`) or the full
    /// WebSocket endpoint.
    pub url: String,

    /// Access token (plaintext; prefer keyring or env var).
    pub token: Option<String>,

    /// Environment variable holding the access token.
    pub token_env: Option<String>,

    /// Override `defaults.timeout`.
    pub timeout: Option<u64>,

    /// Override `defaults.consumer_depth`.
    pub consumer_depth: Option<usize>,

    /// Override `defaults.heartbeat_secs`.
    pub heartbeat_secs: Option<u64>,
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("io", "halink", "halink").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("halink");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path` + environment. A missing file yields the defaults.
///
/// Nested keys use a double underscore: `HALINK_DEFAULTS__TIMEOUT=30`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("HALINK_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if it cannot be read.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to the canonical path.
pub fn save_config(cfg: &Config) -> Result<PathBuf, ConfigError> {
    let path = config_path();
    save_config_to(cfg, &path)?;
    Ok(path)
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Profile selection ───────────────────────────────────────────────

/// Pick the profile named `requested`, else `default_profile`, else
/// `"default"`.
pub fn select_profile<'a>(
    config: &'a Config,
    requested: Option<&str>,
) -> Result<(String, &'a Profile), ConfigError> {
    let name = requested
        .or(config.default_profile.as_deref())
        .unwrap_or("default");
    config
        .profiles
        .get(name)
        .map(|profile| (name.to_owned(), profile))
        .ok_or_else(|| ConfigError::UnknownProfile { name: name.into() })
}

// ── Token resolution ────────────────────────────────────────────────

/// Resolve the access token for a profile from the process environment,
/// the system keyring, then the plaintext `token` field.
pub fn resolve_token(profile: &Profile, profile_name: &str) -> Result<SecretString, ConfigError> {
    resolve_token_with(
        profile,
        profile_name,
        |var| std::env::var(var).ok(),
        keyring_token,
    )
}

/// Token resolution with injectable env and keyring lookups.
pub fn resolve_token_with(
    profile: &Profile,
    profile_name: &str,
    env: impl Fn(&str) -> Option<String>,
    keyring: impl Fn(&str) -> Option<String>,
) -> Result<SecretString, ConfigError> {
    // 1. Profile's token_env → env var lookup
    if let Some(token) = profile.token_env.as_deref().and_then(&env) {
        return Ok(SecretString::from(token));
    }

    // 2. System keyring
    if let Some(token) = keyring(profile_name) {
        return Ok(SecretString::from(token));
    }

    // 3. Plaintext in config
    if let Some(ref token) = profile.token {
        return Ok(SecretString::from(token.clone()));
    }

    Err(ConfigError::NoCredentials {
        profile: profile_name.into(),
    })
}

fn keyring_token(profile_name: &str) -> Option<String> {
    keyring::Entry::new(KEYRING_SERVICE, &format!("{profile_name}/token"))
        .and_then(|entry| entry.get_password())
        .ok()
}

/// Store a profile's token in the system keyring.
pub fn store_token(profile_name: &str, token: &str) -> Result<(), ConfigError> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, &format!("{profile_name}/token"))?;
    entry.set_password(token)?;
    Ok(())
}

// ── Translation to SessionConfig ────────────────────────────────────

/// Turn a base URL into the WebSocket endpoint.
///
/// `http(s)://host:8123` becomes `ws(s)://host:8123/api/websocket`;
/// `ws(s)://` URLs are taken as-is.
pub fn websocket_url(raw: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::Validation {
        field: "url".into(),
        reason,
    };
    let mut url: Url = raw
        .trim()
        .parse()
        .map_err(|e| invalid(format!("'{raw}': {e}")))?;

    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme '{other}'"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| invalid(format!("cannot use '{raw}' as a WebSocket URL")))?;
    if url.path().trim_end_matches('/').is_empty() {
        url.set_path("/api/websocket");
    }
    Ok(url)
}

/// Build a `SessionConfig` from a profile and the shared defaults.
pub fn profile_to_session_config(
    profile: &Profile,
    profile_name: &str,
    defaults: &Defaults,
) -> Result<SessionConfig, ConfigError> {
    let token = resolve_token(profile, profile_name)?;
    build_session_config(profile, token, defaults)
}

/// Same as [`profile_to_session_config`] with an already-resolved token.
pub fn build_session_config(
    profile: &Profile,
    token: SecretString,
    defaults: &Defaults,
) -> Result<SessionConfig, ConfigError> {
    let url = websocket_url(&profile.url)?;

    let mut config = SessionConfig::new(url, token);
    config.request_timeout = Duration::from_secs(profile.timeout.unwrap_or(defaults.timeout));
    config.connect_timeout = Duration::from_secs(defaults.connect_timeout);
    config.auth_timeout = Duration::from_secs(defaults.auth_timeout);
    config.consumer_depth = profile.consumer_depth.unwrap_or(defaults.consumer_depth);
    config.heartbeat_interval = profile
        .heartbeat_secs
        .or(defaults.heartbeat_secs)
        .map(Duration::from_secs);
    config.reconnect = ReconnectPolicy {
        initial_delay: Duration::from_millis(defaults.reconnect_initial_ms),
        max_delay: Duration::from_millis(defaults.reconnect_max_ms),
        max_retries: defaults.max_retries,
        resubscribe_attempts: defaults.resubscribe_attempts,
    };

    config.validate().map_err(|e| ConfigError::Validation {
        field: "session settings".into(),
        reason: e.to_string(),
    })?;
    Ok(config)
}
