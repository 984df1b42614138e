//! CLI-aware config resolution: profile + `GlobalOpts` overrides.

use secrecy::SecretString;

use halink_config::{Config, Profile};
use halink_core::SessionConfig;

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Name of the profile this invocation targets.
pub fn active_profile_name(global: &GlobalOpts, cfg: &Config) -> String {
    global
        .profile
        .clone()
        .or_else(|| cfg.default_profile.clone())
        .unwrap_or_else(|| "default".into())
}

/// Build a `SessionConfig` from the config file, the active profile, and
/// command-line overrides (`--url`, `--token`, `--timeout`).
pub fn session_config(global: &GlobalOpts) -> Result<SessionConfig, CliError> {
    let cfg = halink_config::load_config()?;
    resolve(&cfg, global)
}

pub fn resolve(cfg: &Config, global: &GlobalOpts) -> Result<SessionConfig, CliError> {
    let profile_name = active_profile_name(global, cfg);

    let mut profile = match (cfg.profiles.get(&profile_name), &global.url) {
        (Some(profile), _) => profile.clone(),
        // No profile: flags and env vars alone are enough.
        (None, Some(url)) => Profile {
            url: url.clone(),
            ..Profile::default()
        },
        (None, None) if global.profile.is_some() || !cfg.profiles.is_empty() => {
            return Err(CliError::ProfileNotFound { name: profile_name });
        }
        (None, None) => {
            return Err(CliError::NoConfig {
                path: halink_config::config_path().display().to_string(),
            });
        }
    };

    if let Some(ref url) = global.url {
        profile.url.clone_from(url);
    }
    if global.timeout.is_some() {
        profile.timeout = global.timeout;
    }

    let token = match global.token {
        Some(ref token) => SecretString::from(token.clone()),
        None => halink_config::resolve_token(&profile, &profile_name)?,
    };

    let config = halink_config::build_session_config(&profile, token, &cfg.defaults)?;
    tracing::debug!(
        profile = %profile_name,
        url = %config.url,
        timeout_ms = u64::try_from(config.request_timeout.as_millis()).unwrap_or(u64::MAX),
        "resolved session config"
    );
    Ok(config)
}
