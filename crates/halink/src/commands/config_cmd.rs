//! Config subcommand handlers.

use halink_config::{self as config, Config, Profile};

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts, InitArgs};
use crate::config::active_profile_name;
use crate::error::CliError;

const REDACTED: &str = "********";

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            println!("{}", config::config_path().display());
            Ok(())
        }

        // ── Show ────────────────────────────────────────────────────
        ConfigCommand::Show => {
            let cfg = redacted(config::load_config()?);
            let rendered = toml::to_string_pretty(&cfg).map_err(config::ConfigError::from)?;
            print!("{rendered}");
            Ok(())
        }

        // ── Init ────────────────────────────────────────────────────
        ConfigCommand::Init(init) => {
            let mut cfg = config::load_config()?;
            let name = active_profile_name(global, &cfg);
            apply_init(&mut cfg, &name, init, global.token.clone())?;
            let path = config::save_config(&cfg)?;

            eprintln!("✓ Profile '{name}' written to {}", path.display());
            eprintln!("  Test it: halink --profile {name} status");
            Ok(())
        }

        // ── SetToken ────────────────────────────────────────────────
        ConfigCommand::SetToken { token } => {
            let cfg = config::load_config_or_default();
            let name = active_profile_name(global, &cfg);
            config::store_token(&name, &token)?;
            eprintln!("✓ Token for profile '{name}' stored in system keyring");
            Ok(())
        }
    }
}

/// Insert or replace profile `name`. A `--token` given alongside goes to
/// the keyring, never into the file.
fn apply_init(
    cfg: &mut Config,
    name: &str,
    init: InitArgs,
    token: Option<String>,
) -> Result<(), CliError> {
    // Fail early on a URL the session could not use.
    config::websocket_url(&init.url)?;

    if let Some(token) = token {
        config::store_token(name, &token)?;
    }

    let previous = cfg.profiles.remove(name).unwrap_or_default();
    cfg.profiles.insert(
        name.to_owned(),
        Profile {
            url: init.url,
            token_env: init.token_env.or(previous.token_env),
            ..previous
        },
    );
    if init.make_default || cfg.profiles.len() == 1 {
        cfg.default_profile = Some(name.to_owned());
    }
    Ok(())
}

fn redacted(cfg: Config) -> Config {
    Config {
        profiles: cfg
            .profiles
            .into_iter()
            .map(|(name, profile)| {
                let token = profile.token.as_ref().map(|_| REDACTED.to_owned());
                (name, Profile { token, ..profile })
            })
            .collect(),
        ..cfg
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn init(url: &str, make_default: bool) -> InitArgs {
        InitArgs {
            url: url.into(),
            token_env: None,
            make_default,
        }
    }

    #[test]
    fn init_keeps_existing_profile_settings() {
        let mut cfg = Config::default();
        cfg.profiles.insert(
            "home".into(),
            Profile {
                url: "http://old:8123".into(),
                token_env: Some("HA_TOKEN".into()),
                timeout: Some(4),
                ..Profile::default()
            },
        );

        apply_init(&mut cfg, "home", init("http://new:8123", false), None).unwrap();
        let home = &cfg.profiles["home"];
        assert_eq!(home.url, "http://new:8123");
        assert_eq!(home.token_env.as_deref(), Some("HA_TOKEN"));
        assert_eq!(home.timeout, Some(4));
        assert_eq!(cfg.default_profile.as_deref(), Some("home"));
    }

    #[test]
    fn init_rejects_unusable_url() {
        let mut cfg = Config::default();
        let err = apply_init(&mut cfg, "home", init("ftp://nas", false), None).unwrap_err();
        assert!(matches!(err, CliError::Validation { .. }));
        assert!(cfg.profiles.is_empty());
    }

    #[test]
    fn show_redacts_plaintext_tokens() {
        let mut cfg = Config::default();
        cfg.profiles.insert(
            "home".into(),
            Profile {
                url: "http://ha:8123".into(),
                token: Some("secret".into()),
                ..Profile::default()
            },
        );
        let shown = redacted(cfg);
        assert_eq!(shown.profiles["home"].token.as_deref(), Some(REDACTED));
    }
}
