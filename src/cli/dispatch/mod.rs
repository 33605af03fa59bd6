//! Maps validated CLI matches to an `Action`.

use crate::cli::{
    actions::{gatekeeper, login, request, watch, Action},
    commands::{self, api},
    globals::GlobalArgs,
};
use crate::gatekeeper::GatekeeperConfig;
use anyhow::{anyhow, Context, Result};
use reqwest::Method;
use secrecy::SecretString;
use std::{path::PathBuf, time::Duration};

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let globals = || -> Result<GlobalArgs> { Ok(GlobalArgs::new(api::Options::parse(matches)?)) };

    match matches.subcommand() {
        Some((commands::CMD_LOGIN, sub)) => Ok(Action::Login(login::Args {
            globals: globals()?,
            identifier: sub
                .get_one::<String>("identifier")
                .cloned()
                .context("missing required argument: --identifier")?,
            secret: sub
                .get_one::<String>("secret")
                .cloned()
                .map(SecretString::from)
                .context("missing required argument: --secret")?,
        })),
        Some((commands::CMD_LOGOUT, _)) => Ok(Action::Logout(globals()?)),
        Some((commands::CMD_WHOAMI, _)) => Ok(Action::Whoami(globals()?)),
        Some((commands::CMD_REQUEST, sub)) => {
            let method = sub
                .get_one::<String>("method")
                .context("missing required argument: METHOD")?;
            let method = Method::from_bytes(method.to_uppercase().as_bytes())
                .map_err(|e| anyhow!("invalid method {method}: {e}"))?;
            let data = sub
                .get_one::<String>("data")
                .map(|raw| serde_json::from_str::<serde_json::Value>(raw))
                .transpose()
                .context("--data is not valid JSON")?;

            Ok(Action::Request(request::Args {
                globals: globals()?,
                method,
                path: sub
                    .get_one::<String>("path")
                    .cloned()
                    .context("missing required argument: PATH")?,
                data,
            }))
        }
        Some((commands::CMD_WATCH, sub)) => Ok(Action::Watch(watch::Args {
            globals: globals()?,
            interval: Duration::from_secs(sub.get_one::<u64>("interval").copied().unwrap_or(300)),
        })),
        Some((commands::CMD_GATEKEEPER, sub)) => {
            let mut config = GatekeeperConfig::default();
            if let Some(path) = sub.get_one::<String>("login-path") {
                config.login_path.clone_from(path);
            }
            if let Some(path) = sub.get_one::<String>("dashboard-path") {
                config.dashboard_path.clone_from(path);
            }
            if let Some(paths) = sub.get_many::<String>("public-path") {
                config.public_paths.extend(paths.cloned());
            }

            Ok(Action::Gatekeeper(gatekeeper::Args {
                port: sub.get_one::<u16>("port").copied().unwrap_or(8080),
                root: sub
                    .get_one::<PathBuf>("root")
                    .cloned()
                    .unwrap_or_else(|| PathBuf::from("public")),
                config,
            }))
        }
        _ => Err(anyhow!("missing subcommand")),
    }
}
