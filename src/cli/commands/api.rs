use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;
use std::path::PathBuf;

pub const ARG_API_URL: &str = "api-url";
pub const ARG_API_KEY: &str = "api-key";
pub const ARG_API_KEY_HEADER: &str = "api-key-header";
pub const ARG_STATE_DIR: &str = "state-dir";
pub const ARG_TIMEOUT: &str = "timeout";
pub const ARG_REFRESH_ATTEMPTS: &str = "refresh-attempts";

pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_API_URL)
                .long(ARG_API_URL)
                .help("Back-office API base URL, example: https://api.medfin.dev")
                .env("MEDFIN_API_URL")
                .global(true),
        )
        .arg(
            Arg::new(ARG_API_KEY)
                .long(ARG_API_KEY)
                .help("Static API key sent with every request")
                .env("MEDFIN_API_KEY")
                .hide_env_values(true)
                .global(true),
        )
        .arg(
            Arg::new(ARG_API_KEY_HEADER)
                .long(ARG_API_KEY_HEADER)
                .help("Header carrying the API key")
                .env("MEDFIN_API_KEY_HEADER")
                .default_value(crate::config::DEFAULT_API_KEY_HEADER)
                .global(true),
        )
        .arg(
            Arg::new(ARG_STATE_DIR)
                .long(ARG_STATE_DIR)
                .help("Directory holding the persisted session and cookie jar")
                .env("MEDFIN_STATE_DIR")
                .default_value(".medfin")
                .value_parser(clap::value_parser!(PathBuf))
                .global(true),
        )
        .arg(
            Arg::new(ARG_TIMEOUT)
                .long(ARG_TIMEOUT)
                .help("Per-request timeout in seconds")
                .env("MEDFIN_TIMEOUT")
                .default_value("10")
                .value_parser(clap::value_parser!(u64).range(1..))
                .global(true),
        )
        .arg(
            Arg::new(ARG_REFRESH_ATTEMPTS)
                .long(ARG_REFRESH_ATTEMPTS)
                .help("Consecutive refresh attempts before the session is expired")
                .env("MEDFIN_REFRESH_ATTEMPTS")
                .default_value("3")
                .value_parser(clap::value_parser!(u32).range(1..))
                .global(true),
        )
}

#[derive(Debug)]
pub struct Options {
    pub url: String,
    pub key: SecretString,
    pub key_header: String,
    pub state_dir: PathBuf,
    pub timeout_seconds: u64,
    pub refresh_attempts: u32,
}

impl Options {
    /// # Errors
    /// Returns an error if the API URL or key is missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let url = matches
            .get_one::<String>(ARG_API_URL)
            .cloned()
            .context("missing required argument: --api-url")?;
        let key = matches
            .get_one::<String>(ARG_API_KEY)
            .cloned()
            .context("missing required argument: --api-key")?;

        Ok(Self {
            url,
            key: SecretString::from(key),
            key_header: matches
                .get_one::<String>(ARG_API_KEY_HEADER)
                .cloned()
                .unwrap_or_else(|| crate::config::DEFAULT_API_KEY_HEADER.to_string()),
            state_dir: matches
                .get_one::<PathBuf>(ARG_STATE_DIR)
                .cloned()
                .unwrap_or_else(|| PathBuf::from(".medfin")),
            timeout_seconds: matches.get_one::<u64>(ARG_TIMEOUT).copied().unwrap_or(10),
            refresh_attempts: matches
                .get_one::<u32>(ARG_REFRESH_ATTEMPTS)
                .copied()
                .unwrap_or(3),
        })
    }
}
