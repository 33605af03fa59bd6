//! `-v`/`--verbose` for every `medfin` subcommand.
//!
//! Repeating the flag raises the level one step from ERROR. `MEDFIN_LOG_LEVEL`
//! accepts the same steps as a number (`0`-`5`) or a level name.

use clap::{builder::ValueParser, Arg, ArgAction, Command};

pub const ARG_VERBOSITY: &str = "verbosity";
pub const ENV_LOG_LEVEL: &str = "MEDFIN_LOG_LEVEL";

const LEVEL_NAMES: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Verbosity step for a numeric or named level.
///
/// # Errors
/// Returns a message listing the accepted names.
pub fn parse_log_level(level: &str) -> Result<u8, String> {
    if let Ok(parsed) = level.trim().parse::<u8>() {
        if parsed <= 5 {
            return Ok(parsed);
        }
    }

    let name = level.trim().to_lowercase();
    LEVEL_NAMES
        .iter()
        .zip(0u8..)
        .find_map(|(candidate, step)| (*candidate == name).then_some(step))
        .ok_or_else(|| format!("invalid log level, expected 0-5 or one of {}", LEVEL_NAMES.join(", ")))
}

#[must_use]
pub fn validator_log_level() -> ValueParser {
    ValueParser::from(parse_log_level)
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command.arg(
        Arg::new(ARG_VERBOSITY)
            .short('v')
            .long("verbose")
            .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
            .env(ENV_LOG_LEVEL)
            .global(true)
            .action(ArgAction::Count)
            .value_parser(validator_log_level()),
    )
}
