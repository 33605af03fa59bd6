pub mod api;
pub mod logging;

use clap::{
    builder::styling::{AnsiColor, Effects, Styles},
    Arg, ColorChoice, Command,
};
use std::path::PathBuf;

pub const CMD_LOGIN: &str = "login";
pub const CMD_LOGOUT: &str = "logout";
pub const CMD_WHOAMI: &str = "whoami";
pub const CMD_REQUEST: &str = "request";
pub const CMD_WATCH: &str = "watch";
pub const CMD_GATEKEEPER: &str = "gatekeeper";

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let command = Command::new("medfin")
        .about("Back-office session client")
        .version(env!("CARGO_PKG_VERSION"))
        .color(ColorChoice::Auto)
        .styles(styles)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new(CMD_LOGIN)
                .about("Sign in and persist the session")
                .arg(
                    Arg::new("identifier")
                        .short('u')
                        .long("identifier")
                        .help("Login identifier (email)")
                        .env("MEDFIN_IDENTIFIER")
                        .required(true),
                )
                .arg(
                    Arg::new("secret")
                        .short('s')
                        .long("secret")
                        .help("Login secret")
                        .env("MEDFIN_SECRET")
                        .hide_env_values(true)
                        .required(true),
                ),
        )
        .subcommand(Command::new(CMD_LOGOUT).about("Clear the persisted session"))
        .subcommand(Command::new(CMD_WHOAMI).about("Validate the session against /auth/me"))
        .subcommand(
            Command::new(CMD_REQUEST)
                .about("Send an authenticated request")
                .arg(
                    Arg::new("method")
                        .help("HTTP method")
                        .required(true)
                        .value_parser(["GET", "POST", "PUT", "PATCH", "DELETE"])
                        .ignore_case(true),
                )
                .arg(Arg::new("path").help("Request path, example: /applications").required(true))
                .arg(
                    Arg::new("data")
                        .short('d')
                        .long("data")
                        .help("JSON request body"),
                ),
        )
        .subcommand(
            Command::new(CMD_WATCH)
                .about("Revalidate the session periodically until it expires or Ctrl-C")
                .arg(
                    Arg::new("interval")
                        .long("interval")
                        .help("Validation interval in seconds")
                        .env("MEDFIN_VALIDATION_INTERVAL")
                        .default_value("300")
                        .value_parser(clap::value_parser!(u64).range(1..)),
                ),
        )
        .subcommand(
            Command::new(CMD_GATEKEEPER)
                .about("Serve a static directory behind the session cookie gatekeeper")
                .arg(
                    Arg::new("port")
                        .short('p')
                        .long("port")
                        .help("Port to listen on")
                        .default_value("8080")
                        .env("MEDFIN_PORT")
                        .value_parser(clap::value_parser!(u16)),
                )
                .arg(
                    Arg::new("root")
                        .long("root")
                        .help("Directory to serve")
                        .env("MEDFIN_STATIC_DIR")
                        .default_value("public")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("login-path")
                        .long("login-path")
                        .help("Login page path")
                        .env("MEDFIN_LOGIN_PATH")
                        .default_value("/login"),
                )
                .arg(
                    Arg::new("dashboard-path")
                        .long("dashboard-path")
                        .help("Landing page for authenticated visitors")
                        .env("MEDFIN_DASHBOARD_PATH")
                        .default_value("/dashboard"),
                )
                .arg(
                    Arg::new("public-path")
                        .long("public-path")
                        .help("Path served without a session (repeatable)")
                        .action(clap::ArgAction::Append),
                ),
        );

    let command = api::with_args(command);
    logging::with_args(command)
}
