use crate::cli::actions::{gatekeeper, login, logout, request, watch, whoami, Action};
use anyhow::Result;

/// Execute the provided action.
/// # Errors
/// Returns an error if the action fails.
pub async fn execute(action: Action) -> Result<()> {
    match action {
        Action::Login(args) => login::execute(args).await,
        Action::Logout(globals) => logout::execute(&globals),
        Action::Whoami(globals) => whoami::execute(&globals).await,
        Action::Request(args) => request::execute(args).await,
        Action::Watch(args) => watch::execute(args).await,
        Action::Gatekeeper(args) => gatekeeper::execute(args).await,
    }
}
