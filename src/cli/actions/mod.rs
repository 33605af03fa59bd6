pub mod gatekeeper;
pub mod login;
pub mod logout;
pub mod request;
pub mod watch;
pub mod whoami;

use crate::cli::globals::GlobalArgs;

// The single dispatch point; kept apart so this file only lists actions.
mod run;

#[derive(Debug)]
pub enum Action {
    Login(login::Args),
    Logout(GlobalArgs),
    Whoami(GlobalArgs),
    Request(request::Args),
    Watch(watch::Args),
    Gatekeeper(gatekeeper::Args),
}

impl Action {
    /// Execute the action.
    /// # Errors
    /// Returns an error if the action fails.
    pub async fn execute(self) -> anyhow::Result<()> {
        run::execute(self).await
    }
}
