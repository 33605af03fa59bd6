use crate::{cli::globals::GlobalArgs, error::ApiError};
use anyhow::{bail, Context, Result};
use secrecy::SecretString;
use tracing::info;

#[derive(Debug)]
pub struct Args {
    pub globals: GlobalArgs,
    pub identifier: String,
    pub secret: SecretString,
}

/// # Errors
/// Returns an error if the credentials are rejected or the backend is unreachable.
pub async fn execute(args: Args) -> Result<()> {
    let (client, _events) = args.globals.connect()?;

    let session = match client.store().login(&args.identifier, &args.secret).await {
        Ok(session) => session,
        Err(ApiError::InvalidCredentials) => bail!("invalid credentials"),
        Err(err) => return Err(err).context("login failed"),
    };

    let name = session
        .user
        .as_ref()
        .map_or_else(|| args.identifier.clone(), |user| user.name.clone());
    info!(state_dir = %args.globals.state_dir.display(), "session stored");
    println!("Logged in as {name}");

    Ok(())
}
