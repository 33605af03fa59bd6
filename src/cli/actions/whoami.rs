use crate::{cli::globals::GlobalArgs, session::SessionEvent};
use anyhow::{bail, Context, Result};
use serde_json::Value;

/// Fetches `/auth/me` through the recovering pipeline, so an expired access
/// token is refreshed on the way.
/// # Errors
/// Returns an error if there is no session or it cannot be recovered.
pub async fn execute(globals: &GlobalArgs) -> Result<()> {
    let (client, mut events) = globals.connect()?;

    if !client.store().is_authenticated() {
        bail!("not logged in");
    }

    let me_path = client.store().config().me_path.clone();
    match client.get_json::<Value>(&me_path).await {
        Ok(body) => {
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        Err(err) => {
            if let Ok(SessionEvent::Expired { redirect_to }) = events.try_recv() {
                bail!("session expired, sign in again ({redirect_to})");
            }
            Err(err).context("failed to validate session")
        }
    }
}
