use crate::{cli::globals::GlobalArgs, session::SessionValidator};
use anyhow::{bail, Result};
use std::time::Duration;
use tokio::signal;
use tracing::info;

#[derive(Debug)]
pub struct Args {
    pub globals: GlobalArgs,
    pub interval: Duration,
}

/// Runs the periodic validator until the session ends or Ctrl-C. Dropping
/// the handle on return stops the validator task.
/// # Errors
/// Returns an error if there is no session to watch.
pub async fn execute(args: Args) -> Result<()> {
    let (client, mut events) = args.globals.connect()?;

    if !client.store().is_authenticated() {
        bail!("not logged in");
    }

    let mut handle = SessionValidator::new(client.manager().clone(), args.interval).spawn();

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("interrupted, stopping validator");
        }
        Some(event) = events.recv() => {
            println!("Session ended, redirect to {}", event.redirect_to());
        }
        () = handle.finished() => {
            println!("Session ended");
        }
    }

    Ok(())
}
