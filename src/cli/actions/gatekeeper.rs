use crate::gatekeeper::{self, GatekeeperConfig};
use anyhow::Result;
use std::path::PathBuf;
use tokio::{net::TcpListener, signal};
use tracing::info;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub root: PathBuf,
    pub config: GatekeeperConfig,
}

/// Serves `root` behind the session cookie gatekeeper.
/// # Errors
/// Returns an error if the listener cannot be bound.
pub async fn execute(args: Args) -> Result<()> {
    let app = gatekeeper::router(&args.root, args.config);

    let listener = TcpListener::bind(format!("::0:{}", args.port)).await?;

    info!("Listening on [::]:{}", args.port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}
