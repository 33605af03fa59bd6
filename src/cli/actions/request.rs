use crate::{api::ApiRequest, cli::globals::GlobalArgs};
use anyhow::{Context, Result};
use reqwest::Method;
use serde_json::Value;
use tracing::debug;

#[derive(Debug)]
pub struct Args {
    pub globals: GlobalArgs,
    pub method: Method,
    pub path: String,
    pub data: Option<Value>,
}

/// # Errors
/// Returns an error if the request fails after recovery.
pub async fn execute(args: Args) -> Result<()> {
    let (client, _events) = args.globals.connect()?;

    let mut request = ApiRequest::new(args.method, &args.path);
    if let Some(data) = args.data {
        request = request.json(data);
    }

    let response = client
        .send(request)
        .await
        .with_context(|| format!("request to {} failed", args.path))?;
    debug!(status = %response.status, "request completed");

    match response.json::<Value>() {
        Ok(body) => println!("{}", serde_json::to_string_pretty(&body)?),
        Err(_) => println!("{}", response.text()),
    }

    Ok(())
}
