use crate::{
    api::ApiClient,
    cli::commands::api::Options,
    config::ClientConfig,
    session::{AuthStore, FileCookieJar, FileStore, Persistence, SessionEvent, SessionManager},
};
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

pub const COOKIE_JAR_FILE: &str = "cookies.json";

#[derive(Debug, Clone)]
pub struct GlobalArgs {
    pub api_url: String,
    pub api_key: SecretString,
    pub api_key_header: String,
    pub state_dir: PathBuf,
    pub request_timeout: Duration,
    pub refresh_attempts: u32,
}

impl GlobalArgs {
    #[must_use]
    pub fn new(options: Options) -> Self {
        Self {
            api_url: options.url,
            api_key: options.key,
            api_key_header: options.key_header,
            state_dir: options.state_dir,
            request_timeout: Duration::from_secs(options.timeout_seconds),
            refresh_attempts: options.refresh_attempts,
        }
    }

    /// # Errors
    /// Returns an error if the API URL is invalid.
    pub fn client_config(&self) -> Result<ClientConfig> {
        let mut config = ClientConfig::new(&self.api_url, self.api_key.clone())
            .context("invalid MEDFIN_API_URL")?;
        config.api_key_header.clone_from(&self.api_key_header);
        config.request_timeout = self.request_timeout;
        config.refresh_max_attempts = self.refresh_attempts;
        Ok(config)
    }

    #[must_use]
    pub fn persistence(&self, config: &ClientConfig) -> Persistence {
        Persistence::new(
            Arc::new(FileStore::new(&self.state_dir)),
            Arc::new(FileCookieJar::new(self.state_dir.join(COOKIE_JAR_FILE))),
            &config.storage_key,
            config.cookie_max_age,
        )
    }

    /// Builds the client stack and restores the persisted session.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn connect(&self) -> Result<(ApiClient, UnboundedReceiver<SessionEvent>)> {
        let config = self.client_config()?;
        let persistence = self.persistence(&config);
        let store = AuthStore::new(config, persistence).context("failed to build client")?;

        let restored = store.hydrate();
        debug!(restored, state_dir = %self.state_dir.display(), "session state loaded");

        let (manager, events) = SessionManager::new(store);
        Ok((ApiClient::new(manager), events))
    }
}
