//! Raw calls against the authentication endpoints.

use crate::{
    api::{error_from_response, with_api_key},
    config::ClientConfig,
    error::ApiError,
    session::User,
};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info_span, instrument, Instrument};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub user: User,
}

/// Rotated token pair returned by the refresh endpoint.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Clone)]
pub struct AuthEndpoints {
    http: Client,
    config: Arc<ClientConfig>,
}

impl AuthEndpoints {
    #[must_use]
    pub fn new(http: Client, config: Arc<ClientConfig>) -> Self {
        Self { http, config }
    }

    /// `POST /auth/login`. 400 and 401 map to `InvalidCredentials`.
    ///
    /// # Errors
    /// Returns an error on network failure, rejected credentials, or an unexpected body.
    #[instrument(skip(self, secret))]
    pub async fn login(
        &self,
        identifier: &str,
        secret: &SecretString,
    ) -> Result<LoginResponse, ApiError> {
        let url = self.config.endpoint_url(&self.config.login_path);

        let payload = json!({
            "identifier": identifier,
            "secret": secret.expose_secret(),
        });

        let span = info_span!("auth.login", http.method = "POST", url = %url);
        let response = with_api_key(self.http.post(&url), &self.config)
            .json(&payload)
            .send()
            .instrument(span)
            .await?;

        match response.status() {
            status if status.is_success() => Ok(response.json::<LoginResponse>().await?),
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
                debug!("login rejected: {}", response.status());
                Err(ApiError::InvalidCredentials)
            }
            _ => Err(error_from_response(response).await),
        }
    }

    /// `POST /auth/refresh-token` with the current refresh token.
    ///
    /// # Errors
    /// Returns an error on network failure or any non-success status.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ApiError> {
        let url = self.config.endpoint_url(&self.config.refresh_path);

        let span = info_span!("auth.refresh_token", http.method = "POST", url = %url);
        let response = with_api_key(self.http.post(&url), &self.config)
            .json(&json!({ "refreshToken": refresh_token }))
            .send()
            .instrument(span)
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let pair = response.json::<TokenPair>().await?;
        if pair.access_token.trim().is_empty() {
            return Err(ApiError::Parse(
                "Error parsing refresh response: no accessToken found".to_string(),
            ));
        }

        Ok(pair)
    }

    /// `GET /auth/me`. Accepts `{ "user": {...} }` or a bare user object.
    ///
    /// # Errors
    /// Returns an error on network failure, any non-success status, or an unexpected body.
    pub async fn me(&self, access_token: &str) -> Result<User, ApiError> {
        let url = self.config.endpoint_url(&self.config.me_path);

        let span = info_span!("auth.me", http.method = "GET", url = %url);
        let response = with_api_key(self.http.get(&url), &self.config)
            .bearer_auth(access_token)
            .send()
            .instrument(span)
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let body: Value = response.json().await?;
        let user = match body.get("user") {
            Some(user) if user.is_object() => user.clone(),
            _ => body,
        };

        serde_json::from_value(user)
            .map_err(|err| ApiError::Parse(format!("Error parsing /auth/me response: {err}")))
    }
}
