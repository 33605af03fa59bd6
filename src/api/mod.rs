//! HTTP plumbing for the back-office API.
//!
//! `auth` holds the three raw authentication calls (login, refresh, me). They
//! never go through the recovering pipeline, so a 401 from the refresh
//! endpoint cannot trigger another refresh. `client` is the pipeline every
//! business call goes through.

pub mod auth;
pub mod client;

pub use self::auth::{AuthEndpoints, LoginResponse, TokenPair};
pub use self::client::{ApiClient, ApiRequest, ApiResponse};

use crate::{
    config::ClientConfig,
    error::{sanitize_body, ApiError},
    APP_USER_AGENT,
};
use reqwest::{Client, RequestBuilder, Response};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::Value;

/// Builds the shared reqwest client with the configured request timeout.
///
/// # Errors
/// Returns `ApiError::Config` if the TLS backend cannot be initialized.
pub fn build_http_client(config: &ClientConfig) -> Result<Client, ApiError> {
    Client::builder()
        .user_agent(APP_USER_AGENT)
        .timeout(config.request_timeout)
        .build()
        .map_err(|err| ApiError::Config(format!("Failed to build HTTP client: {err}")))
}

/// Attaches the static API key header.
pub(crate) fn with_api_key(builder: RequestBuilder, config: &ClientConfig) -> RequestBuilder {
    let key = config.api_key.expose_secret();
    if key.is_empty() {
        builder
    } else {
        builder.header(config.api_key_header.as_str(), key)
    }
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Turns a non-success response into `ApiError::Http`, keeping the backend
/// error code when the body carries one.
pub(crate) async fn error_from_response(response: Response) -> ApiError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    parse_error_body(status, &body)
}

pub(crate) fn parse_error_body(status: u16, body: &str) -> ApiError {
    let parsed = serde_json::from_str::<ErrorBody>(body).unwrap_or_default();

    let code = parsed.code.and_then(|code| match code {
        Value::String(code) if !code.trim().is_empty() => Some(code.trim().to_string()),
        Value::Number(code) => Some(code.to_string()),
        _ => None,
    });

    let message = parsed
        .message
        .or(parsed.error)
        .filter(|message| !message.trim().is_empty())
        .map_or_else(|| sanitize_body(body), |message| sanitize_body(&message));

    ApiError::Http {
        status,
        code,
        message,
    }
}
