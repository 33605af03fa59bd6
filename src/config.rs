//! Client configuration for the session layer. Values come from the CLI (flags
//! with `MEDFIN_*` environment fallbacks) or are built directly by embedding
//! code. The API key is the only secret held here.

use crate::error::ApiError;
use secrecy::SecretString;
use std::time::Duration;
use url::Url;

/// Default request timeout applied to every call, including refresh and probe.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Consecutive refresh attempts before a cascade is terminal.
pub const DEFAULT_REFRESH_ATTEMPTS: u32 = 3;
/// Period of the background session validator.
pub const DEFAULT_VALIDATION_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Lifetime of the session cookie.
pub const DEFAULT_COOKIE_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const DEFAULT_STORAGE_KEY: &str = "auth-storage";
pub const DEFAULT_API_KEY_HEADER: &str = "x-api-key";
pub const DEFAULT_EXPIRED_PATTERN: &str = r"(?i)refresh[\s_-]*token[\s_-]*(has[\s_-]*)?expired";

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub api_key: SecretString,
    pub api_key_header: String,
    pub login_path: String,
    pub refresh_path: String,
    pub me_path: String,
    pub request_timeout: Duration,
    pub refresh_max_attempts: u32,
    pub validation_interval: Duration,
    pub storage_key: String,
    pub cookie_max_age: Duration,
    pub login_redirect: String,
    /// Backend error codes that mean the refresh token itself is dead.
    pub expired_codes: Vec<String>,
    /// Message pattern that means the same when no code is sent.
    pub expired_message_pattern: String,
}

impl ClientConfig {
    /// Builds a config with defaults for everything but the base URL and API key.
    ///
    /// # Errors
    /// Returns `ApiError::Config` if the base URL is not an absolute http(s) URL.
    pub fn new(api_base_url: &str, api_key: SecretString) -> Result<Self, ApiError> {
        let api_base_url = normalize_base_url(api_base_url)?;

        Ok(Self {
            api_base_url,
            api_key,
            api_key_header: DEFAULT_API_KEY_HEADER.to_string(),
            login_path: "/auth/login".to_string(),
            refresh_path: "/auth/refresh-token".to_string(),
            me_path: "/auth/me".to_string(),
            request_timeout: DEFAULT_TIMEOUT,
            refresh_max_attempts: DEFAULT_REFRESH_ATTEMPTS,
            validation_interval: DEFAULT_VALIDATION_INTERVAL,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            cookie_max_age: DEFAULT_COOKIE_MAX_AGE,
            login_redirect: "/login".to_string(),
            expired_codes: vec![
                "REFRESH_TOKEN_EXPIRED".to_string(),
                "INVALID_REFRESH_TOKEN".to_string(),
            ],
            expired_message_pattern: DEFAULT_EXPIRED_PATTERN.to_string(),
        })
    }

    /// Joins the base URL and a request path.
    #[must_use]
    pub fn endpoint_url(&self, path: &str) -> String {
        build_url_with_base(&self.api_base_url, path)
    }

    /// True when `path` targets the login or refresh endpoint, which must never
    /// trigger a refresh of their own.
    #[must_use]
    pub fn is_auth_endpoint(&self, path: &str) -> bool {
        let path = strip_query(path);
        same_path(path, &self.login_path) || same_path(path, &self.refresh_path)
    }
}

fn normalize_base_url(raw: &str) -> Result<String, ApiError> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed)
        .map_err(|err| ApiError::Config(format!("invalid API base URL {trimmed}: {err}")))?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(ApiError::Config(format!(
                "invalid API base URL: unsupported scheme {scheme}"
            )))
        }
    }

    if url.host().is_none() {
        return Err(ApiError::Config(
            "invalid API base URL: no host specified".to_string(),
        ));
    }

    Ok(trimmed.trim_end_matches('/').to_string())
}

fn build_url_with_base(base_url: &str, path: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    let path = path.trim();

    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }

    if base.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", base, path.trim_start_matches('/'))
    }
}

fn strip_query(path: &str) -> &str {
    path.split(['?', '#']).next().unwrap_or(path)
}

fn same_path(left: &str, right: &str) -> bool {
    let left = left.trim().trim_matches('/');
    let right = right.trim().trim_matches('/');
    left == right || left.ends_with(&format!("/{right}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClientConfig {
        ClientConfig::new("https://api.medfin.dev/", SecretString::from("key".to_string()))
            .unwrap()
    }

    #[test]
    fn new_trims_trailing_slash() {
        assert_eq!(config().api_base_url, "https://api.medfin.dev");
    }

    #[test]
    fn new_rejects_unsupported_scheme() {
        let err = ClientConfig::new("ftp://api.medfin.dev", SecretString::default())
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.contains("unsupported scheme"));
    }

    #[test]
    fn new_rejects_relative_url() {
        assert!(ClientConfig::new("/api", SecretString::default()).is_err());
    }

    #[test]
    fn endpoint_url_joins_paths() {
        let config = config();
        assert_eq!(
            config.endpoint_url("/applications"),
            "https://api.medfin.dev/applications"
        );
        assert_eq!(
            config.endpoint_url("contracts?page=2"),
            "https://api.medfin.dev/contracts?page=2"
        );
        assert_eq!(
            config.endpoint_url("https://other.host/x"),
            "https://other.host/x"
        );
    }

    #[test]
    fn auth_endpoints_are_detected() {
        let config = config();
        assert!(config.is_auth_endpoint("/auth/login"));
        assert!(config.is_auth_endpoint("auth/refresh-token/"));
        assert!(config.is_auth_endpoint("/auth/refresh-token?x=1"));
        assert!(!config.is_auth_endpoint("/auth/me"));
        assert!(!config.is_auth_endpoint("/payments"));
    }
}
