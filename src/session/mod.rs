//! Session state for the back-office client.
//!
//! Flow Overview:
//! 1. `AuthStore` owns the single `Session` value and its `Persistence` mirror.
//! 2. `api::ApiClient` reads tokens from the store on every request.
//! 3. On 401 the client asks the `RefreshCoordinator` (through the store) for a
//!    new token pair; only one refresh runs at a time.
//! 4. `SessionManager` classifies session-fatal errors and performs the one
//!    terminal action: clear everything and emit a redirect event.
//! 5. `SessionValidator` probes `/auth/me` on a timer while authenticated.

pub mod manager;
pub mod persist;
pub mod refresh;
pub mod store;
pub mod validator;

pub use self::manager::{SessionEvent, SessionManager};
pub use self::persist::{
    CookieJar, FileCookieJar, FileStore, KeyValueStore, MemoryCookieJar, MemoryStore, Persistence,
    SessionCookie,
};
pub use self::refresh::{RefreshCoordinator, RefreshOutcome, RefreshState};
pub use self::store::AuthStore;
pub use self::validator::{SessionValidator, TickOutcome, ValidatorHandle};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};

/// Authenticated back-office user as returned by `/auth/login` and `/auth/me`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(alias = "userId", deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, alias = "displayName")]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub role: String,
}

/// The one session value owned by `AuthStore`.
///
/// `is_authenticated` implies both tokens are present and non-empty; the store
/// is the only writer and keeps that invariant.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default, with = "secret_field")]
    pub access_token: Option<SecretString>,
    #[serde(default, with = "secret_field")]
    pub refresh_token: Option<SecretString>,
    #[serde(default)]
    pub is_authenticated: bool,
}

impl Session {
    /// Builds a session, deriving the authenticated flag from the tokens.
    #[must_use]
    pub fn new(
        user: Option<User>,
        access_token: Option<SecretString>,
        refresh_token: Option<SecretString>,
    ) -> Self {
        let access_token = access_token.filter(|token| !token.expose_secret().is_empty());
        let refresh_token = refresh_token.filter(|token| !token.expose_secret().is_empty());
        let is_authenticated = access_token.is_some() && refresh_token.is_some();

        Self {
            user,
            access_token,
            refresh_token,
            is_authenticated,
        }
    }

    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_ref().map(ExposeSecret::expose_secret)
    }

    #[must_use]
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_ref().map(ExposeSecret::expose_secret)
    }

    /// Structural check only: flag set, user present, tokens well-formed.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        let token_ok = |token: Option<&str>| {
            token.is_some_and(|t| !t.is_empty() && !t.chars().any(char::is_whitespace))
        };

        self.is_authenticated
            && self.user.as_ref().is_some_and(|user| !user.id.trim().is_empty())
            && token_ok(self.access_token())
            && token_ok(self.refresh_token())
    }

    /// Read-only projection for route guards and display.
    #[must_use]
    pub fn view(&self) -> SessionView {
        SessionView {
            user: self.user.clone(),
            is_authenticated: self.is_authenticated,
        }
    }
}

/// What UI code is allowed to observe about the session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionView {
    pub user: Option<User>,
    pub is_authenticated: bool,
}

mod secret_field {
    use secrecy::{ExposeSecret, SecretString};
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        value: &Option<SecretString>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(secret) => serializer.serialize_some(secret.expose_secret()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<SecretString>, D::Error> {
        let value = Option::<String>::deserialize(deserializer)?;
        Ok(value
            .filter(|token| !token.is_empty())
            .map(SecretString::from))
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(text) => text,
        Id::Number(number) => number.to_string(),
    })
}
