//! # Medfin (back-office session layer)
//!
//! `medfin` keeps a back-office user's bearer-token session alive across an
//! unreliable and possibly concurrent sequence of API calls.
//!
//! ## Session lifecycle
//!
//! - **Store:** `session::AuthStore` owns the one `Session` value and mirrors
//!   every change to a keyed store and a cookie through a single persist path.
//! - **Pipeline:** `api::ApiClient` attaches the API key and bearer token to
//!   every request. A 401 triggers one refresh and one retry.
//! - **Single-flight refresh:** `session::RefreshCoordinator` runs at most one
//!   refresh at a time. Callers that arrive while it runs share its outcome.
//!   Three consecutive failures end the session.
//! - **Expiration:** `session::SessionManager` clears the session and emits a
//!   redirect event exactly once per session.
//! - **Validation:** `session::SessionValidator` probes `/auth/me` on a timer.
//!
//! ## Gatekeeper
//!
//! `gatekeeper` is an axum middleware that reads the session cookie and guards
//! server-rendered routes.

pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod gatekeeper;
pub mod session;

pub use self::config::ClientConfig;
pub use self::error::ApiError;

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
