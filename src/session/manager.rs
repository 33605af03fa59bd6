//! Session-fatal error classification and the terminal expiration action.

use crate::{error::ApiError, session::store::AuthStore};
use regex::Regex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Navigation requests emitted when a session ends involuntarily.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Expired { redirect_to: String },
    Invalidated { redirect_to: String },
}

impl SessionEvent {
    #[must_use]
    pub fn redirect_to(&self) -> &str {
        match self {
            Self::Expired { redirect_to } | Self::Invalidated { redirect_to } => redirect_to,
        }
    }
}

/// Recognizes a backend response saying the refresh token itself is dead.
#[derive(Clone, Debug)]
pub(crate) struct ExpirySignature {
    codes: Vec<String>,
    message: Regex,
}

impl ExpirySignature {
    pub(crate) fn new(codes: &[String], pattern: &str) -> Result<Self, ApiError> {
        let message = Regex::new(pattern).map_err(|err| {
            ApiError::Config(format!("invalid expired message pattern {pattern}: {err}"))
        })?;

        Ok(Self {
            codes: codes.iter().map(|code| code.trim().to_string()).collect(),
            message,
        })
    }

    /// Any HTTP error whose code or message carries the signature.
    pub(crate) fn matches(&self, err: &ApiError) -> bool {
        let ApiError::Http { code, message, .. } = err else {
            return false;
        };

        code.as_deref()
            .is_some_and(|code| self.codes.iter().any(|known| known.eq_ignore_ascii_case(code)))
            || self.message.is_match(message)
    }
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: AuthStore,
    events: mpsc::UnboundedSender<SessionEvent>,
    // session epoch whose expiration already ran
    handled_epoch: AtomicU64,
}

impl SessionManager {
    #[must_use]
    pub fn new(store: AuthStore) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();

        (
            Self {
                inner: Arc::new(Inner {
                    store,
                    events: tx,
                    handled_epoch: AtomicU64::new(u64::MAX),
                }),
            },
            rx,
        )
    }

    #[must_use]
    pub fn store(&self) -> &AuthStore {
        &self.inner.store
    }

    /// Structural validity only; never touches the network.
    #[must_use]
    pub fn is_session_valid(&self) -> bool {
        self.inner.store.is_well_formed()
    }

    /// Returns true when `err` is a 401 carrying the refresh-token-expired
    /// signature, after running the expiration path.
    pub fn handle_api_error(&self, err: &ApiError) -> bool {
        if !err.is_unauthorized() || !self.inner.store.signature().matches(err) {
            return false;
        }

        debug!("refresh token expired: {}", err);
        self.handle_session_expired();
        true
    }

    /// Clears the session and emits `SessionEvent::Expired`. Runs at most once
    /// per session epoch; returns whether this call did the work.
    pub fn handle_session_expired(&self) -> bool {
        let epoch = self.inner.store.epoch();
        if self.inner.handled_epoch.swap(epoch, Ordering::AcqRel) == epoch {
            debug!(epoch, "session expiration already handled");
            return false;
        }

        self.inner.store.logout();
        info!(epoch, "session expired");
        self.emit(SessionEvent::Expired {
            redirect_to: self.redirect_to(),
        });

        true
    }

    /// Same clearing effect as expiration, without error classification.
    pub fn clear_invalid_session(&self) {
        let epoch = self.inner.store.epoch();
        self.inner.handled_epoch.store(epoch, Ordering::Release);

        self.inner.store.logout();
        info!(epoch, "invalid session cleared");
        self.emit(SessionEvent::Invalidated {
            redirect_to: self.redirect_to(),
        });
    }

    /// Runs the single-flight refresh for a request rejected with `rejected`,
    /// expiring the session when the cascade fails.
    pub async fn refresh_or_expire(&self, rejected: Option<&str>) -> bool {
        if self.inner.store.refresh_rejected(rejected).await {
            return true;
        }

        self.handle_session_expired();
        false
    }

    fn redirect_to(&self) -> String {
        self.inner.store.config().login_redirect.clone()
    }

    fn emit(&self, event: SessionEvent) {
        if self.inner.events.send(event).is_err() {
            warn!("Session event receiver dropped");
        }
    }
}
