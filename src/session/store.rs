//! The auth state store: the single owner and writer of the `Session`.
//!
//! Every mutation goes through `commit`, which updates memory, mirrors the
//! result to both persistence channels, and publishes a `SessionView` on a
//! watch channel, all in the same synchronous step. The session lock is a
//! plain `RwLock` and is never held across an `.await`.

use crate::{
    api::{build_http_client, AuthEndpoints},
    config::ClientConfig,
    error::ApiError,
    session::{
        manager::ExpirySignature,
        persist::Persistence,
        refresh::{Attempt, RefreshCoordinator},
        Session, SessionView, User,
    },
};
use reqwest::Client;
use secrecy::SecretString;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

#[derive(Clone)]
pub struct AuthStore {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<ClientConfig>,
    http: Client,
    endpoints: AuthEndpoints,
    persistence: Persistence,
    signature: ExpirySignature,
    coordinator: RefreshCoordinator,
    session: RwLock<Session>,
    epoch: AtomicU64,
    views: watch::Sender<SessionView>,
}

impl AuthStore {
    /// Builds an empty, unauthenticated store.
    ///
    /// # Errors
    /// Returns `ApiError::Config` if the HTTP client cannot be built or the
    /// expiry message pattern is not a valid regex.
    pub fn new(config: ClientConfig, persistence: Persistence) -> Result<Self, ApiError> {
        let http = build_http_client(&config)?;
        let signature =
            ExpirySignature::new(&config.expired_codes, &config.expired_message_pattern)?;
        let coordinator =
            RefreshCoordinator::new(config.refresh_max_attempts, config.request_timeout);
        let config = Arc::new(config);
        let endpoints = AuthEndpoints::new(http.clone(), config.clone());
        let (views, _) = watch::channel(SessionView::default());

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                http,
                endpoints,
                persistence,
                signature,
                coordinator,
                session: RwLock::new(Session::default()),
                epoch: AtomicU64::new(0),
                views,
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn http(&self) -> &Client {
        &self.inner.http
    }

    #[must_use]
    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.inner.coordinator
    }

    pub(crate) fn signature(&self) -> &ExpirySignature {
        &self.inner.signature
    }

    /// Increments every time the store goes from unauthenticated to authenticated.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn snapshot(&self) -> Session {
        self.read().clone()
    }

    #[must_use]
    pub fn view(&self) -> SessionView {
        self.read().view()
    }

    /// Reactive read of `user` and `is_authenticated`.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.inner.views.subscribe()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.read().is_authenticated
    }

    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.read().is_well_formed()
    }

    #[must_use]
    pub fn access_token(&self) -> Option<SecretString> {
        self.read().access_token.clone()
    }

    #[must_use]
    pub fn refresh_token(&self) -> Option<SecretString> {
        self.read().refresh_token.clone()
    }

    /// Restores the session persisted by a previous run. Records that fail to
    /// parse or are not well formed are discarded from both channels.
    pub fn hydrate(&self) -> bool {
        match self.inner.persistence.load() {
            Ok(Some(stored)) => {
                let session = Session::new(stored.user, stored.access_token, stored.refresh_token);
                if session.is_well_formed() {
                    self.commit(session);
                    debug!("session restored from storage");
                    true
                } else {
                    warn!("Discarding malformed persisted session");
                    self.commit(Session::default());
                    false
                }
            }
            Ok(None) => false,
            Err(err) => {
                warn!("Failed to restore persisted session: {}", err);
                self.commit(Session::default());
                false
            }
        }
    }

    /// Authenticates against `/auth/login` and stores the resulting session.
    ///
    /// # Errors
    /// Returns `ApiError::InvalidCredentials` when the backend rejects the
    /// credentials, or the underlying transport/parse error.
    #[instrument(skip(self, secret))]
    pub async fn login(&self, identifier: &str, secret: &SecretString) -> Result<Session, ApiError> {
        let response = self.inner.endpoints.login(identifier, secret).await?;

        let session = Session::new(
            Some(response.user),
            Some(SecretString::from(response.access_token)),
            Some(SecretString::from(response.refresh_token)),
        );

        if !session.is_authenticated {
            return Err(ApiError::Parse(
                "Error parsing login response: missing tokens".to_string(),
            ));
        }

        self.inner.coordinator.reset_attempts();
        self.commit(session.clone());
        info!("logged in");

        Ok(session)
    }

    /// Clears the session and both persistence channels. Always succeeds.
    pub fn logout(&self) {
        self.commit(Session::default());
    }

    /// Overwrites the session. An omitted refresh token keeps the current one.
    pub fn set_auth(
        &self,
        user: Option<User>,
        access_token: SecretString,
        refresh_token: Option<SecretString>,
    ) {
        self.update(|current| {
            let refresh_token = refresh_token.or_else(|| current.refresh_token.clone());
            Some(Session::new(user, Some(access_token), refresh_token))
        });
    }

    /// Probes `/auth/me`. Never errors; unauthenticated stores make no call.
    pub async fn validate_token(&self) -> bool {
        match self.probe().await {
            Ok(_) => true,
            Err(err) => {
                debug!("token validation failed: {}", err);
                false
            }
        }
    }

    /// `/auth/me` with the current access token.
    ///
    /// # Errors
    /// Returns `ApiError::NotAuthenticated` without a network call when there
    /// is no authenticated session, otherwise the probe's error.
    pub async fn probe(&self) -> Result<User, ApiError> {
        let token = {
            let session = self.read();
            match session.access_token() {
                Some(token) if session.is_authenticated => token.to_string(),
                _ => return Err(ApiError::NotAuthenticated),
            }
        };

        self.inner.endpoints.me(&token).await
    }

    /// Obtains a new access token through the single-flight coordinator.
    pub async fn refresh_auth_token(&self) -> bool {
        self.refresh_rejected(None).await
    }

    /// Same as `refresh_auth_token`, but skips the network call when the
    /// rejected access token has already been rotated by another caller.
    /// A terminal failure clears the session, unless a new login replaced it
    /// in the meantime.
    pub async fn refresh_rejected(&self, rejected: Option<&str>) -> bool {
        let epoch = self.epoch();
        let outcome = self
            .inner
            .coordinator
            .run(|number| self.refresh_attempt(number, rejected))
            .await;

        if !outcome.is_refreshed() {
            self.logout_epoch(epoch);
        }

        outcome.is_refreshed()
    }

    async fn refresh_attempt(&self, number: u32, rejected: Option<&str>) -> Attempt {
        let (epoch, current, refresh_token, user) = {
            let session = self.read();
            (
                self.epoch(),
                session
                    .access_token()
                    .filter(|_| session.is_authenticated)
                    .map(str::to_string),
                session.refresh_token().map(str::to_string),
                session.user.clone(),
            )
        };

        if number == 1 {
            if let (Some(rejected), Some(current)) = (rejected, current.as_deref()) {
                if rejected != current {
                    return Attempt::Reused;
                }
            }
        }

        let Some(refresh_token) = refresh_token else {
            return Attempt::NoToken;
        };

        match self.inner.endpoints.refresh(&refresh_token).await {
            Ok(pair) => {
                let access_token = SecretString::from(pair.access_token);
                let refresh_token = pair
                    .refresh_token
                    .filter(|token| !token.is_empty())
                    .map(SecretString::from);

                let stored = self.update(|session| {
                    // logout, expiration or a new login ran while the call was in flight
                    if !session.is_authenticated || self.epoch() != epoch {
                        return None;
                    }
                    let refresh_token = refresh_token.or_else(|| session.refresh_token.clone());
                    Some(Session::new(user, Some(access_token), refresh_token))
                });

                if stored {
                    Attempt::Refreshed
                } else {
                    Attempt::Abandoned
                }
            }
            // clear before the flight lock is released so late callers find no refresh token
            Err(err) if self.inner.signature.matches(&err) => {
                self.logout_epoch(epoch);
                Attempt::Expired(err)
            }
            Err(err) => {
                if number >= self.inner.coordinator.max_attempts() {
                    self.logout_epoch(epoch);
                }
                Attempt::Failed(err)
            }
        }
    }

    // clears only the session the refresh belonged to
    fn logout_epoch(&self, epoch: u64) {
        self.update(|_| (self.epoch() == epoch).then(Session::default));
    }

    fn commit(&self, session: Session) {
        self.update(|_| Some(session));
    }

    /// Applies `change` under the write lock. `None` leaves everything as is.
    fn update<F>(&self, change: F) -> bool
    where
        F: FnOnce(&Session) -> Option<Session>,
    {
        let view = {
            let mut current = self.write();
            let Some(next) = change(&current) else {
                return false;
            };

            let persisted = if next.is_authenticated {
                self.inner.persistence.persist(&next)
            } else {
                self.inner.persistence.clear()
            };
            if let Err(err) = persisted {
                warn!("Failed to mirror session to storage: {}", err);
            }

            // bumped under the lock so a check of the epoch and the session agree
            if !current.is_authenticated && next.is_authenticated {
                self.inner.epoch.fetch_add(1, Ordering::AcqRel);
            }

            *current = next;
            current.view()
        };

        self.inner.views.send_replace(view);
        true
    }

    fn read(&self) -> RwLockReadGuard<'_, Session> {
        self.inner
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Session> {
        self.inner
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::session::persist::{MemoryCookieJar, MemoryStore};
    use serde_json::json;
    use std::{net::TcpListener, time::Duration};
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn can_bind_localhost() -> bool {
        TcpListener::bind("127.0.0.1:0").is_ok()
    }

    fn memory() -> Persistence {
        Persistence::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCookieJar::new()),
            "auth-storage",
            Duration::from_secs(60),
        )
    }

    fn store_with(uri: &str, persistence: Persistence) -> AuthStore {
        let config = ClientConfig::new(uri, SecretString::from("api-key".to_string())).unwrap();
        AuthStore::new(config, persistence).unwrap()
    }

    fn store(uri: &str) -> AuthStore {
        store_with(uri, memory())
    }

    fn user() -> User {
        User {
            id: "9".to_string(),
            name: "Ops".to_string(),
            email: "ops@medfin.dev".to_string(),
            role: "admin".to_string(),
        }
    }

    fn secret(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    #[test]
    fn set_auth_keeps_prior_refresh_token() {
        let store = store("http://127.0.0.1:9");
        store.set_auth(Some(user()), secret("a1"), Some(secret("r1")));
        store.set_auth(Some(user()), secret("a2"), None);

        let session = store.snapshot();
        assert!(session.is_authenticated);
        assert_eq!(session.access_token(), Some("a2"));
        assert_eq!(session.refresh_token(), Some("r1"));
    }

    #[test]
    fn set_auth_mirrors_both_channels_and_logout_clears_them() {
        let store = store("http://127.0.0.1:9");
        store.set_auth(Some(user()), secret("a1"), Some(secret("r1")));

        let (stored, cookie) = store.inner.persistence.channels().unwrap();
        assert!(stored.is_some());
        assert_eq!(stored, cookie);

        store.logout();
        store.logout();
        assert_eq!(store.inner.persistence.channels().unwrap(), (None, None));
        assert!(!store.is_authenticated());
    }

    #[test]
    fn epoch_counts_logins_not_rotations() {
        let store = store("http://127.0.0.1:9");
        assert_eq!(store.epoch(), 0);
        store.set_auth(Some(user()), secret("a1"), Some(secret("r1")));
        store.set_auth(Some(user()), secret("a2"), Some(secret("r2")));
        assert_eq!(store.epoch(), 1);
        store.logout();
        store.set_auth(Some(user()), secret("a3"), Some(secret("r3")));
        assert_eq!(store.epoch(), 2);
    }

    #[test]
    fn subscribers_observe_changes() {
        let store = store("http://127.0.0.1:9");
        let views = store.subscribe();
        store.set_auth(Some(user()), secret("a1"), Some(secret("r1")));
        assert!(views.borrow().is_authenticated);
        store.logout();
        assert!(!views.borrow().is_authenticated);
        assert!(views.borrow().user.is_none());
    }

    #[test]
    fn hydrate_restores_and_discards() {
        let persistence = memory();
        let first = store_with("http://127.0.0.1:9", persistence.clone());
        first.set_auth(Some(user()), secret("a1"), Some(secret("r1")));

        let restored = store_with("http://127.0.0.1:9", persistence.clone());
        assert!(restored.hydrate());
        assert_eq!(restored.snapshot().access_token(), Some("a1"));
        assert_eq!(restored.epoch(), 1);

        // a record without a user is not well formed
        persistence
            .persist(&Session::new(None, Some(secret("a2")), Some(secret("r2"))))
            .unwrap();
        let discarded = store_with("http://127.0.0.1:9", persistence.clone());
        assert!(!discarded.hydrate());
        assert!(!discarded.is_authenticated());
        assert_eq!(persistence.channels().unwrap(), (None, None));
    }

    #[tokio::test]
    async fn validate_token_short_circuits_when_unauthenticated() {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return;
        }
        let server = MockServer::start().await;
        let store = store(&server.uri());

        assert!(!store.validate_token().await);

        let requests = server.received_requests().await.unwrap();
        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn validate_token_collapses_failures_to_false() {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return;
        }
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/auth/me"))
            .and(header("authorization", "Bearer good"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"user": {"id": "9"}})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/auth/me"))
            .and(header("authorization", "Bearer bad"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let store = store(&server.uri());
        store.set_auth(Some(user()), secret("good"), Some(secret("r1")));
        assert!(store.validate_token().await);

        store.set_auth(Some(user()), secret("bad"), None);
        assert!(!store.validate_token().await);
    }

    #[tokio::test]
    async fn login_persists_session() {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return;
        }
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "accessToken": "a1",
                "refreshToken": "r1",
                "user": {"id": "9", "name": "Ops", "email": "ops@medfin.dev", "role": "admin"}
            })))
            .mount(&server)
            .await;

        let store = store(&server.uri());
        let session = store.login("ops@medfin.dev", &secret("pw")).await.unwrap();
        assert!(session.is_authenticated);
        assert_eq!(store.snapshot().user, Some(user()));

        let (stored, cookie) = store.inner.persistence.channels().unwrap();
        assert_eq!(stored, cookie);
        assert!(stored.unwrap().contains("\"refreshToken\":\"r1\""));
    }

    #[tokio::test]
    async fn refresh_rotates_both_tokens() {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return;
        }
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/refresh-token"))
            .and(body_json(json!({"refreshToken": "r1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "accessToken": "a2",
                "refreshToken": "r2"
            })))
            .mount(&server)
            .await;

        let store = store(&server.uri());
        store.set_auth(Some(user()), secret("a1"), Some(secret("r1")));

        assert!(store.refresh_auth_token().await);
        let session = store.snapshot();
        assert_eq!(session.access_token(), Some("a2"));
        assert_eq!(session.refresh_token(), Some("r2"));
        assert_eq!(session.user, Some(user()));
        assert_eq!(store.coordinator().failed_attempts(), 0);
    }

    #[tokio::test]
    async fn refresh_skips_network_when_token_already_rotated() {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return;
        }
        let server = MockServer::start().await;
        let store = store(&server.uri());
        store.set_auth(Some(user()), secret("a2"), Some(secret("r2")));

        assert!(store.refresh_rejected(Some("a1")).await);

        let requests = server.received_requests().await.unwrap();
        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn terminal_refresh_failure_clears_session() {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return;
        }
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/refresh-token"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = store(&server.uri());
        store.set_auth(Some(user()), secret("a1"), Some(secret("r1")));

        assert!(!store.refresh_auth_token().await);
        assert!(!store.is_authenticated());
        assert_eq!(store.coordinator().failed_attempts(), 3);

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 3);
    }

    #[tokio::test]
    async fn logout_during_refresh_keeps_session_cleared() {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return;
        }
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/refresh-token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"accessToken": "a2", "refreshToken": "r2"}))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        let store = store(&server.uri());
        store.set_auth(Some(user()), secret("a1"), Some(secret("r1")));

        let refreshing = {
            let store = store.clone();
            tokio::spawn(async move { store.refresh_auth_token().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.logout();

        assert!(!refreshing.await.unwrap());
        assert!(!store.is_authenticated());
        assert!(store.access_token().is_none());
        assert_eq!(store.inner.persistence.channels().unwrap(), (None, None));
        assert_eq!(store.epoch(), 1);
        assert_eq!(store.coordinator().network_calls(), 1);
    }

    #[tokio::test]
    async fn refresh_finishing_after_relogin_leaves_new_session_alone() {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return;
        }
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/refresh-token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"accessToken": "a2", "refreshToken": "r2"}))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        let store = store(&server.uri());
        store.set_auth(Some(user()), secret("a1"), Some(secret("r1")));

        let refreshing = {
            let store = store.clone();
            tokio::spawn(async move { store.refresh_auth_token().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.logout();
        store.set_auth(Some(user()), secret("b1"), Some(secret("s1")));

        assert!(!refreshing.await.unwrap());
        let session = store.snapshot();
        assert!(session.is_authenticated);
        assert_eq!(session.access_token(), Some("b1"));
        assert_eq!(session.refresh_token(), Some("s1"));
    }

    #[test]
    fn failing_cookie_jar_never_leaves_channels_disagreeing() {
        use crate::session::persist::{CookieJar, SessionCookie};
        use std::sync::atomic::AtomicUsize;

        struct OneShotJar {
            inner: MemoryCookieJar,
            writes: AtomicUsize,
        }

        impl CookieJar for OneShotJar {
            fn get(&self, name: &str) -> Result<Option<SessionCookie>, ApiError> {
                self.inner.get(name)
            }

            fn set(&self, cookie: SessionCookie) -> Result<(), ApiError> {
                if self.writes.fetch_add(1, Ordering::SeqCst) > 0 {
                    return Err(ApiError::Storage("disk full".to_string()));
                }
                self.inner.set(cookie)
            }

            fn remove(&self, name: &str) -> Result<(), ApiError> {
                self.inner.remove(name)
            }
        }

        let persistence = Persistence::new(
            Arc::new(MemoryStore::new()),
            Arc::new(OneShotJar {
                inner: MemoryCookieJar::new(),
                writes: AtomicUsize::new(0),
            }),
            "auth-storage",
            Duration::from_secs(60),
        );
        let store = store_with("http://127.0.0.1:9", persistence.clone());

        store.set_auth(Some(user()), secret("a1"), Some(secret("r1")));
        store.set_auth(Some(user()), secret("a2"), Some(secret("r2")));

        let (stored, cookie) = persistence.channels().unwrap();
        assert_eq!(stored, cookie);
        assert!(stored.is_none());
        // memory still holds the rotated pair
        assert_eq!(store.snapshot().access_token(), Some("a2"));
    }
}
