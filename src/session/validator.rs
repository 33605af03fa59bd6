use crate::session::manager::SessionManager;
use std::time::Duration;
use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TickOutcome {
    /// Session is structurally invalid; no probe was made.
    Skipped,
    Valid,
    Expired,
}

/// Revalidates the session against `/auth/me` on a fixed cadence.
#[derive(Clone)]
pub struct SessionValidator {
    manager: SessionManager,
    period: Duration,
}

impl SessionValidator {
    #[must_use]
    pub fn new(manager: SessionManager, period: Duration) -> Self {
        Self { manager, period }
    }

    /// One validation pass.
    pub async fn tick(&self) -> TickOutcome {
        if !self.manager.is_session_valid() {
            debug!("session not valid, skipping validation");
            return TickOutcome::Skipped;
        }

        match self.manager.store().probe().await {
            Ok(user) => {
                debug!(user = %user.id, "session validated");
                TickOutcome::Valid
            }
            Err(err) => {
                warn!("Session validation failed: {}", err);
                if !self.manager.handle_api_error(&err) {
                    self.manager.handle_session_expired();
                }
                TickOutcome::Expired
            }
        }
    }

    /// Runs one pass immediately, then every `period`, until the store becomes
    /// unauthenticated or the handle is stopped or dropped.
    #[must_use]
    pub fn spawn(self) -> ValidatorHandle {
        let task = tokio::spawn(async move {
            let mut ticker = interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut views = self.manager.store().subscribe();

            info!(period = self.period.as_secs(), "session validator started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if self.tick().await == TickOutcome::Expired {
                            break;
                        }
                    }
                    changed = views.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }

                if !self.manager.store().is_authenticated() {
                    break;
                }
            }

            info!("session validator stopped");
        });

        ValidatorHandle { task }
    }
}

/// Owns the validator task; dropping it stops the task.
pub struct ValidatorHandle {
    task: JoinHandle<()>,
}

impl ValidatorHandle {
    pub fn stop(self) {
        self.task.abort();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits until the validator stops on its own.
    pub async fn finished(&mut self) {
        let _ = (&mut self.task).await;
    }
}

impl Drop for ValidatorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        config::ClientConfig,
        session::{AuthStore, MemoryCookieJar, MemoryStore, Persistence, SessionEvent, User},
    };
    use secrecy::SecretString;
    use serde_json::json;
    use std::{net::TcpListener, sync::Arc};
    use tokio::sync::mpsc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn can_bind_localhost() -> bool {
        TcpListener::bind("127.0.0.1:0").is_ok()
    }

    fn manager(uri: &str) -> (SessionManager, mpsc::UnboundedReceiver<SessionEvent>) {
        let config = ClientConfig::new(uri, SecretString::from("k".to_string())).unwrap();
        let persistence = Persistence::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCookieJar::new()),
            "auth-storage",
            Duration::from_secs(60),
        );
        SessionManager::new(AuthStore::new(config, persistence).unwrap())
    }

    fn sign_in(manager: &SessionManager) {
        manager.store().set_auth(
            Some(User {
                id: "1".to_string(),
                ..User::default()
            }),
            SecretString::from("a1".to_string()),
            Some(SecretString::from("r1".to_string())),
        );
    }

    #[tokio::test]
    async fn tick_skips_without_session() {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return;
        }
        let server = MockServer::start().await;
        let (manager, _events) = manager(&server.uri());

        let validator = SessionValidator::new(manager, Duration::from_secs(300));
        assert_eq!(validator.tick().await, TickOutcome::Skipped);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_probe_expires_session() {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return;
        }
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/me"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "jwt expired"})))
            .mount(&server)
            .await;

        let (manager, mut events) = manager(&server.uri());
        sign_in(&manager);

        let validator = SessionValidator::new(manager.clone(), Duration::from_secs(300));
        assert_eq!(validator.tick().await, TickOutcome::Expired);
        assert!(!manager.store().is_authenticated());
        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::Expired { .. }
        ));
    }

    #[tokio::test]
    async fn spawned_validator_probes_immediately_and_stops_on_logout() {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return;
        }
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/me"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"user": {"id": "1"}})))
            .expect(1)
            .mount(&server)
            .await;

        let (manager, _events) = manager(&server.uri());
        sign_in(&manager);

        let mut handle = SessionValidator::new(manager.clone(), Duration::from_secs(300)).spawn();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_finished());

        manager.store().logout();
        tokio::time::timeout(Duration::from_secs(2), handle.finished())
            .await
            .unwrap();
        assert!(handle.is_finished());
    }
}
