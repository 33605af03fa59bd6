//! Single-flight token refresh.
//!
//! Flow Overview:
//! 1. A caller records the completion epoch, then waits on the flight mutex.
//! 2. If a refresh completed while it waited, it takes that outcome and returns
//!    without touching the network.
//! 3. Otherwise it owns the cascade: up to `max_attempts` sequential attempts,
//!    retried immediately, each bounded by `attempt_timeout`.
//! 4. The mutex guard is released on every exit path, including panics and
//!    cancellation of the owning future.

use crate::error::ApiError;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Mutex as StdMutex, PoisonError,
    },
    time::Duration,
};
use tokio::{sync::Mutex, time::timeout};
use tracing::{debug, error, info, warn};

/// Result of one refresh attempt, produced by the caller-supplied closure.
#[derive(Debug)]
pub enum Attempt {
    /// A new token pair was obtained and stored.
    Refreshed,
    /// The token that was rejected has already been replaced; no call was made.
    Reused,
    /// Transient failure; the next attempt runs immediately.
    Failed(ApiError),
    /// The backend says the refresh token is dead; retrying is pointless.
    Expired(ApiError),
    /// There is no refresh token to send; no call was made.
    NoToken,
    /// A response arrived after the session it belonged to was cleared.
    /// Nothing was stored.
    Abandoned,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RefreshOutcome {
    Refreshed,
    Failed,
}

impl RefreshOutcome {
    #[must_use]
    pub fn is_refreshed(self) -> bool {
        matches!(self, Self::Refreshed)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RefreshState {
    Idle,
    Refreshing,
    Done(RefreshOutcome),
}

pub struct RefreshCoordinator {
    flight: Mutex<Option<RefreshOutcome>>,
    completed: AtomicU64,
    state: StdMutex<RefreshState>,
    failed_attempts: AtomicU32,
    network_calls: AtomicU64,
    max_attempts: u32,
    attempt_timeout: Duration,
}

impl RefreshCoordinator {
    #[must_use]
    pub fn new(max_attempts: u32, attempt_timeout: Duration) -> Self {
        Self {
            flight: Mutex::new(None),
            completed: AtomicU64::new(0),
            state: StdMutex::new(RefreshState::Idle),
            failed_attempts: AtomicU32::new(0),
            network_calls: AtomicU64::new(0),
            max_attempts: max_attempts.max(1),
            attempt_timeout,
        }
    }

    #[must_use]
    pub fn state(&self) -> RefreshState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consecutive failed attempts in the current cascade.
    #[must_use]
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts.load(Ordering::Acquire)
    }

    /// Refresh attempts that reached the attempt closure's network path.
    #[must_use]
    pub fn network_calls(&self) -> u64 {
        self.network_calls.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn reset_attempts(&self) {
        self.failed_attempts.store(0, Ordering::Release);
    }

    /// Runs a refresh cascade, or joins the one that completed while waiting.
    ///
    /// `attempt` is called with the 1-based attempt number.
    pub async fn run<F, Fut>(&self, mut attempt: F) -> RefreshOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt>,
    {
        let seen = self.completed.load(Ordering::Acquire);
        let mut last = self.flight.lock().await;

        if self.completed.load(Ordering::Acquire) != seen {
            if let Some(outcome) = *last {
                debug!(?outcome, "joined completed refresh");
                return outcome;
            }
        }

        let mut reset = StateReset {
            coordinator: self,
            armed: true,
        };
        self.set_state(RefreshState::Refreshing);
        self.reset_attempts();

        let mut outcome = RefreshOutcome::Failed;

        for number in 1..=self.max_attempts {
            let result = match timeout(self.attempt_timeout, attempt(number)).await {
                Ok(result) => result,
                Err(_) => Attempt::Failed(ApiError::Timeout(format!(
                    "refresh attempt {number} exceeded {}s",
                    self.attempt_timeout.as_secs()
                ))),
            };

            match result {
                Attempt::Refreshed => {
                    self.network_calls.fetch_add(1, Ordering::AcqRel);
                    self.reset_attempts();
                    info!(attempt = number, "access token refreshed");
                    outcome = RefreshOutcome::Refreshed;
                    break;
                }
                Attempt::Reused => {
                    self.reset_attempts();
                    debug!("access token already rotated, skipping refresh call");
                    outcome = RefreshOutcome::Refreshed;
                    break;
                }
                Attempt::Failed(err) => {
                    self.network_calls.fetch_add(1, Ordering::AcqRel);
                    let failed = self.failed_attempts.fetch_add(1, Ordering::AcqRel) + 1;
                    if failed >= self.max_attempts {
                        error!(
                            "Failed to refresh token after {} attempts: {}",
                            failed, err
                        );
                        break;
                    }
                    warn!(attempt = number, "Failed to refresh token: {}", err);
                }
                Attempt::Expired(err) => {
                    self.network_calls.fetch_add(1, Ordering::AcqRel);
                    self.failed_attempts.fetch_add(1, Ordering::AcqRel);
                    warn!("Refresh token rejected as expired: {}", err);
                    break;
                }
                Attempt::NoToken => {
                    self.failed_attempts.fetch_add(1, Ordering::AcqRel);
                    debug!("no refresh token, nothing to refresh");
                    break;
                }
                Attempt::Abandoned => {
                    self.network_calls.fetch_add(1, Ordering::AcqRel);
                    info!(attempt = number, "session ended during refresh, discarding tokens");
                    break;
                }
            }
        }

        *last = Some(outcome);
        self.completed.fetch_add(1, Ordering::AcqRel);
        self.set_state(RefreshState::Done(outcome));
        reset.armed = false;

        outcome
    }

    fn set_state(&self, state: RefreshState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Puts the coordinator back to `Idle` if a cascade is abandoned mid-flight.
struct StateReset<'a> {
    coordinator: &'a RefreshCoordinator,
    armed: bool,
}

impl Drop for StateReset<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.coordinator.set_state(RefreshState::Idle);
        }
    }
}
