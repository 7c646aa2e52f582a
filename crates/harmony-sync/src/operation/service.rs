//! # Service Calls
//!
//! Wraps every backend call with authentication, rate-limit backoff and
//! token refresh.
//!
//! ## Retry Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        ServiceRetry::call                               │
//! │                                                                         │
//! │  no cached account? ──► authenticate_in_background()                   │
//! │          │                                                              │
//! │          ▼                                                              │
//! │  ┌──► call service ──────────────┐   (raced against cancellation)      │
//! │  │        │                      │                                      │
//! │  │        ▼                      ▼                                      │
//! │  │   RateLimitExceeded      TokenExpired (first time)                   │
//! │  │        │                      │                                      │
//! │  │   wait 1s, 2s, 4s ...    authenticate_in_background()               │
//! │  │   (give up after 60s)         │                                      │
//! │  └────────┴──────────────────────┘                                      │
//! │                                                                         │
//! │  Any other error is returned as-is.                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use harmony_core::{
    Account, AuthenticationError, FetchError, FileError, GeneralError, RecordError,
    RecordErrorKind, RecordID, ServiceError,
};

use crate::config::SyncSettings;
use crate::operation::Progress;
use crate::service::Service;

// =============================================================================
// Retryable Errors
// =============================================================================

/// Errors a service call can fail with, as seen by the retry loop.
pub trait RetryableError: Sized {
    /// What the error is about (a record, a file, nothing).
    type Context: ?Sized + Sync;

    fn is_rate_limited(&self) -> bool;

    fn is_token_expired(&self) -> bool;

    /// Wraps an authentication failure of the retry loop itself.
    fn authentication(context: &Self::Context, error: AuthenticationError) -> Self;

    fn cancelled(context: &Self::Context) -> Self;
}

impl RetryableError for RecordError {
    type Context = RecordID;

    fn is_rate_limited(&self) -> bool {
        matches!(
            self.kind,
            RecordErrorKind::Service(ServiceError::RateLimitExceeded)
        )
    }

    fn is_token_expired(&self) -> bool {
        matches!(
            self.kind,
            RecordErrorKind::Authentication(AuthenticationError::TokenExpired)
        )
    }

    fn authentication(record_id: &RecordID, error: AuthenticationError) -> Self {
        RecordError::new(record_id.clone(), error)
    }

    fn cancelled(record_id: &RecordID) -> Self {
        RecordError::cancelled(record_id.clone())
    }
}

impl RetryableError for FileError {
    type Context = str;

    fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            FileError::Service {
                source: ServiceError::RateLimitExceeded,
                ..
            }
        )
    }

    fn is_token_expired(&self) -> bool {
        matches!(
            self,
            FileError::Authentication {
                source: AuthenticationError::TokenExpired,
                ..
            }
        )
    }

    fn authentication(file_identifier: &str, source: AuthenticationError) -> Self {
        FileError::Authentication {
            file_identifier: file_identifier.to_string(),
            source,
        }
    }

    fn cancelled(file_identifier: &str) -> Self {
        FileError::Cancelled {
            file_identifier: file_identifier.to_string(),
        }
    }
}

impl RetryableError for FetchError {
    type Context = ();

    fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::Service(ServiceError::RateLimitExceeded))
    }

    fn is_token_expired(&self) -> bool {
        matches!(
            self,
            FetchError::Authentication(AuthenticationError::TokenExpired)
        )
    }

    fn authentication(_: &(), error: AuthenticationError) -> Self {
        FetchError::Authentication(error)
    }

    fn cancelled(_: &()) -> Self {
        FetchError::General(GeneralError::Cancelled)
    }
}

// =============================================================================
// Retry Policy
// =============================================================================

/// How persistent a [`ServiceRetry`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// First wait after a rate limit; doubles each time.
    pub initial_delay: Duration,

    /// Stop retrying a rate-limited call after this long.
    pub max_elapsed: Duration,

    /// Re-authenticate once when the token expires.
    pub reauthenticate: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&SyncSettings::default())
    }
}

impl From<&SyncSettings> for RetryPolicy {
    fn from(settings: &SyncSettings) -> Self {
        RetryPolicy {
            initial_delay: settings.initial_retry_delay(),
            max_elapsed: settings.max_retry_elapsed(),
            reauthenticate: settings.reauthenticate_on_token_expiry,
        }
    }
}

// =============================================================================
// Service Retry
// =============================================================================

/// A backend plus the account it is signed in with.
///
/// Clones share the service and the cached account.
#[derive(Clone)]
pub struct ServiceRetry {
    service: Arc<dyn Service>,
    account: Arc<RwLock<Option<Account>>>,
    policy: RetryPolicy,
}

impl ServiceRetry {
    pub fn new(service: Arc<dyn Service>, policy: RetryPolicy) -> Self {
        ServiceRetry {
            service,
            account: Arc::new(RwLock::new(None)),
            policy,
        }
    }

    pub fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn account(&self) -> Option<Account> {
        self.account.read().await.clone()
    }

    pub async fn set_account(&self, account: Option<Account>) {
        *self.account.write().await = account;
    }

    /// Calls the backend through `call`, retrying as described in the
    /// module docs.
    ///
    /// `context` names what the call is about so that retry-loop failures
    /// (authentication, cancellation) can be reported in the caller's error
    /// type.
    pub async fn call<T, E, F, Fut>(
        &self,
        context: &E::Context,
        progress: &Progress,
        mut call: F,
    ) -> Result<T, E>
    where
        E: RetryableError + Send,
        T: Send,
        F: FnMut(Arc<dyn Service>) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        self.ensure_authenticated()
            .await
            .map_err(|err| E::authentication(context, err))?;

        let mut backoff = self.backoff();
        let mut reauthenticated = false;

        loop {
            if progress.is_cancelled() {
                return Err(E::cancelled(context));
            }

            let result = tokio::select! {
                result = call(Arc::clone(&self.service)) => result,
                _ = progress.cancelled() => return Err(E::cancelled(context)),
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.is_rate_limited() {
                let Some(delay) = backoff.next_backoff() else {
                    warn!(
                        service = self.service.identifier(),
                        "Rate limit persisted past the retry budget"
                    );
                    return Err(err);
                };

                debug!(?delay, "Rate limited; waiting before retry");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = progress.cancelled() => return Err(E::cancelled(context)),
                }
            } else if err.is_token_expired() && self.policy.reauthenticate && !reauthenticated {
                reauthenticated = true;
                info!(service = self.service.identifier(), "Access token expired; re-authenticating");
                self.reauthenticate()
                    .await
                    .map_err(|auth| E::authentication(context, auth))?;
            } else {
                return Err(err);
            }
        }
    }

    async fn ensure_authenticated(&self) -> Result<(), AuthenticationError> {
        if self.account.read().await.is_some() {
            return Ok(());
        }
        self.reauthenticate().await.map(|_| ())
    }

    async fn reauthenticate(&self) -> Result<Account, AuthenticationError> {
        let account = self.service.authenticate_in_background().await?;
        debug!(account = %account.name, "Authenticated in background");
        *self.account.write().await = Some(account.clone());
        Ok(account)
    }

    fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.policy.initial_delay,
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_elapsed_time: Some(self.policy.max_elapsed),
            ..Default::default()
        };
        backoff.reset();
        backoff
    }
}
