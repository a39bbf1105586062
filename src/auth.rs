use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use http::StatusCode;

use crate::config::RequestConfig;
use crate::error::Error;

type AuthPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Refreshes credentials after an auth failure.
///
/// Resolving to `true` re-issues the call; `false` lets the failure surface.
/// The handler usually stores the fresh credential somewhere a request
/// interceptor picks it up, since re-issued attempts run the request chain
/// again.
pub trait AuthRefreshHandler: Send + Sync {
    fn refresh(&self, error: Error, config: RequestConfig) -> BoxFuture<'static, bool>;
}

impl<F, Fut> AuthRefreshHandler for F
where
    F: Fn(Error, RequestConfig) -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send + 'static,
{
    fn refresh(&self, error: Error, config: RequestConfig) -> BoxFuture<'static, bool> {
        Box::pin(self(error, config))
    }
}

/// Handler-driven re-issue for credential refresh flows.
///
/// Independent of [`RetryPolicy`](crate::RetryPolicy): re-issues are counted
/// on the request config, never against the generic retry budget.
#[derive(Clone)]
pub struct AuthRetryPolicy {
    statuses: BTreeSet<u16>,
    max_attempts: usize,
    predicate: Option<AuthPredicate>,
    handler: Arc<dyn AuthRefreshHandler>,
}

impl std::fmt::Debug for AuthRetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AuthRetryPolicy")
            .field("statuses", &self.statuses)
            .field("max_attempts", &self.max_attempts)
            .field("predicate", &self.predicate.is_some())
            .finish_non_exhaustive()
    }
}

impl AuthRetryPolicy {
    /// Retry once on `401 Unauthorized`.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Error, RequestConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self::with_handler(Arc::new(handler))
    }

    pub fn with_handler(handler: Arc<dyn AuthRefreshHandler>) -> Self {
        Self {
            statuses: BTreeSet::from([StatusCode::UNAUTHORIZED.as_u16()]),
            max_attempts: 1,
            predicate: None,
            handler,
        }
    }

    pub fn statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Extra filter on failures whose status already matched.
    pub fn predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Whether the failure's status is one this policy handles.
    pub(crate) fn covers_status(&self, error: &Error) -> bool {
        error
            .status()
            .is_some_and(|status| self.statuses.contains(&status.as_u16()))
    }

    /// Full gate: matching status, predicate and remaining attempts.
    pub(crate) fn should_refresh(&self, error: &Error, config: &RequestConfig) -> bool {
        if !self.covers_status(error) {
            return false;
        }
        if let Some(predicate) = &self.predicate
            && !predicate(error)
        {
            return false;
        }
        config.auth_retry_count() < self.max_attempts
    }

    pub(crate) fn refresh(&self, error: Error, config: RequestConfig) -> BoxFuture<'static, bool> {
        self.handler.refresh(error, config)
    }
}
