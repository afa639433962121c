//! Remote issue source abstraction.
//!
//! An [`IssueSource`] translates wire responses into [`RawIssue`] pages and
//! classifies failures; it does not retry. [`GuardedSource`] wraps any
//! source with the token-bucket rate limit and the retry policy, so the
//! orchestrator sees either a page or a final error.
//!
//! ```text
//! SyncOrchestrator ──▶ GuardedSource ──▶ TokenBucket::acquire
//!                          │        └──▶ RetryPolicy::delay_for
//!                          ▼
//!                      IssueSource (JiraSource, test doubles)
//! ```

pub mod jira;
pub mod rate_limit;
pub mod retry;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use jira_mirror_core::models::{QueryScope, RawIssue};
use thiserror::Error;
use tracing::{info, warn};

use self::rate_limit::TokenBucket;
use self::retry::RetryPolicy;

/// One page of remote records.
#[derive(Debug, Clone, Default)]
pub struct SourcePage {
    pub issues: Vec<RawIssue>,
    /// Cursor of the next page, `None` at the end of the scope.
    pub next_cursor: Option<u64>,
    /// Total records in the scope, when the remote reports it.
    pub total: Option<u64>,
}

/// The identity the source authenticated as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceIdentity {
    pub name: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    /// Credentials rejected. Never retried.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Timeout, 5xx, rate-limit rejection or a dropped connection.
    #[error("transient failure: {reason}")]
    Transient {
        reason: String,
        /// Minimum wait the remote asked for.
        retry_after: Option<Duration>,
    },

    /// A non-retryable, non-auth rejection (bad scope query, 404, ...).
    #[error("request rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("gave up after {attempts} attempts: {reason}")]
    Exhausted { attempts: u32, reason: String },
}

/// A paginated remote issue source.
///
/// `scope` is forwarded to the remote as-is. Cursors are opaque to callers
/// apart from being persisted in the checkpoint.
#[async_trait]
pub trait IssueSource: Send + Sync {
    async fn fetch_page(
        &self,
        scope: &QueryScope,
        cursor: Option<u64>,
        page_size: usize,
    ) -> Result<SourcePage, SourceError>;

    /// The issues among `keys` that the remote still returns for `scope`.
    /// Keys that are gone, or have left the scope, are simply absent.
    async fn fetch_keys(
        &self,
        scope: &QueryScope,
        keys: &[String],
    ) -> Result<Vec<RawIssue>, SourceError>;

    /// Who the configured credentials belong to.
    async fn whoami(&self) -> Result<SourceIdentity, SourceError>;
}

/// Rate-limited, retrying wrapper around an [`IssueSource`].
pub struct GuardedSource<S> {
    inner: S,
    bucket: TokenBucket,
    policy: RetryPolicy,
}

impl<S: IssueSource> GuardedSource<S> {
    pub fn new(inner: S, rate_per_minute: u32, policy: RetryPolicy) -> Self {
        Self {
            inner,
            bucket: TokenBucket::per_minute(rate_per_minute),
            policy,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Fetch one page, blocking on the rate limiter and retrying transient
    /// failures. Auth and rejection errors return immediately.
    pub async fn fetch_page(
        &self,
        scope: &QueryScope,
        cursor: Option<u64>,
        page_size: usize,
    ) -> Result<SourcePage, SourceError> {
        self.guarded(&format!("page {:?}", cursor), move || {
            self.inner.fetch_page(scope, cursor, page_size)
        })
        .await
    }

    /// Look up specific keys, with the same rate limit and retries as
    /// [`GuardedSource::fetch_page`].
    pub async fn fetch_keys(
        &self,
        scope: &QueryScope,
        keys: &[String],
    ) -> Result<Vec<RawIssue>, SourceError> {
        self.guarded(&format!("{} keys", keys.len()), move || {
            self.inner.fetch_keys(scope, keys)
        })
        .await
    }

    async fn guarded<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.bucket.acquire().await;
            match call().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(request = what, attempt, "source request succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(SourceError::Transient {
                    reason,
                    retry_after,
                }) => {
                    if attempt >= self.policy.max_attempts {
                        return Err(SourceError::Exhausted {
                            attempts: attempt,
                            reason,
                        });
                    }
                    let delay = self
                        .policy
                        .delay_for(attempt)
                        .max(retry_after.unwrap_or_default());
                    warn!(
                        request = what,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "transient source failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(other) => return Err(other),
            }
        }
    }

    pub async fn whoami(&self) -> Result<SourceIdentity, SourceError> {
        self.bucket.acquire().await;
        self.inner.whoami().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jira_mirror_core::models::ScopeBase;
    use std::sync::Mutex;

    struct Flaky {
        failures: Mutex<Vec<SourceError>>,
        calls: Mutex<u32>,
    }

    impl Flaky {
        fn new(mut failures: Vec<SourceError>) -> Self {
            failures.reverse();
            Self {
                failures: Mutex::new(failures),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl IssueSource for Flaky {
        async fn fetch_page(
            &self,
            _scope: &QueryScope,
            _cursor: Option<u64>,
            _page_size: usize,
        ) -> Result<SourcePage, SourceError> {
            *self.calls.lock().unwrap() += 1;
            match self.failures.lock().unwrap().pop() {
                Some(e) => Err(e),
                None => Ok(SourcePage::default()),
            }
        }

        async fn fetch_keys(
            &self,
            _scope: &QueryScope,
            _keys: &[String],
        ) -> Result<Vec<RawIssue>, SourceError> {
            *self.calls.lock().unwrap() += 1;
            match self.failures.lock().unwrap().pop() {
                Some(e) => Err(e),
                None => Ok(Vec::new()),
            }
        }

        async fn whoami(&self) -> Result<SourceIdentity, SourceError> {
            Ok(SourceIdentity {
                name: "bot".into(),
                display_name: None,
            })
        }
    }

    fn transient() -> SourceError {
        SourceError::Transient {
            reason: "503".into(),
            retry_after: None,
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: false,
        }
    }

    fn scope() -> QueryScope {
        QueryScope::new(ScopeBase::Project("PROJ".into()))
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let source = GuardedSource::new(Flaky::new(vec![transient(), transient()]), 6000, policy(3));
        assert!(source.fetch_page(&scope(), Some(0), 10).await.is_ok());
        assert_eq!(*source.inner().calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let source = GuardedSource::new(
            Flaky::new(vec![transient(), transient(), transient()]),
            6000,
            policy(2),
        );
        let err = source.fetch_page(&scope(), None, 10).await.unwrap_err();
        assert!(matches!(err, SourceError::Exhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_auth_is_not_retried() {
        let source = GuardedSource::new(
            Flaky::new(vec![SourceError::Auth("401".into())]),
            6000,
            policy(5),
        );
        let err = source.fetch_page(&scope(), None, 10).await.unwrap_err();
        assert!(matches!(err, SourceError::Auth(_)));
        assert_eq!(*source.inner().calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_key_lookups_are_retried_too() {
        let source = GuardedSource::new(Flaky::new(vec![transient()]), 6000, policy(3));
        let found = source.fetch_keys(&scope(), &["PROJ-1".into()]).await.unwrap();
        assert!(found.is_empty());
        assert_eq!(*source.inner().calls.lock().unwrap(), 2);
    }
}
