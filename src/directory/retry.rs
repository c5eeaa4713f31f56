//! Retry with exponential backoff for throttled and transient directory calls.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::models::{
    AccessReviewCycle, AccessReviewSummary, EligibilityGrant, EligibilityRequest,
    IdempotencyKey, Namespace, PolicyId, PolicyRule, RoleDefinition, Scope,
};
use super::DirectoryClient;
use crate::config::RetryConfig;
use crate::error::DirectoryError;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(800),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_secs(config.max_delay_seconds),
        }
    }

    /// A policy that never waits, for exercising retry paths quickly.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Computed delay after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Delay before the next attempt, honoring a server-provided hint.
    pub fn delay_for(&self, error: &DirectoryError, attempt: u32) -> Duration {
        match error {
            DirectoryError::Throttled {
                retry_after: Some(hint),
            } => (*hint).min(self.max_delay),
            _ => self.backoff(attempt),
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, DirectoryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DirectoryError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", operation, attempt);
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(&err, attempt);
                    warn!(
                        "{} failed ({}), retry {}/{} after {:?}",
                        operation,
                        err,
                        attempt,
                        self.max_attempts - 1,
                        delay
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) if err.is_retryable() => {
                    return Err(DirectoryError::Unknown(format!(
                        "{} failed after {} attempts: {}",
                        operation, attempt, err
                    )));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Decorates a directory client with retries on every call.
pub struct RetryingDirectory<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C> RetryingDirectory<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: DirectoryClient> DirectoryClient for RetryingDirectory<C> {
    async fn resolve_principal(&self, identifier: &str) -> Result<Option<String>, DirectoryError> {
        self.policy
            .run("resolve principal", || self.inner.resolve_principal(identifier))
            .await
    }

    async fn find_role_definition(
        &self,
        name: &str,
        namespace: Namespace,
        scope: &Scope,
    ) -> Result<Option<RoleDefinition>, DirectoryError> {
        self.policy
            .run("find role definition", || {
                self.inner.find_role_definition(name, namespace, scope)
            })
            .await
    }

    async fn get_policy_id(
        &self,
        role: &RoleDefinition,
        scope: &Scope,
    ) -> Result<Option<PolicyId>, DirectoryError> {
        self.policy
            .run("get policy id", || self.inner.get_policy_id(role, scope))
            .await
    }

    async fn get_policy_rules(&self, policy: &PolicyId) -> Result<Vec<PolicyRule>, DirectoryError> {
        self.policy
            .run("get policy rules", || self.inner.get_policy_rules(policy))
            .await
    }

    async fn update_policy_rule(
        &self,
        policy: &PolicyId,
        rule: &PolicyRule,
    ) -> Result<(), DirectoryError> {
        // Rule updates are full replacements, so repeating one is harmless.
        self.policy
            .run("update policy rule", || self.inner.update_policy_rule(policy, rule))
            .await
    }

    async fn list_eligibility(
        &self,
        principal_id: &str,
        role: &RoleDefinition,
        scope: &Scope,
    ) -> Result<Option<EligibilityGrant>, DirectoryError> {
        self.policy
            .run("list eligibility", || {
                self.inner.list_eligibility(principal_id, role, scope)
            })
            .await
    }

    async fn create_eligibility(
        &self,
        request: &EligibilityRequest,
        key: IdempotencyKey,
    ) -> Result<(), DirectoryError> {
        self.policy
            .run("create eligibility", || self.inner.create_eligibility(request, key))
            .await
    }

    async fn list_access_review(
        &self,
        name: &str,
    ) -> Result<Option<AccessReviewSummary>, DirectoryError> {
        self.policy
            .run("list access review", || self.inner.list_access_review(name))
            .await
    }

    async fn create_access_review(
        &self,
        cycle: &AccessReviewCycle,
        key: IdempotencyKey,
    ) -> Result<(), DirectoryError> {
        self.policy
            .run("create access review", || self.inner.create_access_review(cycle, key))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(800));
        assert_eq!(policy.backoff(2), Duration::from_millis(1600));
        assert_eq!(policy.backoff(3), Duration::from_millis(3200));
        assert_eq!(policy.backoff(20), Duration::from_secs(60));
    }

    #[test]
    fn test_retry_after_hint_wins_but_is_capped() {
        let policy = RetryPolicy::default();
        let hinted = DirectoryError::Throttled {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(policy.delay_for(&hinted, 1), Duration::from_secs(7));

        let huge = DirectoryError::Throttled {
            retry_after: Some(Duration::from_secs(3600)),
        };
        assert_eq!(policy.delay_for(&huge, 1), Duration::from_secs(60));

        let unhinted = DirectoryError::Throttled { retry_after: None };
        assert_eq!(policy.delay_for(&unhinted, 2), Duration::from_millis(1600));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::immediate(5)
            .run("op", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(DirectoryError::Throttled { retry_after: None })
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_becomes_unknown() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(3)
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DirectoryError::Transient("HTTP 503".into()))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(DirectoryError::Unknown(msg)) => assert!(msg.contains("after 3 attempts")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_returns_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(5)
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DirectoryError::Unauthorized("403".into()))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(DirectoryError::Unauthorized(_))));
    }
}
