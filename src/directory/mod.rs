//! Remote identity directory access.
//!
//! This module provides:
//! - The `DirectoryClient` trait the reconcilers are written against
//! - A Microsoft Graph / Azure Resource Manager implementation
//! - A retry decorator for throttled and transient failures
//! - Directory data models

pub mod http;
pub mod models;
pub mod retry;

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;

use crate::error::DirectoryError;

pub use http::GraphDirectoryClient;
pub use models::{
    AccessReviewCycle, AccessReviewSummary, EligibilityGrant, EligibilityRequest, IdempotencyKey,
    Namespace, PolicyId, PolicyRule, RoleDefinition, Scope,
};
pub use retry::{RetryPolicy, RetryingDirectory};

/// Operations the reconcilers need from the remote directory.
///
/// Implementations never assume read-after-write consistency: a create may not
/// be visible to a following read. Lookups return `Ok(None)` for objects that
/// do not exist; every other failure is a `DirectoryError`.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Resolve a UPN or object id to a principal object id.
    async fn resolve_principal(&self, identifier: &str) -> Result<Option<String>, DirectoryError>;

    /// Look up a role by display name within a namespace.
    async fn find_role_definition(
        &self,
        name: &str,
        namespace: Namespace,
        scope: &Scope,
    ) -> Result<Option<RoleDefinition>, DirectoryError>;

    /// Find the activation policy attached to `role` at `scope`.
    ///
    /// `None` means the role is not managed by PIM at that scope.
    async fn get_policy_id(
        &self,
        role: &RoleDefinition,
        scope: &Scope,
    ) -> Result<Option<PolicyId>, DirectoryError>;

    /// Read the rules currently configured on a policy.
    ///
    /// Rules of kinds the reconciler does not manage are omitted.
    async fn get_policy_rules(&self, policy: &PolicyId) -> Result<Vec<PolicyRule>, DirectoryError>;

    /// Replace one rule of a policy.
    async fn update_policy_rule(
        &self,
        policy: &PolicyId,
        rule: &PolicyRule,
    ) -> Result<(), DirectoryError>;

    /// Find an existing eligibility for the (principal, role, scope) triple.
    async fn list_eligibility(
        &self,
        principal_id: &str,
        role: &RoleDefinition,
        scope: &Scope,
    ) -> Result<Option<EligibilityGrant>, DirectoryError>;

    /// Submit an eligibility creation request.
    ///
    /// Returns `DirectoryError::Conflict` if the grant already exists.
    async fn create_eligibility(
        &self,
        request: &EligibilityRequest,
        key: IdempotencyKey,
    ) -> Result<(), DirectoryError>;

    /// Find an access review definition by display name.
    async fn list_access_review(
        &self,
        name: &str,
    ) -> Result<Option<AccessReviewSummary>, DirectoryError>;

    /// Create a recurring access review definition.
    ///
    /// Returns `DirectoryError::Conflict` if it already exists.
    async fn create_access_review(
        &self,
        cycle: &AccessReviewCycle,
        key: IdempotencyKey,
    ) -> Result<(), DirectoryError>;
}
