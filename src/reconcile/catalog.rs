//! Up-front resolution of every role and principal the desired state names.

use std::collections::{BTreeSet, HashMap};

use tracing::{info, warn};

use super::{item_failure, RunContext};
use crate::desired::{DesiredState, ReviewTarget};
use crate::directory::models::{Namespace, RoleDefinition, Scope};
use crate::directory::DirectoryClient;
use crate::error::DirectoryError;

/// (namespace, display name, scope id)
type RoleKey = (Namespace, String, String);

/// Immutable lookup table built before any write.
///
/// A `None` value records a lookup miss; items that depend on it fail
/// validation without another remote call.
#[derive(Debug, Default)]
pub struct Catalog {
    roles: HashMap<RoleKey, Option<RoleDefinition>>,
    principals: HashMap<String, Option<String>>,
}

fn role_key(namespace: Namespace, name: &str, scope: &Scope) -> RoleKey {
    (namespace, name.to_string(), scope.id.clone())
}

impl Catalog {
    /// Resolve all references in `desired`.
    ///
    /// Only fatal errors are returned; anything else becomes a miss.
    pub async fn resolve(
        directory: &dyn DirectoryClient,
        desired: &DesiredState,
        ctx: &RunContext,
    ) -> Result<Self, DirectoryError> {
        let role_refs = role_references(desired);
        let principal_refs = principal_references(desired);

        let roles = ctx
            .bounded(role_refs.into_iter().map(|(namespace, name, scope)| async move {
                let found = match directory.find_role_definition(&name, namespace, &scope).await {
                    Ok(found) => found,
                    Err(err) => {
                        let reason = item_failure(err)?;
                        warn!("Failed to look up role '{}': {}", name, reason);
                        None
                    }
                };
                Ok::<_, DirectoryError>((role_key(namespace, &name, &scope), found))
            }))
            .await
            .into_result()?;

        let principals = ctx
            .bounded(principal_refs.into_iter().map(|reference| async move {
                let found = match directory.resolve_principal(&reference).await {
                    Ok(found) => found,
                    Err(err) => {
                        let reason = item_failure(err)?;
                        warn!("Failed to resolve principal '{}': {}", reference, reason);
                        None
                    }
                };
                Ok::<_, DirectoryError>((reference, found))
            }))
            .await
            .into_result()?;

        let catalog = Self {
            roles: roles.into_iter().collect(),
            principals: principals.into_iter().collect(),
        };

        info!(
            "Resolved {}/{} roles and {}/{} principals",
            catalog.roles.values().filter(|r| r.is_some()).count(),
            catalog.roles.len(),
            catalog.principals.values().filter(|p| p.is_some()).count(),
            catalog.principals.len()
        );
        Ok(catalog)
    }

    /// Look up a resolved role.
    pub fn role(
        &self,
        namespace: Namespace,
        name: &str,
        scope: &Scope,
    ) -> Result<&RoleDefinition, String> {
        match self.roles.get(&role_key(namespace, name, scope)) {
            Some(Some(role)) => Ok(role),
            _ => Err(format!("{} role '{}' not found at {}", namespace, name, scope)),
        }
    }

    /// Object id of a principal reference, if it resolved.
    pub fn principal(&self, reference: &str) -> Option<String> {
        self.principals
            .get(reference.trim())
            .and_then(|p| p.clone())
    }
}

/// Roles referenced by role records and role-scoped reviews.
fn role_references(desired: &DesiredState) -> BTreeSet<(Namespace, String, Scope)> {
    let mut refs = BTreeSet::new();
    for role in &desired.roles {
        // An invalid scope fails the role's items later with a clearer reason.
        if let Ok(scope) = role.scope() {
            refs.insert((role.namespace, role.name.clone(), scope));
        }
    }
    for review in &desired.reviews {
        if let Ok(ReviewTarget::Role(name)) = review.target() {
            refs.insert((Namespace::Directory, name.to_string(), Scope::tenant()));
        }
    }
    refs
}

/// Grant principals, approvers, escalation approvers, reviewers.
fn principal_references(desired: &DesiredState) -> BTreeSet<String> {
    let mut refs = BTreeSet::new();
    for role in &desired.roles {
        refs.extend(role.grants.iter().map(|g| g.principal.trim().to_string()));
        if let Some(activation) = &role.activation {
            refs.extend(activation.approvers.iter().map(|a| a.trim().to_string()));
            if let Some(escalation) = &activation.escalation {
                refs.extend(escalation.approvers.iter().map(|a| a.trim().to_string()));
            }
        }
    }
    for review in &desired.reviews {
        refs.extend(review.reviewers.iter().map(|r| r.trim().to_string()));
        refs.extend(review.fallback_reviewers.iter().map(|r| r.trim().to_string()));
    }
    refs
}
